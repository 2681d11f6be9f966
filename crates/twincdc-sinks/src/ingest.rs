//! Queued ingestion client for Kusto-compatible REST endpoints
//!
//! `ingest` only enqueues; a background worker posts each request to
//! `/v1/rest/ingest/{database}/{table}?streamFormat=MultiJSON` and records
//! the outcome, which callers read back through `take_completed`.

use bytes::Bytes;
use dashmap::DashMap;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use twincdc_core::{Result, TwinCdcError};
use uuid::Uuid;

use crate::auth::RequestAuthenticator;

const DEFAULT_QUEUE_CAPACITY: usize = 256;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionStatus {
    Pending,
    Succeeded,
    Failed { reason: String },
}

impl IngestionStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, IngestionStatus::Pending)
    }
}

#[derive(Debug)]
struct IngestionRequest {
    operation_id: Uuid,
    database: String,
    table: String,
    body: Bytes,
}

pub struct QueuedIngestClient {
    tx: Mutex<Option<mpsc::Sender<IngestionRequest>>>,
    statuses: Arc<DashMap<Uuid, IngestionStatus>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedIngestClient {
    /// Start the client and its worker. Must be called inside a runtime.
    pub fn start(ingestion_uri: reqwest::Url, authenticator: RequestAuthenticator) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TwinCdcError::HttpError(format!("Failed to build HTTP client: {}", e)))?;

        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        let statuses = Arc::new(DashMap::new());
        let worker = tokio::spawn(ingest_worker(
            client,
            ingestion_uri,
            authenticator,
            statuses.clone(),
            rx,
        ));

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            statuses,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue newline-delimited JSON for a table; returns the operation id.
    pub async fn ingest(&self, database: &str, table: &str, body: Bytes) -> Result<Uuid> {
        let operation_id = Uuid::new_v4();
        let tx = self
            .tx
            .lock()
            .await
            .clone()
            .ok_or_else(|| TwinCdcError::sink("Ingestion client is closed"))?;

        self.statuses.insert(operation_id, IngestionStatus::Pending);
        let request = IngestionRequest {
            operation_id,
            database: database.to_string(),
            table: table.to_string(),
            body,
        };
        if tx.send(request).await.is_err() {
            self.statuses.remove(&operation_id);
            return Err(TwinCdcError::sink("Ingestion worker stopped"));
        }
        Ok(operation_id)
    }

    pub fn status(&self, operation_id: &Uuid) -> Option<IngestionStatus> {
        self.statuses.get(operation_id).map(|entry| entry.value().clone())
    }

    pub fn pending(&self) -> usize {
        self.statuses.iter().filter(|entry| entry.value().is_pending()).count()
    }

    /// Remove and return every finished operation.
    pub fn take_completed(&self) -> Vec<(Uuid, IngestionStatus)> {
        let finished: Vec<Uuid> = self
            .statuses
            .iter()
            .filter(|entry| !entry.value().is_pending())
            .map(|entry| *entry.key())
            .collect();

        finished
            .into_iter()
            .filter_map(|id| self.statuses.remove(&id))
            .collect()
    }

    /// Stop accepting work and wait for queued requests to finish.
    pub async fn close(&self) {
        self.tx.lock().await.take();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Ingestion worker ended abnormally");
            }
        }
    }
}

async fn ingest_worker(
    client: Client,
    base: reqwest::Url,
    authenticator: RequestAuthenticator,
    statuses: Arc<DashMap<Uuid, IngestionStatus>>,
    mut rx: mpsc::Receiver<IngestionRequest>,
) {
    while let Some(request) = rx.recv().await {
        let status = match post(&client, &base, &authenticator, &request).await {
            Ok(()) => {
                debug!(operation_id = %request.operation_id, table = %request.table, "Ingestion succeeded");
                IngestionStatus::Succeeded
            }
            Err(e) => {
                warn!(operation_id = %request.operation_id, table = %request.table, error = %e, "Ingestion failed");
                IngestionStatus::Failed { reason: e.to_string() }
            }
        };
        statuses.insert(request.operation_id, status);
    }
    info!("Ingestion worker stopped");
}

fn ingest_url(base: &reqwest::Url, database: &str, table: &str) -> Result<reqwest::Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| TwinCdcError::ConfigError(format!("Ingestion URI cannot be a base: {}", base)))?
        .pop_if_empty()
        .extend(["v1", "rest", "ingest", database, table]);
    url.query_pairs_mut().append_pair("streamFormat", "MultiJSON");
    Ok(url)
}

async fn post(
    client: &Client,
    base: &reqwest::Url,
    authenticator: &RequestAuthenticator,
    request: &IngestionRequest,
) -> Result<()> {
    let url = ingest_url(base, &request.database, &request.table)?;
    let builder = client
        .post(url.clone())
        .header(CONTENT_TYPE, "application/json")
        .body(request.body.clone());
    let builder = authenticator.apply(client, builder).await?;

    let response = builder
        .send()
        .await
        .map_err(|e| TwinCdcError::HttpError(format!("POST {} failed: {}", url, e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        return Err(TwinCdcError::HttpError(format!("POST {} returned {}: {}", url, status, detail)));
    }
    Ok(())
}
