//! HTTP webhook sink: one POST per event in CloudEvents structured mode

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use twincdc_core::{CloudEvent, EventSink, Result, TwinCdcError, CLOUDEVENTS_CONTENT_TYPE};
use twincdc_shared::{PerfTimer, WebhookSinkConfig};

use crate::auth::RequestAuthenticator;

pub struct WebhookSink {
    name: String,
    url: reqwest::Url,
    client: Client,
    authenticator: RequestAuthenticator,
    healthy: AtomicBool,
}

impl WebhookSink {
    pub fn new(config: &WebhookSinkConfig) -> Result<Self> {
        let url = reqwest::Url::parse(&config.url)
            .map_err(|e| TwinCdcError::ConfigError(format!("Webhook '{}' has an invalid URL: {}", config.name, e)))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| TwinCdcError::ConfigError(format!("Invalid header name {}: {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TwinCdcError::ConfigError(format!("Invalid value for header {}: {}", key, e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .default_headers(headers)
            .build()
            .map_err(|e| TwinCdcError::HttpError(format!("Failed to build HTTP client: {}", e)))?;

        info!(sink = %config.name, url = %url, "Webhook sink created");

        Ok(Self {
            name: config.name.clone(),
            url,
            client,
            authenticator: RequestAuthenticator::new(config.auth.clone()),
            healthy: AtomicBool::new(true),
        })
    }

    async fn post(&self, event: &CloudEvent) -> Result<()> {
        let body = serde_json::to_vec(event)?;
        let request = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, CLOUDEVENTS_CONTENT_TYPE)
            .body(body);
        let request = self.authenticator.apply(&self.client, request).await?;

        let response = request
            .send()
            .await
            .map_err(|e| TwinCdcError::HttpError(format!("POST {} failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TwinCdcError::HttpError(format!(
                "POST {} returned {} for event {}",
                self.url, status, event.id
            )));
        }

        debug!(event_id = %event.id, %status, "Event delivered");
        Ok(())
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, events), fields(sink = %self.name, count = events.len()))]
    async fn send(&self, events: &[CloudEvent]) -> Result<()> {
        let _timer = PerfTimer::new("twincdc_webhook_send_duration_seconds").with_label("sink", &self.name);

        for (index, event) in events.iter().enumerate() {
            if let Err(e) = self.post(event).await {
                warn!(delivered = index, error = %e, "Webhook delivery failed");
                self.healthy.store(false, Ordering::SeqCst);
                return Err(TwinCdcError::after_delivered(index, e));
            }
        }

        self.healthy.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
