use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use twincdc_shared::{ObservabilitySystem, TwinCdcConfig, CONFIG_PATH_ENV};

/// Stream twin graph changes to event sinks.
#[derive(Parser, Debug)]
#[command(name = "twincdc", version, about)]
struct Args {
    /// Configuration file; environment variables prefixed `TWINCDC__` override it
    #[arg(short, long, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TwinCdcConfig::load_from_file(path)?,
        None => TwinCdcConfig::load()?,
    };
    config.validate()?;

    if args.check {
        println!("configuration ok: {} sink(s) enabled", config.sinks.enabled_names().len());
        return Ok(());
    }

    let observability = ObservabilitySystem::init(&config.observability)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        slot = %config.replication.slot_name,
        publication = %config.replication.publication_name,
        metrics = observability.metrics_enabled(),
        "Starting twincdc"
    );

    twincdc::app::run(config).await
}
