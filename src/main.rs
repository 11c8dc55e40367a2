use std::sync::Arc;

use clap::Parser;
use mongodb::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hookrelay::circuit_breaker::CircuitBreaker;
use hookrelay::config::{Args, Config};
use hookrelay::detector::EventTypeDetector;
use hookrelay::dlq::InMemoryDlq;
use hookrelay::queue::{DeliveryQueue, InMemoryDeliveryQueue};
use hookrelay::registry::WebhookRegistry;
use hookrelay::resume_store::{InMemoryResumeStore, ResumeStore};
use hookrelay::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    init_tracing(args.log_level.as_deref());

    if args.validate {
        info!("configuration valid");
        return Ok(());
    }

    info!(mongo_uri = %config.mongo.uri, database = %config.mongo.database, "starting hookrelay");

    let mongo_client = Client::with_uri_str(&config.mongo.uri).await?;

    // In-memory implementations of the externally-owned interfaces (§6): a real deployment
    // backs these with the platform's own persistence layer instead.
    let resume_store: Arc<dyn ResumeStore> = Arc::new(InMemoryResumeStore::new());
    let registry = Arc::new(WebhookRegistry::new());
    let dlq = Arc::new(InMemoryDlq::new());
    let queue: Arc<dyn DeliveryQueue> = Arc::new(InMemoryDeliveryQueue::new(dlq));
    let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone().into()));

    let detector = EventTypeDetector::new().with_map_overrides(config.maps.collection.clone(), config.maps.field.clone());

    let supervisor = Arc::new(Supervisor::new(
        mongo_client,
        config.change_stream_config(),
        resume_store,
        registry,
        queue,
        breaker,
        config.dispatcher_config(),
        config.retry.clone().into(),
        detector,
        config.supervisor_config(),
    ));

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_shutdown.cancel();
        }
    });

    supervisor.run(shutdown).await;
    Ok(())
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
