//! Publish change-stream documents, pseudonymized, to the outbound topic.
use std::future::ready;
use std::sync::Arc;

use anyhow::Error;
use axum::{routing::get, Router};
use envconfig::Envconfig;
use tokio::fs::File;
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use outbound_common::metrics::{serve, setup_metrics_routes};
use outbound_worker::bulk::run_bulk;
use outbound_worker::config::{Config, Mode};
use outbound_worker::consumer::run_stream;
use outbound_worker::context::{AppContext, Liveness};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "outbound worker"
}

fn start_health_liveness_server(
    config: &Config,
    liveness: Arc<Liveness>,
) -> Result<JoinHandle<()>, Error> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.status())));
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve health and metrics on {}: {}", bind, e);
        }
    }))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().expect("Invalid configuration:");
    let context = AppContext::new(&config).await?;

    start_health_liveness_server(&config, context.liveness.clone())?;

    match config.mode {
        Mode::Stream => {
            tokio::select! {
                result = run_stream(&context) => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
            }
        }
        Mode::Bulk => {
            let file = File::open(&config.bulk_file_path).await?;
            let outcomes = run_bulk(
                &context.bulk,
                BufReader::new(file),
                config.batch_size,
                &context.liveness,
            )
            .await?;

            let failed = outcomes.iter().filter(|o| !o.is_success).count();
            info!(
                "processed {} batches from {}, {} with errors",
                outcomes.len(),
                config.bulk_file_path,
                failed
            );
        }
    }

    context.broker.flush()?;
    Ok(())
}
