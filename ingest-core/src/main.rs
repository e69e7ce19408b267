use std::sync::Arc;

use ingest_core::app_context::AppContext;
use ingest_core::config::Config;
use ingest_core::server::start_server;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

common_alloc::used!();

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    info!("starting up...");

    let config = Config::init_with_defaults()?;
    let context = Arc::new(AppContext::new(config.clone()).await?);
    context.worker_liveness.report_healthy().await;

    start_server(config, context).await;

    Ok(())
}
