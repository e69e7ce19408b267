use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use common_metrics::{serve, setup_metrics_routes};
use tracing::info;

use crate::app_context::AppContext;
use crate::config::Config;

/// Serves the liveness and metrics surface only. Request intake (accepting
/// events over HTTP/queue) is out of scope here; this exists so the worker
/// pool's health can be probed and scraped the way every other service in
/// this stack is.
pub async fn start_server(config: Config, context: Arc<AppContext>) {
    let router = get_router(context);
    let router = setup_metrics_routes(router);
    let bind = format!("{}:{}", config.host, config.port);
    info!("ingest-core listening on {}", bind);
    serve(router, &bind).await.expect("failed to start server");
}

fn get_router(context: Arc<AppContext>) -> Router {
    Router::new()
        .route("/_liveness", get(liveness))
        .route("/_readiness", get(readiness))
        .with_state(context)
}

async fn liveness(State(context): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let status = context.health_registry.get_status();
    Json(serde_json::json!({ "healthy": status.healthy }))
}

async fn readiness() -> &'static str {
    "ok"
}
