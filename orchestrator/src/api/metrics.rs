use std::sync::Arc;

use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use tracing::error;
use warp::{Rejection, Reply};

use crate::error::ApiError;
use crate::metrics::MetricsCollector;

pub async fn handle_summary(metrics: Arc<MetricsCollector>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&metrics.summary().await))
}

pub async fn handle_prometheus(metrics: Arc<MetricsCollector>) -> Result<impl Reply, Rejection> {
    let buffer = metrics.encode_prometheus().map_err(|e| {
        error!(error = %e, "Failed to encode metrics");
        warp::reject::custom(ApiError::InternalError(e.to_string()))
    })?;

    Ok(warp::reply::with_header(
        buffer,
        "Content-Type",
        TextEncoder::new().format_type().to_string(),
    ))
}

pub fn service_info() -> impl Reply {
    warp::reply::json(&json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": [
            "POST /api/v1/task/start",
            "GET /api/v1/task/{context_id}",
            "GET /api/v1/agents",
            "GET /api/v1/metrics",
            "GET /api/v1/health",
            "GET /metrics"
        ]
    }))
}
