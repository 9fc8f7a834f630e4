use std::sync::Arc;

use chrono::Utc;
use warp::{Rejection, Reply};

use crate::coordinator::Coordinator;
use crate::models::{AgentsStatusResponse, HealthResponse};
use crate::workflow::WorkflowTracker;

pub async fn handle_list(coordinator: Arc<Coordinator>) -> Result<impl Reply, Rejection> {
    let agents = coordinator.status().await;
    Ok(warp::reply::json(&AgentsStatusResponse {
        total: agents.len(),
        agents,
    }))
}

pub async fn handle_health(
    coordinator: Arc<Coordinator>,
    tracker: Arc<WorkflowTracker>,
) -> Result<impl Reply, Rejection> {
    let agents_healthy = coordinator.health().await;
    Ok(warp::reply::json(&HealthResponse {
        status: if agents_healthy { "healthy" } else { "degraded" }.to_string(),
        agents_healthy,
        active_runs: tracker.active_count().await,
        timestamp: Utc::now(),
    }))
}
