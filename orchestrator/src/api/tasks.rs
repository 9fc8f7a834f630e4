use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use warp::{Rejection, Reply};

use crate::error::{ApiError, PipelineError};
use crate::models::{TaskStartRequest, TaskStartResponse};
use crate::workflow::WorkflowTracker;

pub async fn handle_start(
    request: TaskStartRequest,
    tracker: Arc<WorkflowTracker>,
    run_timeout: Duration,
) -> Result<impl Reply, Rejection> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err(warp::reject::custom(ApiError::BadRequest(
            "query must not be empty".to_string(),
        )));
    }

    let context_id = tracker
        .start(query, request.context_id)
        .await
        .map_err(|e| match e {
            PipelineError::InvalidState(message) => {
                warn!(error = %message, "Rejected task start");
                warp::reject::custom(ApiError::Conflict(message))
            }
            e => {
                error!(error = %e, "Failed to start task");
                warp::reject::custom(ApiError::Pipeline(e))
            }
        })?;

    // Finalizes the run's metrics once the validator closes it out.
    tracker.watch(context_id.clone(), run_timeout);
    info!(context_id = %context_id, "Task started via API");

    Ok(warp::reply::json(&TaskStartResponse {
        message: format!("Workflow started: {}", context_id),
        context_id,
        query: query.to_string(),
    }))
}

pub async fn handle_status(
    context_id: String,
    tracker: Arc<WorkflowTracker>,
) -> Result<impl Reply, Rejection> {
    match tracker.status(&context_id).await {
        Ok(Some(snapshot)) => Ok(warp::reply::json(&snapshot)),
        Ok(None) => Err(warp::reject::custom(ApiError::NotFound(format!(
            "task {}",
            context_id
        )))),
        Err(e) => {
            error!(context_id = %context_id, error = %e, "Failed to get task status");
            Err(warp::reject::custom(ApiError::Pipeline(e)))
        }
    }
}
