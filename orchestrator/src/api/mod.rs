use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use warp::{Filter, Rejection, Reply};

use crate::coordinator::Coordinator;
use crate::metrics::MetricsCollector;
use crate::workflow::WorkflowTracker;

mod agents;
mod metrics;
mod tasks;

/// Shared handles the HTTP layer reads from.
#[derive(Clone)]
pub struct ApiContext {
    pub coordinator: Arc<Coordinator>,
    pub tracker: Arc<WorkflowTracker>,
    pub metrics: Arc<MetricsCollector>,
    /// Deadline for the background completion watch started per task.
    pub run_timeout: Duration,
}

pub fn routes(ctx: ApiContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let api = warp::path("api").and(warp::path("v1"));

    let start_route = api
        .and(warp::path("task"))
        .and(warp::path("start"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_tracker(ctx.tracker.clone()))
        .and(with_timeout(ctx.run_timeout))
        .and_then(tasks::handle_start);

    let status_route = api
        .and(warp::path("task"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::get())
        .and(with_tracker(ctx.tracker.clone()))
        .and_then(tasks::handle_status);

    let agents_route = api
        .and(warp::path("agents"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_coordinator(ctx.coordinator.clone()))
        .and_then(agents::handle_list);

    let health_route = api
        .and(warp::path("health"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_coordinator(ctx.coordinator.clone()))
        .and(with_tracker(ctx.tracker.clone()))
        .and_then(agents::handle_health);

    let summary_route = api
        .and(warp::path("metrics"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_metrics(ctx.metrics.clone()))
        .and_then(metrics::handle_summary);

    let prometheus_route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_metrics(ctx.metrics.clone()))
        .and_then(metrics::handle_prometheus);

    let root_route = warp::path::end()
        .and(warp::get())
        .map(metrics::service_info);

    start_route
        .or(status_route)
        .or(agents_route)
        .or(health_route)
        .or(summary_route)
        .or(prometheus_route)
        .or(root_route)
}

fn with_coordinator(
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = (Arc<Coordinator>,), Error = Infallible> + Clone {
    warp::any().map(move || coordinator.clone())
}

fn with_tracker(
    tracker: Arc<WorkflowTracker>,
) -> impl Filter<Extract = (Arc<WorkflowTracker>,), Error = Infallible> + Clone {
    warp::any().map(move || tracker.clone())
}

fn with_metrics(
    metrics: Arc<MetricsCollector>,
) -> impl Filter<Extract = (Arc<MetricsCollector>,), Error = Infallible> + Clone {
    warp::any().map(move || metrics.clone())
}

fn with_timeout(
    timeout: Duration,
) -> impl Filter<Extract = (Duration,), Error = Infallible> + Clone {
    warp::any().map(move || timeout)
}
