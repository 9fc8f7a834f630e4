//! Starts runs and reports on them.
//!
//! Completion is driven by the terminal stage writing the run record; the
//! tracker only seeds the pipeline and reads the outcome back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agents::{RESEARCHER_AGENT, RESEARCHER_CHANNEL};
use crate::envelope::{payload, Envelope};
use crate::error::{PipelineError, Result};
use crate::models::{RunSnapshot, RunStatus};
use crate::runtime::Services;

pub const WORKFLOW_RUNNER: &str = "workflow_runner";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct ActiveRun {
    query: String,
    started_at: DateTime<Utc>,
}

pub struct WorkflowTracker {
    services: Services,
    entry_agent: String,
    entry_channel: String,
    poll_interval: Duration,
    active: Mutex<HashMap<String, ActiveRun>>,
}

impl WorkflowTracker {
    /// Seeds runs into the researcher stage.
    pub fn new(services: Services) -> Self {
        Self {
            services,
            entry_agent: RESEARCHER_AGENT.to_string(),
            entry_channel: RESEARCHER_CHANNEL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Registers a run and publishes its seed envelope. Does not wait for
    /// the pipeline.
    pub async fn start(&self, query: &str, context_id: Option<String>) -> Result<String> {
        let context_id = context_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info!(context_id = %context_id, query = %query, "Starting workflow");

        let Services { bus, store, metrics } = &self.services;

        // Creating the record first keeps a duplicate id from resetting the
        // metrics of the run that owns it.
        store.create_run(&context_id).await?;
        metrics.start_run(&context_id).await;

        let seed = Envelope::new(
            context_id.as_str(),
            WORKFLOW_RUNNER,
            self.entry_agent.as_str(),
            payload(json!({ "query": query })),
        );
        if let Err(e) = bus.publish(&self.entry_channel, seed.to_bytes()?).await {
            let reason = format!("Seed publish failed: {}", e);
            metrics.end_run(&context_id, false, Some(reason.clone())).await;
            if let Err(e) = store
                .update_run(&context_id, RunStatus::Failed, false, Some(reason.as_str()))
                .await
            {
                warn!(context_id = %context_id, error = %e, "Failed to mark run failed");
            }
            return Err(e);
        }

        self.active.lock().await.insert(
            context_id.clone(),
            ActiveRun {
                query: query.to_string(),
                started_at: Utc::now(),
            },
        );

        info!(context_id = %context_id, "Workflow initiated");
        Ok(context_id)
    }

    /// Run record joined with its live metrics. `None` for an unknown id.
    pub async fn status(&self, context_id: &str) -> Result<Option<RunSnapshot>> {
        let Some(run) = self.services.store.get_run(context_id).await? else {
            return Ok(None);
        };
        let results = self.services.store.list_results(context_id).await?;
        let metrics = match self.services.metrics.snapshot(context_id).await {
            Some(snapshot) => serde_json::to_value(snapshot)?,
            None => json!({}),
        };

        Ok(Some(RunSnapshot {
            context_id: run.context_id,
            status: run.status,
            success: run.success,
            created_at: run.created_at,
            completed_at: run.completed_at,
            error_message: run.error_message,
            results_count: results.len(),
            metrics,
        }))
    }

    /// Polls the run record until it is terminal or `timeout` passes, then
    /// finalizes the run's metrics. A timeout marks the run failed.
    pub async fn await_completion(&self, context_id: &str, timeout: Duration) -> bool {
        info!(context_id = %context_id, "Waiting for workflow completion");
        let deadline = Instant::now() + timeout;
        let metrics = &self.services.metrics;

        let outcome = loop {
            match self.services.store.get_run(context_id).await {
                Ok(Some(run)) if run.status.is_terminal() => {
                    let success = run.status == RunStatus::Completed && run.success;
                    metrics.end_run(context_id, success, run.error_message).await;
                    info!(context_id = %context_id, success, "Workflow finished");
                    break Some(success);
                }
                Ok(_) => {}
                Err(e) => warn!(context_id = %context_id, error = %e, "Failed to read run record"),
            }

            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        };

        if let Some(run) = self.active.lock().await.remove(context_id) {
            let elapsed = (Utc::now() - run.started_at).num_milliseconds();
            info!(context_id = %context_id, query = %run.query, elapsed_ms = elapsed, "Workflow no longer tracked");
        }

        match outcome {
            Some(success) => success,
            None => {
                let reason = PipelineError::Timeout {
                    context_id: context_id.to_string(),
                    elapsed: timeout,
                }
                .to_string();
                warn!(context_id = %context_id, "{}", reason);

                // The run may have finished after the last poll.
                match self.services.store.fail_if_running(context_id, &reason).await {
                    Ok(false) => {
                        if let Ok(Some(run)) = self.services.store.get_run(context_id).await {
                            if run.status.is_terminal() {
                                let success = run.status == RunStatus::Completed && run.success;
                                metrics.end_run(context_id, success, run.error_message).await;
                                info!(context_id = %context_id, success, "Workflow finished at deadline");
                                return success;
                            }
                        }
                    }
                    Ok(true) => {}
                    Err(e) => {
                        error!(context_id = %context_id, error = %e, "Failed to mark run timed out")
                    }
                }
                metrics.end_run(context_id, false, Some(reason)).await;
                false
            }
        }
    }

    /// Runs [`WorkflowTracker::await_completion`] in the background.
    pub fn watch(self: &Arc<Self>, context_id: String, timeout: Duration) -> JoinHandle<bool> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move { tracker.await_completion(&context_id, timeout).await })
    }

    /// Runs started here that have not been awaited yet.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{pipeline_stages, HeuristicSummary};
    use crate::bus::Transport;
    use crate::coordinator::Coordinator;
    use crate::store::StateStore;
    use crate::test_support::{memory_services, wait_for_listener};
    use futures::StreamExt;
    use std::collections::HashSet;

    #[tokio::test]
    async fn start_creates_running_record_and_seeds_first_stage() {
        let (services, transport, store) = memory_services();
        services.bus.connect().await.unwrap();
        let mut entry = transport.listen(RESEARCHER_CHANNEL).await.unwrap();
        let tracker = WorkflowTracker::new(services.clone());

        let context_id = tracker.start("machine learning", None).await.unwrap();
        assert!(!context_id.is_empty());

        let run = store.get_run(&context_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(services.metrics.snapshot(&context_id).await.is_some());
        assert_eq!(tracker.active_count().await, 1);

        let seed = Envelope::decode(entry.next().await.unwrap()).unwrap();
        assert_eq!(seed.context_id, context_id);
        assert_eq!(seed.sender, WORKFLOW_RUNNER);
        assert_eq!(seed.receiver, RESEARCHER_AGENT);
        assert_eq!(seed.payload_str("query"), "machine learning");
    }

    #[tokio::test]
    async fn start_honours_a_supplied_context_id() {
        let (services, _, _) = memory_services();
        let tracker = WorkflowTracker::new(services);

        let context_id = tracker.start("q", Some("custom-1".to_string())).await.unwrap();
        assert_eq!(context_id, "custom-1");
        assert!(tracker.start("q", Some("custom-1".to_string())).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_starts_get_distinct_ids() {
        let (services, _, _) = memory_services();
        let tracker = Arc::new(WorkflowTracker::new(services));

        let starts = (0..20).map(|i| {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.start(&format!("query {i}"), None).await.unwrap() })
        });
        let ids: HashSet<String> = futures::future::join_all(starts)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(ids.len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn seed_publish_failure_fails_the_run() {
        let (services, transport, store) = memory_services();
        services.bus.connect().await.unwrap();
        transport.fail_next_publishes(1);
        let tracker = WorkflowTracker::new(services.clone());

        assert!(tracker.start("q", Some("c1".to_string())).await.is_err());
        let run = store.get_run("c1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(!services.metrics.snapshot("c1").await.unwrap().success);
        assert_eq!(tracker.active_count().await, 0);
    }

    #[tokio::test]
    async fn status_of_unknown_run_is_absent() {
        let (services, _, _) = memory_services();
        let tracker = WorkflowTracker::new(services);
        assert!(tracker.status("unknown-id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_without_metrics_has_empty_mapping() {
        let (services, _, store) = memory_services();
        store.create_run("orphan").await.unwrap();
        let tracker = WorkflowTracker::new(services);

        let snapshot = tracker.status("orphan").await.unwrap().unwrap();
        assert_eq!(snapshot.status, RunStatus::Running);
        assert_eq!(snapshot.results_count, 0);
        assert_eq!(snapshot.metrics, json!({}));
    }

    #[tokio::test]
    async fn await_completion_times_out_and_fails_the_run() {
        let (services, _, store) = memory_services();
        store.create_run("c1").await.unwrap();
        services.metrics.start_run("c1").await;
        let tracker = WorkflowTracker::new(services.clone());

        let started = std::time::Instant::now();
        assert!(!tracker.await_completion("c1", Duration::from_millis(100)).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));

        let run = store.get_run("c1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.unwrap().contains("timed out"));

        let snapshot = services.metrics.snapshot("c1").await.unwrap();
        assert!(!snapshot.success);
        assert!(snapshot.error_message.unwrap().contains("timed out"));
    }

    /// Completes a running record right after handing it out, so the run
    /// finishes between the tracker's last poll and its deadline.
    struct CompletesAfterRead(Arc<crate::store::MemoryStateStore>);

    #[async_trait::async_trait]
    impl StateStore for CompletesAfterRead {
        async fn create_run(&self, context_id: &str) -> Result<()> {
            self.0.create_run(context_id).await
        }

        async fn update_run(
            &self,
            context_id: &str,
            status: RunStatus,
            success: bool,
            error: Option<&str>,
        ) -> Result<()> {
            self.0.update_run(context_id, status, success, error).await
        }

        async fn fail_if_running(&self, context_id: &str, error: &str) -> Result<bool> {
            self.0.fail_if_running(context_id, error).await
        }

        async fn append_log(
            &self,
            context_id: &str,
            agent_name: &str,
            action: &str,
            duration: Option<f64>,
            details: Option<&str>,
        ) -> Result<()> {
            self.0
                .append_log(context_id, agent_name, action, duration, details)
                .await
        }

        async fn append_result(
            &self,
            context_id: &str,
            agent_name: &str,
            result_type: &str,
            result_data: &str,
            validated: bool,
        ) -> Result<()> {
            self.0
                .append_result(context_id, agent_name, result_type, result_data, validated)
                .await
        }

        async fn get_run(&self, context_id: &str) -> Result<Option<crate::models::RunRecord>> {
            let run = self.0.get_run(context_id).await?;
            if matches!(&run, Some(r) if r.status == RunStatus::Running) {
                self.0
                    .update_run(context_id, RunStatus::Completed, true, None)
                    .await?;
            }
            Ok(run)
        }

        async fn list_results(
            &self,
            context_id: &str,
        ) -> Result<Vec<crate::models::ResultRecord>> {
            self.0.list_results(context_id).await
        }
    }

    #[tokio::test]
    async fn timeout_keeps_a_run_that_completed_after_the_last_poll() {
        let (services, _, inner) = memory_services();
        let services = Services {
            store: Arc::new(CompletesAfterRead(inner.clone())),
            ..services
        };
        inner.create_run("c1").await.unwrap();
        services.metrics.start_run("c1").await;
        let tracker = WorkflowTracker::new(services.clone());

        assert!(tracker.await_completion("c1", Duration::ZERO).await);

        let run = inner.get_run("c1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.success);
        assert!(run.error_message.is_none());
        assert!(services.metrics.snapshot("c1").await.unwrap().success);
    }

    #[tokio::test]
    async fn await_completion_reports_the_record_outcome() {
        let (services, _, store) = memory_services();
        store.create_run("c1").await.unwrap();
        services.metrics.start_run("c1").await;
        store
            .update_run("c1", RunStatus::Completed, true, None)
            .await
            .unwrap();
        let tracker = WorkflowTracker::new(services.clone());

        assert!(tracker.await_completion("c1", Duration::from_secs(1)).await);
        assert!(services.metrics.snapshot("c1").await.unwrap().success);
        assert_eq!(services.metrics.summary().await.completed, 1);
    }

    #[tokio::test]
    async fn full_pipeline_run_completes() {
        let (services, transport, _) = memory_services();
        let coordinator = Coordinator::new(
            pipeline_stages(
                services.store.clone(),
                Arc::new(HeuristicSummary),
                Duration::ZERO,
            ),
            services.clone(),
        );
        coordinator.start_all().await.unwrap();
        for channel in ["researcher_input", "summarizer_input", "validator_input"] {
            wait_for_listener(&transport, channel).await;
        }

        let tracker = Arc::new(
            WorkflowTracker::new(services.clone()).with_poll_interval(Duration::from_millis(20)),
        );
        let context_id = tracker.start("machine learning", None).await.unwrap();
        let success = tracker.watch(context_id.clone(), Duration::from_secs(5)).await.unwrap();
        assert!(success);

        let snapshot = tracker.status(&context_id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert!(snapshot.success);
        assert_eq!(snapshot.results_count, 2);
        assert_eq!(snapshot.metrics["success"], json!(true));
        assert_eq!(tracker.active_count().await, 0);

        coordinator.stop_all().await;
    }
}
