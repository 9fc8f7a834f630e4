//! Per-run counters and the aggregate summary served at `/api/v1/metrics`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RunMetrics {
    pub context_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub agent_timings: HashMap<String, f64>,
    pub message_count: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

impl RunMetrics {
    fn new(context_id: &str) -> Self {
        Self {
            context_id: context_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            agent_timings: HashMap::new(),
            message_count: 0,
            success: false,
            error_message: None,
        }
    }

    /// Seconds from start to end; zero while the run is open.
    pub fn total_duration(&self) -> f64 {
        match self.ended_at {
            Some(end) => (end - self.started_at).num_milliseconds() as f64 / 1000.0,
            None => 0.0,
        }
    }

    pub fn snapshot(&self) -> RunMetricsSnapshot {
        RunMetricsSnapshot {
            context_id: self.context_id.clone(),
            total_duration: self.total_duration(),
            agent_timings: self.agent_timings.clone(),
            message_count: self.message_count,
            success: self.success,
            error_message: self.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMetricsSnapshot {
    pub context_id: String,
    pub total_duration: f64,
    pub agent_timings: HashMap<String, f64>,
    pub message_count: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total_workflows: usize,
    pub completed: usize,
    pub successful: usize,
    pub success_rate: f64,
    pub avg_duration: f64,
    pub avg_message_latency: f64,
    pub total_messages: u64,
}

#[derive(Default)]
struct MetricsState {
    runs: HashMap<String, RunMetrics>,
    latency_total: f64,
    latency_samples: u64,
}

/// Prometheus series exported at `/metrics`.
struct PipelineCounters {
    registry: Registry,
    envelopes: IntCounterVec,
    workflows_started: IntCounter,
    workflows_finished: IntCounterVec,
}

impl PipelineCounters {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let envelopes = IntCounterVec::new(
            Opts::new(
                "pipeline_envelopes_processed_total",
                "Envelopes dispatched to agent handlers",
            ),
            &["agent", "outcome"],
        )?;
        let workflows_started = IntCounter::new(
            "pipeline_workflows_started_total",
            "Workflow runs started",
        )?;
        let workflows_finished = IntCounterVec::new(
            Opts::new(
                "pipeline_workflows_finished_total",
                "Workflow runs finalized by the tracker",
            ),
            &["outcome"],
        )?;

        registry.register(Box::new(envelopes.clone()))?;
        registry.register(Box::new(workflows_started.clone()))?;
        registry.register(Box::new(workflows_finished.clone()))?;

        Ok(Self {
            registry,
            envelopes,
            workflows_started,
            workflows_finished,
        })
    }
}

/// Shared between every agent runtime and the workflow tracker; all state
/// sits behind one lock.
pub struct MetricsCollector {
    state: Mutex<MetricsState>,
    counters: PipelineCounters,
}

impl MetricsCollector {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            state: Mutex::new(MetricsState::default()),
            counters: PipelineCounters::new()?,
        })
    }

    pub async fn start_run(&self, context_id: &str) {
        self.state
            .lock()
            .await
            .runs
            .insert(context_id.to_string(), RunMetrics::new(context_id));
        self.counters.workflows_started.inc();
    }

    /// Finalizes a run. The first finalization wins; later calls are ignored.
    pub async fn end_run(&self, context_id: &str, success: bool, error: Option<String>) {
        let mut state = self.state.lock().await;
        if let Some(run) = state.runs.get_mut(context_id) {
            if run.ended_at.is_some() {
                return;
            }
            run.ended_at = Some(Utc::now());
            run.success = success;
            run.error_message = error;
            let outcome = if success { "success" } else { "failure" };
            self.counters
                .workflows_finished
                .with_label_values(&[outcome])
                .inc();
        }
    }

    pub async fn record_agent_timing(&self, context_id: &str, agent: &str, seconds: f64) {
        if let Some(run) = self.state.lock().await.runs.get_mut(context_id) {
            run.agent_timings.insert(agent.to_string(), seconds);
        }
    }

    pub async fn increment_message_count(&self, context_id: &str) {
        if let Some(run) = self.state.lock().await.runs.get_mut(context_id) {
            run.message_count += 1;
        }
    }

    /// Time an envelope spent between creation and dispatch.
    pub async fn record_message_latency(&self, seconds: f64) {
        let mut state = self.state.lock().await;
        state.latency_total += seconds;
        state.latency_samples += 1;
    }

    pub fn record_envelope(&self, agent: &str, outcome: &str) {
        self.counters
            .envelopes
            .with_label_values(&[agent, outcome])
            .inc();
    }

    pub async fn snapshot(&self, context_id: &str) -> Option<RunMetricsSnapshot> {
        self.state
            .lock()
            .await
            .runs
            .get(context_id)
            .map(RunMetrics::snapshot)
    }

    pub async fn summary(&self) -> MetricsSummary {
        let state = self.state.lock().await;

        let total_workflows = state.runs.len();
        let total_messages = state.runs.values().map(|r| r.message_count).sum();
        let avg_message_latency = if state.latency_samples == 0 {
            0.0
        } else {
            state.latency_total / state.latency_samples as f64
        };

        let completed: Vec<&RunMetrics> = state
            .runs
            .values()
            .filter(|r| r.ended_at.is_some())
            .collect();
        if completed.is_empty() {
            return MetricsSummary {
                total_workflows,
                avg_message_latency,
                total_messages,
                ..MetricsSummary::default()
            };
        }

        let successful = completed.iter().filter(|r| r.success).count();
        let total_duration: f64 = completed.iter().map(|r| r.total_duration()).sum();

        MetricsSummary {
            total_workflows,
            completed: completed.len(),
            successful,
            success_rate: successful as f64 / completed.len() as f64,
            avg_duration: total_duration / completed.len() as f64,
            avg_message_latency,
            total_messages,
        }
    }

    /// Prometheus text exposition of the pipeline counters.
    pub fn encode_prometheus(&self) -> prometheus::Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.counters.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
