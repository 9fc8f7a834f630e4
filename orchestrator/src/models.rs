use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(PipelineError::InvalidState(format!("unknown run status '{}'", other))),
        }
    }
}

/// Persisted lifecycle of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub context_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AgentLog {
    pub id: i64,
    pub context_id: String,
    pub agent_name: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub duration: Option<f64>,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResultRecord {
    pub id: i64,
    pub context_id: String,
    pub agent_name: String,
    pub result_type: String,
    pub result_data: String,
    pub created_at: DateTime<Utc>,
    pub validated: bool,
}

// API Request/Response models
#[derive(Debug, Deserialize)]
pub struct TaskStartRequest {
    pub query: String,
    #[serde(default)]
    pub context_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskStartResponse {
    pub context_id: String,
    pub message: String,
    pub query: String,
}

/// Status view of a run: the persisted record joined with live metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub context_id: String,
    pub status: RunStatus,
    pub success: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub results_count: usize,
    pub metrics: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub name: String,
    pub running: bool,
    pub input_channel: String,
    pub output_channel: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentsStatusResponse {
    pub agents: BTreeMap<String, AgentStatus>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub agents_healthy: bool,
    pub active_runs: usize,
    pub timestamp: DateTime<Utc>,
}
