//! Persisted run state: run records, agent action logs and agent results.
//!
//! The core talks to the store only through [`StateStore`]; every call is
//! treated as atomic on its own.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{AgentLog, ResultRecord, RunRecord, RunStatus};

pub type DbPool = Pool<Postgres>;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Inserts a new run with status `running`.
    async fn create_run(&self, context_id: &str) -> Result<()>;

    /// Sets status and outcome. Terminal statuses also stamp `completed_at`.
    async fn update_run(
        &self,
        context_id: &str,
        status: RunStatus,
        success: bool,
        error: Option<&str>,
    ) -> Result<()>;

    /// Marks the run `failed` with `error` unless it already reached a
    /// terminal status. Returns whether the record changed.
    async fn fail_if_running(&self, context_id: &str, error: &str) -> Result<bool>;

    async fn append_log(
        &self,
        context_id: &str,
        agent_name: &str,
        action: &str,
        duration: Option<f64>,
        details: Option<&str>,
    ) -> Result<()>;

    async fn append_result(
        &self,
        context_id: &str,
        agent_name: &str,
        result_type: &str,
        result_data: &str,
        validated: bool,
    ) -> Result<()>;

    async fn get_run(&self, context_id: &str) -> Result<Option<RunRecord>>;

    async fn list_results(&self, context_id: &str) -> Result<Vec<ResultRecord>>;
}

/// Writes an agent log entry, downgrading failure to a warning.
pub async fn log_best_effort(
    store: &dyn StateStore,
    context_id: &str,
    agent_name: &str,
    action: &str,
    duration: Option<f64>,
    details: Option<&str>,
) {
    if let Err(e) = store
        .append_log(context_id, agent_name, action, duration, details)
        .await
    {
        warn!(context_id = %context_id, agent = %agent_name, error = %e, "Failed to log agent action");
    }
}

/// Persists an agent result, downgrading failure to a warning.
pub async fn save_result_best_effort(
    store: &dyn StateStore,
    context_id: &str,
    agent_name: &str,
    result_type: &str,
    result_data: &str,
    validated: bool,
) {
    if let Err(e) = store
        .append_result(context_id, agent_name, result_type, result_data, validated)
        .await
    {
        warn!(context_id = %context_id, agent = %agent_name, error = %e, "Failed to save result");
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    context_id: String,
    status: String,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    success: bool,
    error_message: Option<String>,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = PipelineError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(RunRecord {
            context_id: row.context_id,
            status: row.status.parse()?,
            created_at: row.created_at,
            completed_at: row.completed_at,
            success: row.success,
            error_message: row.error_message,
        })
    }
}

#[derive(Clone)]
pub struct PgStateStore {
    pool: DbPool,
}

impl PgStateStore {
    /// Opens the pool and applies pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| PipelineError::Persistence(e.into()))?;
        info!("Database migrations applied");

        Ok(Self { pool })
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn create_run(&self, context_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO runs (context_id, status, created_at) VALUES ($1, $2, NOW())")
            .bind(context_id)
            .bind(RunStatus::Running.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    PipelineError::InvalidState(format!("run {} already exists", context_id))
                }
                e => e.into(),
            })?;
        info!(context_id = %context_id, "Created run");
        Ok(())
    }

    async fn update_run(
        &self,
        context_id: &str,
        status: RunStatus,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE runs
             SET status = $2,
                 success = $3,
                 error_message = COALESCE($4, error_message),
                 completed_at = CASE WHEN $5 THEN NOW() ELSE completed_at END
             WHERE context_id = $1",
        )
        .bind(context_id)
        .bind(status.as_str())
        .bind(success)
        .bind(error)
        .bind(status.is_terminal())
        .execute(&self.pool)
        .await?;
        info!(context_id = %context_id, status = %status, "Updated run status");
        Ok(())
    }

    async fn fail_if_running(&self, context_id: &str, error: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE runs
             SET status = $2, success = FALSE, error_message = $3, completed_at = NOW()
             WHERE context_id = $1 AND status NOT IN ($4, $5)",
        )
        .bind(context_id)
        .bind(RunStatus::Failed.as_str())
        .bind(error)
        .bind(RunStatus::Completed.as_str())
        .bind(RunStatus::Failed.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;
        if updated {
            info!(context_id = %context_id, status = %RunStatus::Failed, "Updated run status");
        }
        Ok(updated)
    }

    async fn append_log(
        &self,
        context_id: &str,
        agent_name: &str,
        action: &str,
        duration: Option<f64>,
        details: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_logs (context_id, agent_name, action, timestamp, duration, details)
             VALUES ($1, $2, $3, NOW(), $4, $5)",
        )
        .bind(context_id)
        .bind(agent_name)
        .bind(action)
        .bind(duration)
        .bind(details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_result(
        &self,
        context_id: &str,
        agent_name: &str,
        result_type: &str,
        result_data: &str,
        validated: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO results (context_id, agent_name, result_type, result_data, created_at, validated)
             VALUES ($1, $2, $3, $4, NOW(), $5)",
        )
        .bind(context_id)
        .bind(agent_name)
        .bind(result_type)
        .bind(result_data)
        .bind(validated)
        .execute(&self.pool)
        .await?;
        info!(context_id = %context_id, agent = %agent_name, result_type = %result_type, "Saved result");
        Ok(())
    }

    async fn get_run(&self, context_id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query_as::<_, RunRow>(
            "SELECT context_id, status, created_at, completed_at, success, error_message
             FROM runs WHERE context_id = $1",
        )
        .bind(context_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn list_results(&self, context_id: &str) -> Result<Vec<ResultRecord>> {
        let results = sqlx::query_as::<_, ResultRecord>(
            "SELECT id, context_id, agent_name, result_type, result_data, created_at, validated
             FROM results WHERE context_id = $1 ORDER BY id",
        )
        .bind(context_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(results)
    }
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<String, RunRecord>,
    logs: Vec<AgentLog>,
    results: Vec<ResultRecord>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store for running without Postgres.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) async fn logs_for(&self, context_id: &str) -> Vec<AgentLog> {
        self.state
            .lock()
            .await
            .logs
            .iter()
            .filter(|log| log.context_id == context_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_run(&self, context_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.runs.contains_key(context_id) {
            return Err(PipelineError::InvalidState(format!(
                "run {} already exists",
                context_id
            )));
        }
        state.runs.insert(
            context_id.to_string(),
            RunRecord {
                context_id: context_id.to_string(),
                status: RunStatus::Running,
                created_at: Utc::now(),
                completed_at: None,
                success: false,
                error_message: None,
            },
        );
        Ok(())
    }

    async fn update_run(
        &self,
        context_id: &str,
        status: RunStatus,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        if let Some(run) = self.state.lock().await.runs.get_mut(context_id) {
            run.status = status;
            run.success = success;
            if let Some(error) = error {
                run.error_message = Some(error.to_string());
            }
            if status.is_terminal() {
                run.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn fail_if_running(&self, context_id: &str, error: &str) -> Result<bool> {
        match self.state.lock().await.runs.get_mut(context_id) {
            Some(run) if !run.status.is_terminal() => {
                run.status = RunStatus::Failed;
                run.success = false;
                run.error_message = Some(error.to_string());
                run.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_log(
        &self,
        context_id: &str,
        agent_name: &str,
        action: &str,
        duration: Option<f64>,
        details: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.logs.push(AgentLog {
            id,
            context_id: context_id.to_string(),
            agent_name: agent_name.to_string(),
            action: action.to_string(),
            timestamp: Utc::now(),
            duration,
            details: details.map(str::to_string),
        });
        Ok(())
    }

    async fn append_result(
        &self,
        context_id: &str,
        agent_name: &str,
        result_type: &str,
        result_data: &str,
        validated: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.results.push(ResultRecord {
            id,
            context_id: context_id.to_string(),
            agent_name: agent_name.to_string(),
            result_type: result_type.to_string(),
            result_data: result_data.to_string(),
            created_at: Utc::now(),
            validated,
        });
        Ok(())
    }

    async fn get_run(&self, context_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.state.lock().await.runs.get(context_id).cloned())
    }

    async fn list_results(&self, context_id: &str) -> Result<Vec<ResultRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .results
            .iter()
            .filter(|r| r.context_id == context_id)
            .cloned()
            .collect())
    }
}
