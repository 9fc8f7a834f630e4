// Validator Agent: checks the summary and closes out the run

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::VALIDATOR_AGENT;
use crate::envelope::{Envelope, Payload};
use crate::error::Result;
use crate::models::RunStatus;
use crate::runtime::{AgentHandler, Outbox};
use crate::store::{log_best_effort, save_result_best_effort, StateStore};

const MIN_SUMMARY_CHARS: usize = 10;
const MAX_SUMMARY_CHARS: usize = 500;
const MIN_WORDS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub valid: bool,
    pub checks: Vec<String>,
}

impl Validation {
    pub fn report(&self) -> String {
        self.checks.join("\n")
    }
}

/// Length, relevance and word-count checks. A missing query term only warns.
pub fn validate(summary: &str, query: &str) -> Validation {
    let mut checks = Vec::new();
    let mut valid = true;
    let length = summary.chars().count();

    if length < MIN_SUMMARY_CHARS {
        checks.push("❌ Summary too short".to_string());
        valid = false;
    } else {
        checks.push("✓ Summary length acceptable".to_string());
    }

    if length > MAX_SUMMARY_CHARS {
        checks.push("❌ Summary too long".to_string());
        valid = false;
    } else {
        checks.push("✓ Summary length within limits".to_string());
    }

    if !query.is_empty() && !summary.to_lowercase().contains(&query.to_lowercase()) {
        checks.push("⚠ Query term not found in summary".to_string());
    } else {
        checks.push("✓ Query relevance confirmed".to_string());
    }

    let words = summary.split_whitespace().count();
    if words < MIN_WORDS {
        checks.push("❌ Insufficient content".to_string());
        valid = false;
    } else {
        checks.push(format!("✓ Word count: {}", words));
    }

    Validation { valid, checks }
}

pub struct ValidatorAgent {
    store: Arc<dyn StateStore>,
}

impl ValidatorAgent {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AgentHandler for ValidatorAgent {
    async fn handle(&self, envelope: Envelope, _outbox: &Outbox) -> Result<()> {
        let context_id = envelope.context_id.as_str();
        info!(context_id = %context_id, "Validating summary");

        let outcome = self.run(context_id, &envelope.payload).await?;
        let valid = outcome["valid"].as_bool().unwrap_or(false);
        let report = outcome["report"].as_str().unwrap_or_default();

        save_result_best_effort(
            self.store.as_ref(),
            context_id,
            VALIDATOR_AGENT,
            "validation",
            report,
            valid,
        )
        .await;

        // Terminal stage: this write is what marks the run complete.
        let error = (!valid).then_some("Validation failed");
        self.store
            .update_run(context_id, RunStatus::Completed, valid, error)
            .await
    }

    async fn run(&self, context_id: &str, params: &Payload) -> Result<Value> {
        let summary = params.get("summary").and_then(Value::as_str).unwrap_or_default();
        let query = params.get("query").and_then(Value::as_str).unwrap_or_default();

        let validation = validate(summary, query);
        let report = validation.report();

        log_best_effort(
            self.store.as_ref(),
            context_id,
            VALIDATOR_AGENT,
            "validation_completed",
            None,
            Some(format!("Valid: {}\n{}", validation.valid, report).as_str()),
        )
        .await;

        info!(context_id = %context_id, valid = validation.valid, "Validation result");
        Ok(json!({ "valid": validation.valid, "report": report }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::payload;
    use crate::store::MemoryStateStore;
    use crate::test_support::memory_services;

    #[test]
    fn accepts_a_relevant_summary() {
        let outcome = validate("Machine learning models improve with more data.", "machine learning");
        assert!(outcome.valid);
        assert_eq!(outcome.checks.len(), 4);
        assert!(outcome.checks.iter().all(|c| c.starts_with('✓')));
    }

    #[test]
    fn rejects_short_and_sparse_summaries() {
        let outcome = validate("tiny", "");
        assert!(!outcome.valid);
        assert!(outcome.report().contains("Summary too short"));
        assert!(outcome.report().contains("Insufficient content"));
    }

    #[test]
    fn rejects_overlong_summary() {
        let outcome = validate(&"word ".repeat(200), "");
        assert!(!outcome.valid);
        assert!(outcome.report().contains("Summary too long"));
    }

    #[test]
    fn missing_query_term_only_warns() {
        let outcome = validate("This summary talks about something else.", "quantum");
        assert!(outcome.valid);
        assert!(outcome.report().contains("⚠ Query term not found"));
    }

    #[tokio::test]
    async fn handle_completes_the_run() {
        let (services, _, store) = memory_services();
        store.create_run("c1").await.unwrap();
        let agent = ValidatorAgent::new(store.clone());
        let outbox = Outbox::new(VALIDATOR_AGENT, None, services.bus.clone());

        let envelope = Envelope::new(
            "c1",
            "summarizer_agent",
            VALIDATOR_AGENT,
            payload(json!({"summary": "Rust pipelines pass messages between agents.", "query": "rust"})),
        );
        agent.handle(envelope, &outbox).await.unwrap();

        let run = store.get_run("c1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.success);
        assert!(run.completed_at.is_some());

        let results = store.list_results("c1").await.unwrap();
        assert_eq!(results[0].result_type, "validation");
        assert!(results[0].validated);
        assert_eq!(store.logs_for("c1").await[0].action, "validation_completed");
    }

    #[tokio::test]
    async fn invalid_summary_completes_unsuccessfully() {
        let store = Arc::new(MemoryStateStore::new());
        store.create_run("c2").await.unwrap();
        let agent = ValidatorAgent::new(store.clone());
        let (services, _, _) = memory_services();
        let outbox = Outbox::new(VALIDATOR_AGENT, None, services.bus.clone());

        let envelope = Envelope::new("c2", "s", VALIDATOR_AGENT, payload(json!({"summary": ""})));
        agent.handle(envelope, &outbox).await.unwrap();

        let run = store.get_run("c2").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(!run.success);
        assert_eq!(run.error_message.as_deref(), Some("Validation failed"));
    }
}
