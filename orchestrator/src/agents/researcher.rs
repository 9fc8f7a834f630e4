// Researcher Agent: gathers findings for a query and hands them to the summarizer

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{RESEARCHER_AGENT, SUMMARIZER_AGENT};
use crate::envelope::{payload, Envelope, Payload};
use crate::error::Result;
use crate::runtime::{AgentHandler, Outbox};
use crate::store::{log_best_effort, StateStore};

pub struct ResearcherAgent {
    store: Arc<dyn StateStore>,
    latency: Duration,
}

impl ResearcherAgent {
    /// `latency` simulates the time spent querying sources.
    pub fn new(store: Arc<dyn StateStore>, latency: Duration) -> Self {
        Self { store, latency }
    }
}

fn gather_findings(query: &str) -> Vec<String> {
    vec![
        format!("Research finding 1: {query} is a complex topic with multiple facets. Recent studies show significant progress in understanding its core principles."),
        format!("Research finding 2: Industry experts believe {query} will transform how we approach problem-solving in the coming years."),
        format!("Research finding 3: Academic research on {query} has increased by 300% over the last decade, indicating growing interest."),
        format!("Research finding 4: Practical applications of {query} are already being deployed in production environments."),
        format!("Research finding 5: Future directions for {query} include enhanced automation and integration with existing systems."),
    ]
}

#[async_trait]
impl AgentHandler for ResearcherAgent {
    async fn handle(&self, envelope: Envelope, outbox: &Outbox) -> Result<()> {
        let query = envelope.payload_str("query").to_string();
        info!(context_id = %envelope.context_id, query = %query, "Researching");

        let data = self.run(&envelope.context_id, &envelope.payload).await?;

        outbox
            .send(
                &envelope.context_id,
                SUMMARIZER_AGENT,
                payload(json!({ "data": data, "query": query })),
            )
            .await
    }

    async fn run(&self, context_id: &str, params: &Payload) -> Result<Value> {
        let query = params.get("query").and_then(Value::as_str).unwrap_or_default();
        info!(context_id = %context_id, query = %query, "Gathering data");

        let started = Instant::now();
        tokio::time::sleep(self.latency).await;
        let findings = gather_findings(query);
        let details = format!(
            "Collected {} data points for query: {}",
            findings.len(),
            query
        );

        log_best_effort(
            self.store.as_ref(),
            context_id,
            RESEARCHER_AGENT,
            "data_gathered",
            Some(started.elapsed().as_secs_f64()),
            Some(details.as_str()),
        )
        .await;

        info!(context_id = %context_id, count = findings.len(), "Gathered data points");
        Ok(json!(findings))
    }
}
