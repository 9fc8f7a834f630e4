// Summarizer Agent: condenses research findings through a pluggable strategy

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{SUMMARIZER_AGENT, VALIDATOR_AGENT};
use crate::envelope::{payload, Envelope, Payload};
use crate::error::{PipelineError, Result};
use crate::runtime::{AgentHandler, Outbox};
use crate::store::{save_result_best_effort, StateStore};

/// Texts up to this many characters are summarized heuristically.
const MODEL_THRESHOLD_CHARS: usize = 1000;
/// Input cap for the model endpoint.
const MODEL_INPUT_CHARS: usize = 1024;
const HEURISTIC_SENTENCES: usize = 3;

#[async_trait]
pub trait SummaryStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn summarize(&self, text: &str) -> Result<String>;
}

/// Keeps the first few sentences.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicSummary;

impl HeuristicSummary {
    fn first_sentences(text: &str) -> String {
        let sentences: Vec<&str> = text
            .split('.')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .take(HEURISTIC_SENTENCES)
            .collect();
        if sentences.is_empty() {
            return String::new();
        }
        format!("{}.", sentences.join(". "))
    }
}

#[async_trait]
impl SummaryStrategy for HeuristicSummary {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn summarize(&self, text: &str) -> Result<String> {
        Ok(Self::first_sentences(text))
    }
}

#[derive(Deserialize)]
struct ModelOutput {
    summary_text: String,
}

/// Calls a hosted summarization model (Hugging Face inference style).
/// Short texts and failed calls fall back to [`HeuristicSummary`].
pub struct ModelSummary {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl ModelSummary {
    pub fn new(endpoint: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    async fn call_model(&self, text: &str) -> Result<String> {
        let input: String = text.chars().take(MODEL_INPUT_CHARS).collect();
        let body = json!({
            "inputs": input,
            "parameters": {
                "max_length": 150,
                "min_length": 50,
                "do_sample": false
            }
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let outputs: Vec<ModelOutput> = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        outputs
            .into_iter()
            .next()
            .map(|o| o.summary_text)
            .ok_or_else(|| PipelineError::Handler("model returned no summary".to_string()))
    }
}

#[async_trait]
impl SummaryStrategy for ModelSummary {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn summarize(&self, text: &str) -> Result<String> {
        if text.chars().count() <= MODEL_THRESHOLD_CHARS {
            return HeuristicSummary.summarize(text).await;
        }

        match self.call_model(text).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                warn!(error = %e, "Model summarization failed, using fallback");
                HeuristicSummary.summarize(text).await
            }
        }
    }
}

pub struct SummarizerAgent {
    store: Arc<dyn StateStore>,
    strategy: Arc<dyn SummaryStrategy>,
}

impl SummarizerAgent {
    pub fn new(store: Arc<dyn StateStore>, strategy: Arc<dyn SummaryStrategy>) -> Self {
        Self { store, strategy }
    }
}

/// Findings arrive as a list of strings; a bare string is accepted too.
fn collect_text(data: Option<&Value>) -> String {
    match data {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        Some(Value::String(text)) => text.clone(),
        _ => String::new(),
    }
}

#[async_trait]
impl AgentHandler for SummarizerAgent {
    async fn handle(&self, envelope: Envelope, outbox: &Outbox) -> Result<()> {
        let query = envelope.payload_str("query").to_string();
        let items = envelope
            .payload
            .get("data")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        info!(context_id = %envelope.context_id, items, "Summarizing");

        let summary = self.run(&envelope.context_id, &envelope.payload).await?;

        outbox
            .send(
                &envelope.context_id,
                VALIDATOR_AGENT,
                payload(json!({ "summary": summary, "query": query })),
            )
            .await
    }

    async fn run(&self, context_id: &str, params: &Payload) -> Result<Value> {
        let text = collect_text(params.get("data"));
        if text.is_empty() {
            return Ok(Value::String(String::new()));
        }

        let summary = self.strategy.summarize(&text).await?;

        save_result_best_effort(
            self.store.as_ref(),
            context_id,
            SUMMARIZER_AGENT,
            "summary",
            &summary,
            false,
        )
        .await;

        info!(
            context_id = %context_id,
            strategy = self.strategy.name(),
            chars = summary.len(),
            "Summary generated"
        );
        Ok(Value::String(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    #[tokio::test]
    async fn heuristic_keeps_three_sentences() {
        let text = "One is first. Two follows. Three ends it. Four is dropped.";
        let summary = HeuristicSummary.summarize(text).await.unwrap();
        assert_eq!(summary, "One is first. Two follows. Three ends it.");
    }

    #[tokio::test]
    async fn heuristic_handles_text_without_periods() {
        assert_eq!(HeuristicSummary.summarize("no stop").await.unwrap(), "no stop.");
        assert_eq!(HeuristicSummary.summarize("").await.unwrap(), "");
    }

    #[tokio::test]
    async fn model_strategy_falls_back_when_endpoint_is_down() {
        // Nothing listens on the discard port.
        let model = ModelSummary::new("http://127.0.0.1:9/summarize".to_string(), None).unwrap();

        let short = "Short text. Stays local.";
        assert_eq!(model.summarize(short).await.unwrap(), "Short text. Stays local.");

        let long = "A sentence about pipelines. ".repeat(60);
        let summary = model.summarize(&long).await.unwrap();
        assert_eq!(
            summary,
            "A sentence about pipelines. A sentence about pipelines. A sentence about pipelines."
        );
    }

    #[tokio::test]
    async fn run_saves_summary_result() {
        let store = Arc::new(MemoryStateStore::new());
        let agent = SummarizerAgent::new(store.clone(), Arc::new(HeuristicSummary));

        let params = payload(json!({
            "data": ["Rust is fast. It is safe.", "Tokio drives async IO. Warp serves HTTP."],
            "query": "rust"
        }));
        let summary = agent.run("c1", &params).await.unwrap();
        assert_eq!(summary, json!("Rust is fast. It is safe. Tokio drives async IO."));

        let results = store.list_results("c1").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result_type, "summary");
        assert!(!results[0].validated);
    }

    #[tokio::test]
    async fn run_with_no_data_is_empty_and_unsaved() {
        let store = Arc::new(MemoryStateStore::new());
        let agent = SummarizerAgent::new(store.clone(), Arc::new(HeuristicSummary));

        let summary = agent.run("c1", &Payload::new()).await.unwrap();
        assert_eq!(summary, json!(""));
        assert!(store.list_results("c1").await.unwrap().is_empty());
    }
}
