pub mod researcher;
pub mod summarizer;
pub mod validator;

use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::AgentSpec;
use crate::store::StateStore;

pub use researcher::ResearcherAgent;
pub use summarizer::{HeuristicSummary, ModelSummary, SummarizerAgent, SummaryStrategy};
pub use validator::ValidatorAgent;

// Agent names, used as envelope sender/receiver
pub const RESEARCHER_AGENT: &str = "researcher_agent";
pub const SUMMARIZER_AGENT: &str = "summarizer_agent";
pub const VALIDATOR_AGENT: &str = "validator_agent";

// Agent communication channels
pub const RESEARCHER_CHANNEL: &str = "researcher_input";
pub const SUMMARIZER_CHANNEL: &str = "summarizer_input";
pub const VALIDATOR_CHANNEL: &str = "validator_input";

/// The three pipeline stages, first stage first.
pub fn pipeline_stages(
    store: Arc<dyn StateStore>,
    strategy: Arc<dyn SummaryStrategy>,
    research_latency: Duration,
) -> Vec<AgentSpec> {
    vec![
        AgentSpec::new(
            "researcher",
            RESEARCHER_AGENT,
            RESEARCHER_CHANNEL,
            Some(SUMMARIZER_CHANNEL),
            Arc::new(ResearcherAgent::new(store.clone(), research_latency)),
        ),
        AgentSpec::new(
            "summarizer",
            SUMMARIZER_AGENT,
            SUMMARIZER_CHANNEL,
            Some(VALIDATOR_CHANNEL),
            Arc::new(SummarizerAgent::new(store.clone(), strategy)),
        ),
        AgentSpec::new(
            "validator",
            VALIDATOR_AGENT,
            VALIDATOR_CHANNEL,
            None,
            Arc::new(ValidatorAgent::new(store)),
        ),
    ]
}
