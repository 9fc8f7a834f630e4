//! Lifecycle manager for the fixed set of pipeline stages.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::models::AgentStatus;
use crate::runtime::{AgentHandler, AgentRuntime, RuntimeState, Services};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to build a runtime for one stage, so a stopped stage
/// can be replaced by a fresh instance.
#[derive(Clone)]
pub struct AgentSpec {
    pub key: String,
    pub name: String,
    pub input_channel: String,
    pub output_channel: Option<String>,
    pub handler: Arc<dyn AgentHandler>,
}

impl AgentSpec {
    pub fn new(
        key: &str,
        name: &str,
        input_channel: &str,
        output_channel: Option<&str>,
        handler: Arc<dyn AgentHandler>,
    ) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            input_channel: input_channel.to_string(),
            output_channel: output_channel.map(str::to_string),
            handler,
        }
    }

    fn build(&self, services: &Services) -> Arc<AgentRuntime> {
        Arc::new(AgentRuntime::new(
            self.name.clone(),
            self.input_channel.clone(),
            self.output_channel.clone(),
            self.handler.clone(),
            services.clone(),
        ))
    }
}

struct ManagedAgent {
    spec: AgentSpec,
    runtime: Arc<AgentRuntime>,
}

pub struct Coordinator {
    services: Services,
    agents: Mutex<BTreeMap<String, ManagedAgent>>,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown_grace: Duration,
}

impl Coordinator {
    pub fn new(specs: Vec<AgentSpec>, services: Services) -> Self {
        let agents = specs
            .into_iter()
            .map(|spec| {
                let runtime = spec.build(&services);
                (spec.key.clone(), ManagedAgent { spec, runtime })
            })
            .collect();

        Self {
            services,
            agents: Mutex::new(agents),
            handles: Mutex::new(HashMap::new()),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// How long `stop_all` waits for an in-flight handler before aborting it.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Launches every stage on its own task. Returns once all are launched.
    pub async fn start_all(&self) -> Result<()> {
        let mut agents = self.agents.lock().await;
        let mut handles = self.handles.lock().await;

        for (key, agent) in agents.iter_mut() {
            match agent.runtime.state().await {
                RuntimeState::Running => continue,
                RuntimeState::Stopped => agent.runtime = agent.spec.build(&self.services),
                RuntimeState::Idle => {}
            }

            let handle = agent.runtime.start().await?;
            handles.insert(key.clone(), handle);
            info!(agent = %agent.spec.name, "Started agent");
        }

        info!(count = agents.len(), "All agents started");
        Ok(())
    }

    /// Signals every stage to stop, then waits for each task. Tasks still
    /// busy after the shutdown grace are aborted.
    pub async fn stop_all(&self) {
        info!("Stopping all agents");

        for agent in self.agents.lock().await.values() {
            agent.runtime.stop().await;
        }

        let handles: Vec<(String, JoinHandle<()>)> =
            self.handles.lock().await.drain().collect();

        for (key, mut handle) in handles {
            match tokio::time::timeout(self.shutdown_grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => error!(agent = %key, error = %e, "Agent task panicked"),
                Err(_) => {
                    warn!(agent = %key, "Agent did not stop within grace period, aborting");
                    handle.abort();
                    // Cancellation is the expected outcome here.
                    let _ = handle.await;
                }
            }
        }

        info!("All agents stopped");
    }

    pub async fn status(&self) -> BTreeMap<String, AgentStatus> {
        let agents = self.agents.lock().await;
        let mut status = BTreeMap::new();
        for (key, agent) in agents.iter() {
            status.insert(key.clone(), agent.runtime.status().await);
        }
        status
    }

    /// True when every stage is running. An empty registry is healthy.
    pub async fn health(&self) -> bool {
        for agent in self.agents.lock().await.values() {
            if !agent.runtime.is_running().await {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{
        pipeline_stages, HeuristicSummary, RESEARCHER_AGENT, RESEARCHER_CHANNEL,
        SUMMARIZER_CHANNEL, VALIDATOR_CHANNEL,
    };
    use crate::bus::{MemoryTransport, Transport};
    use crate::envelope::{payload, Envelope, Payload};
    use crate::models::RunStatus;
    use crate::runtime::Outbox;
    use crate::store::StateStore;
    use crate::test_support::{eventually, memory_services, wait_for_listener};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::time::Instant;

    fn pipeline(services: &Services) -> Coordinator {
        Coordinator::new(
            pipeline_stages(
                services.store.clone(),
                Arc::new(HeuristicSummary),
                Duration::ZERO,
            ),
            services.clone(),
        )
    }

    async fn wait_for_pipeline(transport: &MemoryTransport) {
        for channel in [RESEARCHER_CHANNEL, SUMMARIZER_CHANNEL, VALIDATOR_CHANNEL] {
            wait_for_listener(transport, channel).await;
        }
    }

    #[tokio::test]
    async fn empty_registry_is_healthy() {
        let (services, _, _) = memory_services();
        let coordinator = Coordinator::new(Vec::new(), services);
        assert!(coordinator.health().await);
        assert!(coordinator.status().await.is_empty());
    }

    #[tokio::test]
    async fn health_follows_running_flags() {
        let (services, transport, _) = memory_services();
        let coordinator = pipeline(&services);
        assert!(!coordinator.health().await);

        coordinator.start_all().await.unwrap();
        assert!(coordinator.health().await);

        let status = coordinator.status().await;
        assert_eq!(status.len(), 3);
        assert!(status.values().all(|s| s.running));
        assert_eq!(status["researcher"].input_channel, RESEARCHER_CHANNEL);
        assert_eq!(
            status["researcher"].output_channel.as_deref(),
            Some(SUMMARIZER_CHANNEL)
        );
        assert_eq!(status["validator"].output_channel, None);

        wait_for_pipeline(&transport).await;
        coordinator.stop_all().await;
        assert!(!coordinator.health().await);
        assert!(coordinator.status().await.values().all(|s| !s.running));
    }

    #[tokio::test]
    async fn restarts_with_fresh_runtimes_after_stop() {
        let (services, transport, _) = memory_services();
        let coordinator = pipeline(&services);

        coordinator.start_all().await.unwrap();
        wait_for_pipeline(&transport).await;
        coordinator.stop_all().await;

        coordinator.start_all().await.unwrap();
        assert!(coordinator.health().await);
        coordinator.stop_all().await;
    }

    #[tokio::test]
    async fn seed_reaches_the_terminal_stage_with_its_query() {
        let (services, transport, store) = memory_services();
        let coordinator = pipeline(&services);

        coordinator.start_all().await.unwrap();
        wait_for_pipeline(&transport).await;
        let mut terminal = transport.listen(VALIDATOR_CHANNEL).await.unwrap();

        store.create_run("c1").await.unwrap();
        services.metrics.start_run("c1").await;
        let seed = Envelope::new(
            "c1",
            "workflow_runner",
            RESEARCHER_AGENT,
            payload(json!({"query": "machine learning"})),
        );
        services
            .bus
            .publish(RESEARCHER_CHANNEL, seed.to_bytes().unwrap())
            .await
            .unwrap();

        let raw = terminal.next().await.unwrap();
        let last_hop = Envelope::decode(&raw).unwrap();
        assert_eq!(last_hop.payload_str("query"), "machine learning");
        assert!(!last_hop.payload_str("summary").is_empty());

        eventually(|| {
            let store = store.clone();
            async move {
                matches!(
                    store.get_run("c1").await,
                    Ok(Some(run)) if run.status == RunStatus::Completed
                )
            }
        })
        .await;
        let run = store.get_run("c1").await.unwrap().unwrap();
        assert!(run.success);

        eventually(|| {
            let metrics = services.metrics.clone();
            async move { metrics.snapshot("c1").await.map(|s| s.message_count) == Some(3) }
        })
        .await;

        coordinator.stop_all().await;
    }

    struct Stuck;

    #[async_trait]
    impl AgentHandler for Stuck {
        async fn handle(&self, _envelope: Envelope, _outbox: &Outbox) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn run(&self, _context_id: &str, _params: &Payload) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn stop_all_aborts_handlers_past_the_grace_period() {
        let (services, transport, _) = memory_services();
        let coordinator = Coordinator::new(
            vec![AgentSpec::new("stuck", "stuck_agent", "stuck_input", None, Arc::new(Stuck))],
            services.clone(),
        )
        .with_shutdown_grace(Duration::from_millis(100));

        coordinator.start_all().await.unwrap();
        wait_for_listener(&transport, "stuck_input").await;
        let envelope = Envelope::new("c1", "test", "stuck_agent", Payload::new());
        services
            .bus
            .publish("stuck_input", envelope.to_bytes().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        coordinator.stop_all().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!coordinator.health().await);
    }
}
