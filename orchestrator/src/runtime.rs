//! Generic agent runtime.
//!
//! An [`AgentRuntime`] owns one subscription on its input channel and feeds
//! every decoded envelope to an injected [`AgentHandler`]. Decode failures,
//! handler errors and handler panics are all contained to the single
//! message; only [`AgentRuntime::stop`] ends the loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::envelope::{Envelope, Payload};
use crate::error::{PipelineError, Result};
use crate::metrics::MetricsCollector;
use crate::models::AgentStatus;
use crate::store::{log_best_effort, StateStore};

/// Process-wide services, built once at startup and shared by reference.
#[derive(Clone)]
pub struct Services {
    pub bus: Arc<MessageBus>,
    pub store: Arc<dyn StateStore>,
    pub metrics: Arc<MetricsCollector>,
}

/// Domain capability plugged into a runtime.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Reacts to one envelope from the input channel, usually by calling
    /// [`AgentHandler::run`] and forwarding the result through `outbox`.
    async fn handle(&self, envelope: Envelope, outbox: &Outbox) -> Result<()>;

    /// The agent's unit of work, independent of the bus.
    async fn run(&self, context_id: &str, params: &Payload) -> Result<Value>;
}

/// Publishing half of a runtime, handed to its handler.
#[derive(Clone)]
pub struct Outbox {
    sender: String,
    channel: Option<String>,
    bus: Arc<MessageBus>,
}

impl Outbox {
    pub fn new(sender: impl Into<String>, channel: Option<String>, bus: Arc<MessageBus>) -> Self {
        Self {
            sender: sender.into(),
            channel,
            bus,
        }
    }

    /// Wraps `payload` in a fresh envelope and publishes it on the output
    /// channel. Terminal agents have no output channel; for them this only
    /// warns.
    pub async fn send(&self, context_id: &str, receiver: &str, payload: Payload) -> Result<()> {
        let Some(channel) = self.channel.as_deref() else {
            warn!(context_id = %context_id, agent = %self.sender, "No output channel configured");
            return Ok(());
        };

        let envelope = Envelope::new(context_id, self.sender.as_str(), receiver, payload);
        self.bus.publish(channel, envelope.to_bytes()?).await?;
        info!(context_id = %context_id, agent = %self.sender, receiver = %receiver, "Sent message");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    Running,
    Stopped,
}

pub struct AgentRuntime {
    name: String,
    input_channel: String,
    outbox: Outbox,
    handler: Arc<dyn AgentHandler>,
    services: Services,
    state: Mutex<RuntimeState>,
    stop_tx: watch::Sender<bool>,
}

impl AgentRuntime {
    pub fn new(
        name: impl Into<String>,
        input_channel: impl Into<String>,
        output_channel: Option<String>,
        handler: Arc<dyn AgentHandler>,
        services: Services,
    ) -> Self {
        let name = name.into();
        let (stop_tx, _) = watch::channel(false);
        Self {
            outbox: Outbox::new(name.clone(), output_channel, services.bus.clone()),
            name,
            input_channel: input_channel.into(),
            handler,
            services,
            state: Mutex::new(RuntimeState::Idle),
            stop_tx,
        }
    }

    pub async fn state(&self) -> RuntimeState {
        *self.state.lock().await
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == RuntimeState::Running
    }

    pub async fn status(&self) -> AgentStatus {
        AgentStatus {
            name: self.name.clone(),
            running: self.is_running().await,
            input_channel: self.input_channel.clone(),
            output_channel: self.outbox.channel.clone(),
        }
    }

    /// Marks the runtime running and moves its subscription loop onto a new
    /// task, which ends once the runtime is stopped.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        self.begin().await?;
        let runtime = Arc::clone(self);
        Ok(tokio::spawn(async move { runtime.listen().await }))
    }

    /// Stops accepting messages. A handler already running is left to finish.
    pub async fn stop(&self) {
        *self.state.lock().await = RuntimeState::Stopped;
        self.stop_tx.send_replace(true);
        info!(agent = %self.name, "Stopping agent");
    }

    pub async fn send(&self, context_id: &str, receiver: &str, payload: Payload) -> Result<()> {
        self.outbox.send(context_id, receiver, payload).await
    }

    async fn begin(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            RuntimeState::Idle => {
                *state = RuntimeState::Running;
                Ok(())
            }
            RuntimeState::Running => Err(PipelineError::InvalidState(format!(
                "agent {} is already running",
                self.name
            ))),
            RuntimeState::Stopped => Err(PipelineError::InvalidState(format!(
                "agent {} was stopped and cannot be restarted",
                self.name
            ))),
        }
    }

    async fn listen(&self) {
        info!(agent = %self.name, channel = %self.input_channel, "Starting agent");

        // A failed connect is not fatal here: the subscription retries with backoff.
        if let Err(e) = self.services.bus.connect().await {
            error!(agent = %self.name, error = %e, "Bus connect failed, subscription will retry");
        }

        self.services
            .bus
            .subscribe(&self.input_channel, self.stop_tx.subscribe(), |raw| self.dispatch(raw))
            .await;

        info!(agent = %self.name, "Agent loop ended");
    }

    async fn dispatch(&self, raw: Bytes) {
        let envelope = match Envelope::decode(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(agent = %self.name, error = %e, "Dropping malformed envelope");
                self.services.metrics.record_envelope(&self.name, "malformed");
                return;
            }
        };

        let context_id = envelope.context_id.clone();
        info!(context_id = %context_id, agent = %self.name, sender = %envelope.sender, "Received message");

        let latency = (Utc::now() - envelope.timestamp).num_milliseconds().max(0) as f64 / 1000.0;
        self.services.metrics.record_message_latency(latency).await;

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.handler.handle(envelope, &self.outbox))
            .catch_unwind()
            .await;
        let duration = started.elapsed().as_secs_f64();

        let metrics = &self.services.metrics;
        metrics.record_agent_timing(&context_id, &self.name, duration).await;
        metrics.increment_message_count(&context_id).await;

        let action = match outcome {
            Ok(Ok(())) => {
                metrics.record_envelope(&self.name, "ok");
                "processed_message"
            }
            Ok(Err(e)) => {
                error!(context_id = %context_id, agent = %self.name, error = %e, "Error handling message");
                metrics.record_envelope(&self.name, "error");
                "handler_failed"
            }
            Err(_) => {
                error!(context_id = %context_id, agent = %self.name, "Handler panicked");
                metrics.record_envelope(&self.name, "panic");
                "handler_failed"
            }
        };

        log_best_effort(
            self.services.store.as_ref(),
            &context_id,
            &self.name,
            action,
            Some(duration),
            None,
        )
        .await;
    }
}
