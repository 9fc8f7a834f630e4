//! Pub/sub message bus.
//!
//! [`MessageBus`] wraps a [`Transport`] and adds the recovery policy. A
//! failed publish takes one backoff step before reporting the error; a lost
//! subscription sleeps with exponential backoff until a fresh session is
//! established.
//! Delivery is at-most-once; a message published while nobody listens on
//! the channel is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use futures::Future;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};

/// Raw messages delivered on one channel. Ends when the session is lost.
pub type MessageStream = BoxStream<'static, Bytes>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self);
    async fn publish(&self, channel: &str, message: Bytes) -> Result<()>;
    /// Opens a dedicated listening session for `channel`.
    async fn listen(&self, channel: &str) -> Result<MessageStream>;
}

/// Reconnect delay schedule: doubles on every failed attempt up to `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn escalate(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max);
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Resolves once the stop flag is raised or its sender is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

pub struct MessageBus {
    transport: Arc<dyn Transport>,
    connected: AtomicBool,
    // Held for one reconnect step so concurrent failures share the schedule.
    backoff: Mutex<Backoff>,
}

impl MessageBus {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_backoff(transport, Backoff::default())
    }

    pub fn with_backoff(transport: Arc<dyn Transport>, backoff: Backoff) -> Self {
        Self {
            transport,
            connected: AtomicBool::new(false),
            backoff: Mutex::new(backoff),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Establishes the transport session. No-op while already connected.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.transport.connect().await?;
        self.connected.store(true, Ordering::SeqCst);
        // A reconnect step in progress resets the schedule itself.
        if let Ok(mut backoff) = self.backoff.try_lock() {
            backoff.reset();
        }
        info!("Message bus connected");
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
        self.connected.store(false, Ordering::SeqCst);
        info!("Message bus disconnected");
    }

    /// Publishes one message, connecting first if needed.
    ///
    /// On failure the bus takes one reconnect step (sleep the current delay,
    /// try once) before the original error is returned. The delay keeps
    /// escalating across calls while the transport stays down.
    pub async fn publish(&self, channel: &str, message: Bytes) -> Result<()> {
        let result = match self.connect().await {
            Ok(()) => self.transport.publish(channel, message).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(channel = %channel, "Published message");
                Ok(())
            }
            Err(e) => {
                error!(channel = %channel, error = %e, "Failed to publish");
                self.connected.store(false, Ordering::SeqCst);
                self.reconnect_step().await;
                Err(e)
            }
        }
    }

    /// Listens on `channel` and awaits `on_message` for every delivery, in
    /// order, until `stop` is raised.
    ///
    /// A lost session is re-established through reconnect and the channel is
    /// subscribed again; messages published in between are not recovered.
    pub async fn subscribe<F, Fut>(
        &self,
        channel: &str,
        mut stop: watch::Receiver<bool>,
        mut on_message: F,
    ) where
        F: FnMut(Bytes) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        loop {
            if *stop.borrow() {
                break;
            }

            let opened = tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                opened = self.transport.listen(channel) => opened,
            };

            match opened {
                Ok(mut messages) => {
                    info!(channel = %channel, "Subscribed to channel");
                    loop {
                        tokio::select! {
                            biased;
                            _ = stopped(&mut stop) => {
                                info!(channel = %channel, "Subscription cancelled");
                                return;
                            }
                            next = messages.next() => match next {
                                Some(raw) => {
                                    debug!(channel = %channel, "Received message");
                                    on_message(raw).await;
                                }
                                None => break,
                            },
                        }
                    }
                    warn!(channel = %channel, "Subscription lost");
                }
                Err(e) => {
                    error!(channel = %channel, error = %e, "Failed to open subscription");
                }
            }

            self.connected.store(false, Ordering::SeqCst);
            if !self.reconnect(&mut stop).await {
                info!(channel = %channel, "Subscription cancelled during reconnect");
                return;
            }
        }
    }

    /// Retries `connect` with backoff until it succeeds. Returns `false` only
    /// when `stop` is raised first.
    async fn reconnect(&self, stop: &mut watch::Receiver<bool>) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = stopped(stop) => return false,
                connected = self.reconnect_step() => {
                    if connected {
                        return true;
                    }
                }
            }
        }
    }

    /// One backoff step: wait the current delay, then try to connect once.
    /// Escalates the delay on failure and resets it on success.
    async fn reconnect_step(&self) -> bool {
        let mut backoff = self.backoff.lock().await;

        // Someone else reconnected while we queued on the lock.
        if self.is_connected() {
            return true;
        }

        let delay = backoff.current();
        warn!(delay_secs = delay.as_secs_f64(), "Attempting reconnect");
        tokio::time::sleep(delay).await;

        match self.transport.connect().await {
            Ok(()) => {
                backoff.reset();
                self.connected.store(true, Ordering::SeqCst);
                info!("Reconnected to message bus");
                true
            }
            Err(e) => {
                error!(error = %e, "Reconnect attempt failed");
                backoff.escalate();
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn current_backoff(&self) -> Duration {
        self.backoff.lock().await.current()
    }
}

pub struct RedisTransport {
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
}

impl RedisTransport {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    async fn manager(&self) -> Result<ConnectionManager> {
        self.connection
            .lock()
            .await
            .clone()
            .ok_or_else(|| PipelineError::Transport("redis session not established".to_string()))
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn connect(&self) -> Result<()> {
        let mut manager = self.client.get_tokio_connection_manager().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut manager).await?;
        *self.connection.lock().await = Some(manager);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connection.lock().await.take();
    }

    async fn publish(&self, channel: &str, message: Bytes) -> Result<()> {
        let mut manager = self.manager().await?;
        manager.publish::<_, _, ()>(channel, message.to_vec()).await?;
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<MessageStream> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;
        let messages = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()));
        Ok(messages.boxed())
    }
}

/// In-process transport over tokio broadcast channels. Lets the whole
/// pipeline run inside one process without a Redis server.
pub struct MemoryTransport {
    channels: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    connected: AtomicBool,
    capacity: usize,
    failing_connects: AtomicUsize,
    failing_publishes: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            capacity: 1024,
            failing_connects: AtomicUsize::new(0),
            failing_publishes: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn fail_next_publishes(&self, count: usize) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Drops the session and every open listener, as a server restart would.
    #[cfg(test)]
    pub(crate) async fn sever(&self) {
        self.channels.lock().await.clear();
        self.connected.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) async fn listener_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .await
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        if take_failure(&self.failing_connects) {
            return Err(PipelineError::Transport("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.channels.lock().await.clear();
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn publish(&self, channel: &str, message: Bytes) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PipelineError::Transport("not connected".to_string()));
        }
        if take_failure(&self.failing_publishes) {
            return Err(PipelineError::Transport("connection reset".to_string()));
        }
        if let Some(tx) = self.channels.lock().await.get(channel) {
            // No live receiver means nobody is listening: the message is lost.
            let _ = tx.send(message);
        }
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<MessageStream> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PipelineError::Transport("not connected".to_string()));
        }
        let rx = self
            .channels
            .lock()
            .await
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let messages = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Listener lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(messages.boxed())
    }
}
