use std::sync::Arc;
use std::time::Duration;

use futures::Future;

use crate::bus::{MemoryTransport, MessageBus};
use crate::metrics::MetricsCollector;
use crate::runtime::Services;
use crate::store::MemoryStateStore;

pub(crate) fn memory_services() -> (Services, Arc<MemoryTransport>, Arc<MemoryStateStore>) {
    let transport = Arc::new(MemoryTransport::new());
    let store = Arc::new(MemoryStateStore::new());
    let services = Services {
        bus: Arc::new(MessageBus::new(transport.clone())),
        store: store.clone(),
        metrics: Arc::new(MetricsCollector::new().unwrap()),
    };
    (services, transport, store)
}

/// Messages published before a listener attaches are lost, so tests wait.
pub(crate) async fn wait_for_listener(transport: &MemoryTransport, channel: &str) {
    eventually(move || async move { transport.listener_count(channel).await > 0 }).await;
}

pub(crate) async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
