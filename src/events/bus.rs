//! The in-process typed publish/subscribe bus (§4.7).
//!
//! Handlers are async callables keyed by event class. `publish` spawns one
//! task per subscribed handler and returns immediately; `publish_and_wait`
//! awaits every handler and collects the failures instead of propagating the
//! first one, so a misbehaving handler never blocks or poisons the others
//! (§4.7 "Error isolation").

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;

use super::{ControlLimitsUpdatedEvent, SampleProcessedEvent};

/// A subscriber to one event class. Returns `anyhow::Result` rather than a
/// crate error type because handlers are arbitrary sinks (the live
/// broadcaster, the outbound publisher, test doubles) with unrelated
/// failure modes.
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    async fn handle(&self, event: E) -> anyhow::Result<()>;
}

type Handlers<E> = RwLock<Vec<Arc<dyn EventHandler<E>>>>;

/// Maps an event type to the bus field holding its handler registry, so
/// `publish`/`publish_and_wait` stay single generic methods instead of one
/// differently-named method per event class.
trait BusEvent: Clone + Send + Sync + 'static {
    fn handlers(bus: &EventBus) -> &Handlers<Self>
    where
        Self: Sized;
}

impl BusEvent for SampleProcessedEvent {
    fn handlers(bus: &EventBus) -> &Handlers<Self> {
        &bus.sample_processed
    }
}

impl BusEvent for ControlLimitsUpdatedEvent {
    fn handlers(bus: &EventBus) -> &Handlers<Self> {
        &bus.control_limits_updated
    }
}

/// Process-local publish/subscribe bus carrying `SampleProcessedEvent` and
/// `ControlLimitsUpdatedEvent` (§4.7). Violation lifecycle events bypass
/// this bus entirely — see the module doc comment.
pub struct EventBus {
    sample_processed: Handlers<SampleProcessedEvent>,
    control_limits_updated: Handlers<ControlLimitsUpdatedEvent>,
    tasks: Mutex<JoinSet<()>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            sample_processed: RwLock::new(Vec::new()),
            control_limits_updated: RwLock::new(Vec::new()),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub async fn subscribe_sample_processed(&self, handler: Arc<dyn EventHandler<SampleProcessedEvent>>) {
        self.sample_processed.write().await.push(handler);
    }

    pub async fn subscribe_control_limits_updated(&self, handler: Arc<dyn EventHandler<ControlLimitsUpdatedEvent>>) {
        self.control_limits_updated.write().await.push(handler);
    }

    /// Non-blocking publish (§4.7): spawns one task per subscribed handler
    /// and returns without waiting for any of them.
    pub async fn publish<E: BusEvent>(&self, event: E) {
        let handlers = E::handlers(self).read().await.clone();
        if handlers.is_empty() {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        for handler in handlers {
            let event = event.clone();
            tasks.spawn(async move {
                if let Err(error) = handler.handle(event).await {
                    tracing::warn!(%error, "event_handler_failed");
                }
            });
        }
    }

    /// Blocking publish (§4.7): awaits every handler and returns whichever
    /// failed instead of the first error.
    pub async fn publish_and_wait<E: BusEvent>(&self, event: E) -> Vec<anyhow::Error> {
        let handlers = E::handlers(self).read().await.clone();
        let futures = handlers.iter().map(|handler| handler.handle(event.clone()));
        futures::future::join_all(futures)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect()
    }

    /// Awaits every outstanding `publish`-spawned task (§4.7 "Shutdown").
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct CountingHandler {
        count: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler<SampleProcessedEvent> for CountingHandler {
        async fn handle(&self, _event: SampleProcessedEvent) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler<SampleProcessedEvent> for FailingHandler {
        async fn handle(&self, _event: SampleProcessedEvent) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    struct RecordingHandler {
        seen: StdMutex<Vec<i64>>,
    }

    #[async_trait]
    impl EventHandler<ControlLimitsUpdatedEvent> for RecordingHandler {
        async fn handle(&self, event: ControlLimitsUpdatedEvent) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(event.characteristic_id);
            Ok(())
        }
    }

    fn sample_event() -> SampleProcessedEvent {
        SampleProcessedEvent {
            characteristic_id: 1,
            sample_id: 1,
            mean: 100.0,
            range_value: None,
            zone: None,
            in_control: true,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_and_wait_delivers_to_every_handler_and_collects_errors() {
        let bus = EventBus::new();
        let counting = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });
        bus.subscribe_sample_processed(counting.clone()).await;
        bus.subscribe_sample_processed(Arc::new(FailingHandler)).await;

        let errors = bus.publish_and_wait(sample_event()).await;

        assert_eq!(counting.count.load(Ordering::SeqCst), 1);
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn publish_is_non_blocking_and_drains_on_shutdown() {
        let bus = EventBus::new();
        let counting = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });
        bus.subscribe_sample_processed(counting.clone()).await;

        bus.publish(sample_event()).await;
        bus.shutdown().await;

        assert_eq!(counting.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_event_classes_have_independent_subscriber_lists() {
        let bus = EventBus::new();
        let recorder = Arc::new(RecordingHandler {
            seen: StdMutex::new(vec![]),
        });
        bus.subscribe_control_limits_updated(recorder.clone()).await;

        bus.publish(sample_event()).await;
        bus.shutdown().await;

        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}
