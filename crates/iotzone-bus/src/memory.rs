//! In-memory bus for deterministic tests.
//!
//! `publish` delivers to every matching handler inside the call, on the
//! caller's task, then records the payload as the last one for its address.

use crate::bus::{lock, BusError, Handler, LastWill, MessageBus, Subscription, SubscriptionId};
use async_trait::async_trait;
use iotzone_core::address::{topic_matches, validate_address, validate_pattern};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::Span;

#[derive(Default)]
struct MemoryState {
    payloads: HashMap<String, Vec<u8>>,
    subscriptions: Vec<Subscription>,
}

/// In-process bus with publish introspection.
pub struct MemoryBus {
    state: Mutex<MemoryState>,
    publications: AtomicUsize,
    span: Span,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            publications: AtomicUsize::new(0),
            span: tracing::info_span!("memory_bus"),
        }
    }

    /// Emit log events under `span` instead of the default one.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The last payload published on `address`.
    #[must_use]
    pub fn last_payload(&self, address: &str) -> Option<Vec<u8>> {
        lock(&self.state).payloads.get(address).cloned()
    }

    /// Total number of successful publications.
    #[must_use]
    pub fn nr_publications(&self) -> usize {
        self.publications.load(Ordering::SeqCst)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock(&self.state).subscriptions.len()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn connect(&self, _last_will: Option<LastWill>) -> Result<(), BusError> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn publish(&self, address: &str, _retained: bool, payload: &[u8]) -> Result<(), BusError> {
        validate_address(address)?;

        // Handlers run without the lock held so they can call back into the bus.
        let handlers: Vec<Handler> = lock(&self.state)
            .subscriptions
            .iter()
            .filter(|sub| topic_matches(&sub.pattern, address))
            .map(|sub| sub.handler.clone())
            .collect();

        tracing::debug!(
            parent: &self.span,
            address,
            payload_len = payload.len(),
            handlers = handlers.len(),
            "Publishing message"
        );

        for handler in handlers {
            if let Err(err) = handler(address, payload) {
                tracing::warn!(parent: &self.span, address, error = %err, "Subscription handler failed");
            }
        }

        lock(&self.state)
            .payloads
            .insert(address.to_string(), payload.to_vec());
        self.publications.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    async fn subscribe(&self, pattern: &str, handler: Handler) -> Result<SubscriptionId, BusError> {
        validate_pattern(pattern)?;

        let id = SubscriptionId::next();
        lock(&self.state).subscriptions.push(Subscription {
            id,
            pattern: pattern.to_string(),
            handler,
        });

        tracing::debug!(parent: &self.span, pattern, "Subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, pattern: &str, id: Option<SubscriptionId>) {
        let mut state = lock(&self.state);
        let before = state.subscriptions.len();
        state.subscriptions.retain(|sub| !sub.is_selected(pattern, id));
        let removed = before - state.subscriptions.len();
        drop(state);

        tracing::debug!(parent: &self.span, pattern, removed, "Unsubscribed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler;
    use std::sync::Arc;

    fn recorder() -> (Handler, Arc<Mutex<Vec<(String, Vec<u8>)>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let handler = handler(move |address, payload| {
            sink.lock().unwrap().push((address.to_string(), payload.to_vec()));
            Ok(())
        });
        (handler, received)
    }

    #[tokio::test]
    async fn publish_delivers_synchronously_to_matching_handlers() {
        let bus = MemoryBus::new();
        let (handler, received) = recorder();
        bus.subscribe("+/pub1/#", handler).await.unwrap();

        bus.publish("zone1/pub1/node1/$node", false, b"one").await.unwrap();
        bus.publish("zone1/pub2/node1/$node", false, b"two").await.unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "zone1/pub1/node1/$node");
        assert_eq!(received[0].1, b"one");
    }

    #[tokio::test]
    async fn last_payload_wins() {
        let bus = MemoryBus::new();
        bus.publish("a/b/c", true, b"first").await.unwrap();
        bus.publish("a/b/c", true, b"second").await.unwrap();

        assert_eq!(bus.last_payload("a/b/c"), Some(b"second".to_vec()));
        assert_eq!(bus.last_payload("a/b/d"), None);
        assert_eq!(bus.nr_publications(), 2);
    }

    #[tokio::test]
    async fn publish_rejects_wildcards() {
        let bus = MemoryBus::new();
        assert!(matches!(
            bus.publish("a/+/c", false, b"x").await,
            Err(BusError::InvalidAddress(_))
        ));
        assert_eq!(bus.nr_publications(), 0);
    }

    #[tokio::test]
    async fn subscribe_rejects_malformed_pattern() {
        let bus = MemoryBus::new();
        let (handler, _) = recorder();
        assert!(bus.subscribe("a/#/c", handler).await.is_err());
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_by_id_keeps_other_handlers() {
        let bus = MemoryBus::new();
        let (first, first_received) = recorder();
        let (second, second_received) = recorder();
        let first_id = bus.subscribe("a/b/c", first).await.unwrap();
        bus.subscribe("a/b/c", second).await.unwrap();

        bus.unsubscribe("a/b/c", Some(first_id)).await;
        bus.publish("a/b/c", false, b"x").await.unwrap();

        assert!(first_received.lock().unwrap().is_empty());
        assert_eq!(second_received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_without_id_removes_all_for_pattern() {
        let bus = MemoryBus::new();
        let (first, _) = recorder();
        let (second, _) = recorder();
        let (other, _) = recorder();
        bus.subscribe("a/b/c", first).await.unwrap();
        bus.subscribe("a/b/c", second).await.unwrap();
        bus.subscribe("a/#", other).await.unwrap();

        bus.unsubscribe("a/b/c", None).await;
        assert_eq!(bus.subscription_count(), 1);
    }

    #[tokio::test]
    async fn handler_error_does_not_fail_publish() {
        let bus = MemoryBus::new();
        bus.subscribe("a/b/c", handler(|_, _| Err("boom".into())))
            .await
            .unwrap();

        bus.publish("a/b/c", false, b"x").await.unwrap();
        assert_eq!(bus.nr_publications(), 1);
    }

    #[derive(Clone)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn handler_errors_are_logged_under_injected_span() {
        let output = Arc::new(Mutex::new(Vec::new()));
        let writer = Capture(output.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let bus = MemoryBus::new().with_span(tracing::info_span!("zone1_bus"));
                bus.subscribe("a/b/c", handler(|_, _| Err("boom".into())))
                    .await
                    .unwrap();
                bus.publish("a/b/c", false, b"x").await.unwrap();
            });
        });

        let logged = String::from_utf8(output.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("zone1_bus"));
        assert!(logged.contains("Subscription handler failed"));
        assert!(logged.contains("boom"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publish_count() {
        let bus = Arc::new(MemoryBus::new());
        let publishers = 64;

        let tasks: Vec<_> = (0..publishers)
            .map(|i| {
                let bus = bus.clone();
                tokio::spawn(async move {
                    bus.publish(&format!("zone1/pub1/node{i}/$node"), false, b"{}")
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(bus.nr_publications(), publishers);
    }
}
