//! The bus contract shared by all transports.

use async_trait::async_trait;
use iotzone_core::AddressError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Error reported by a subscription handler. Logged by the bus, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked with `(address, payload)` for every matching message.
pub type Handler = Arc<dyn Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Identifies one registered handler, for targeted unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Message the broker publishes on our behalf after an unclean disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    /// Address to publish the will on
    pub address: String,
    /// Will payload
    pub payload: Vec<u8>,
}

impl LastWill {
    /// Create a last will.
    #[must_use]
    pub fn new(address: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            address: address.into(),
            payload: payload.into(),
        }
    }
}

/// Publish/subscribe bus.
///
/// All methods may be called concurrently.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Connect to the bus, registering an optional last will.
    ///
    /// # Errors
    ///
    /// Returns error if the bus configuration is invalid.
    async fn connect(&self, last_will: Option<LastWill>) -> Result<(), BusError>;

    /// Disconnect from the bus. Registered subscriptions are kept.
    async fn disconnect(&self);

    /// Publish a payload on an address.
    ///
    /// # Errors
    ///
    /// Returns error if the address contains wildcards or the bus is not connected.
    async fn publish(&self, address: &str, retained: bool, payload: &[u8]) -> Result<(), BusError>;

    /// Register a handler for addresses matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns error if the pattern is malformed.
    async fn subscribe(&self, pattern: &str, handler: Handler) -> Result<SubscriptionId, BusError>;

    /// Remove one handler, or every handler of `pattern` when `id` is `None`.
    async fn unsubscribe(&self, pattern: &str, id: Option<SubscriptionId>);
}

/// A registered pattern and its handler.
pub(crate) struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) pattern: String,
    pub(crate) handler: Handler,
}

impl Subscription {
    pub(crate) fn is_selected(&self, pattern: &str, id: Option<SubscriptionId>) -> bool {
        self.pattern == pattern && id.map_or(true, |id| self.id == id)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Errors for bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidUrl(String),
    /// Address or pattern is malformed
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),
    /// No active connection
    #[error("not connected")]
    NotConnected,
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_ids_are_unique() {
        let a = SubscriptionId::next();
        let b = SubscriptionId::next();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn selection_by_pattern_and_id() {
        let id = SubscriptionId::next();
        let sub = Subscription {
            id,
            pattern: "d/+/n/$node".to_string(),
            handler: handler(|_, _| Ok(())),
        };

        assert!(sub.is_selected("d/+/n/$node", None));
        assert!(sub.is_selected("d/+/n/$node", Some(id)));
        assert!(!sub.is_selected("d/+/n/$node", Some(SubscriptionId::next())));
        assert!(!sub.is_selected("d/#", None));
    }
}
