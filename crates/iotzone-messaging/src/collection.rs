//! Address-keyed store of discovered objects.
//!
//! Entries are keyed by canonical address, so `d/p/n`, `d/p/n/$node` and
//! `d/p/n/$set` all refer to the same entry. Values are held as `Arc<T>`;
//! readers get shared snapshots and writers replace the whole value.

use crate::signer::{MessageSigner, PublicKeyResolver};
use crate::MessageError;
use iotzone_bus::{handler, SubscriptionId};
use iotzone_core::address::{canonical, has_segment_prefix, node_prefix};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::Span;

/// Discovered objects of type `T`, keyed by canonical address.
pub struct DiscoveryCollection<T> {
    signer: Arc<MessageSigner>,
    resolver: Option<PublicKeyResolver>,
    entries: Mutex<HashMap<String, Arc<T>>>,
    errors: AtomicU64,
    span: Span,
}

impl<T> DiscoveryCollection<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Create an empty collection. Discovered entries are verified with
    /// `resolver`, or with the signer's resolver when `None`.
    #[must_use]
    pub fn new(signer: Arc<MessageSigner>, resolver: Option<PublicKeyResolver>) -> Self {
        let resolver = resolver.or_else(|| signer.resolver().cloned());
        let span = signer.span().clone();
        Self {
            signer,
            resolver,
            entries: Mutex::new(HashMap::new()),
            errors: AtomicU64::new(0),
            span,
        }
    }

    /// Emit log events under `span` instead of the signer's.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Insert or replace the entry at `address`.
    pub fn add(&self, address: &str, value: T) {
        self.install(address, Arc::new(value));
    }

    /// Same as [`Self::add`].
    pub fn update(&self, address: &str, value: T) {
        self.install(address, Arc::new(value));
    }

    /// Look up an entry by node address, or by the io address below it when
    /// `io_type` is not empty.
    ///
    /// Returns `None` when `node_address` has fewer than three segments.
    #[must_use]
    pub fn get(&self, node_address: &str, io_type: &str, instance: &str) -> Option<Arc<T>> {
        let node = node_prefix(node_address)?;
        if io_type.is_empty() {
            self.get_by_address(node_address)
        } else {
            self.get_by_address(&format!("{node}/{io_type}/{instance}"))
        }
    }

    /// Look up an entry by any address that canonicalizes to its key.
    #[must_use]
    pub fn get_by_address(&self, address: &str) -> Option<Arc<T>> {
        self.entries().get(canonical(address)).cloned()
    }

    /// Snapshot of every entry.
    #[must_use]
    pub fn get_all(&self) -> Vec<Arc<T>> {
        self.entries().values().cloned().collect()
    }

    /// Snapshot of the entries of the node `prefix` points into: the node
    /// itself and everything below it.
    #[must_use]
    pub fn get_by_address_prefix(&self, prefix: &str) -> Vec<Arc<T>> {
        let Some(node) = node_prefix(prefix) else {
            return Vec::new();
        };
        self.entries()
            .iter()
            .filter(|(key, _)| has_segment_prefix(key, node))
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Snapshot of every `(key, value)` pair.
    #[must_use]
    pub fn entries_snapshot(&self) -> Vec<(String, Arc<T>)> {
        self.entries()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Remove the entry at `address`, if present.
    pub fn remove(&self, address: &str) {
        let key = canonical(address);
        if self.entries().remove(key).is_some() {
            tracing::debug!(parent: &self.span, key, "Removed entry");
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Number of discovery messages rejected by subscription handlers.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Decode and verify a discovery message and store it at `address`.
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be decoded, is not signed, or
    /// fails verification. The collection is unchanged in that case.
    pub fn handle_discovery(&self, address: &str, raw: &[u8]) -> Result<(), MessageError> {
        let decoded = self.signer.decode_message_with::<T>(raw, self.resolver.as_ref())?;
        if !decoded.signed {
            return Err(MessageError::Unsigned);
        }

        tracing::debug!(
            parent: &self.span,
            address,
            sender = decoded.sender.as_deref().unwrap_or_default(),
            encrypted = decoded.encrypted,
            "Discovered entry"
        );
        self.install(address, Arc::new(decoded.object));
        Ok(())
    }

    /// Feed every message matching `pattern` into [`Self::handle_discovery`].
    ///
    /// Rejected messages are logged and counted by [`Self::error_count`].
    /// The handler does not keep the collection alive.
    ///
    /// # Errors
    ///
    /// Returns error if the bus rejects the pattern.
    pub async fn subscribe(self: &Arc<Self>, pattern: &str) -> Result<SubscriptionId, MessageError> {
        let collection = Arc::downgrade(self);
        let on_message = handler(move |address, payload| {
            if let Some(collection) = collection.upgrade() {
                if let Err(e) = collection.handle_discovery(address, payload) {
                    collection.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(parent: &collection.span, address, error = %e, "Rejected discovery message");
                }
            }
            Ok(())
        });

        tracing::info!(parent: &self.span, pattern, "Subscribing to discovery");
        self.signer.subscribe(pattern, on_message).await
    }

    fn install(&self, address: &str, value: Arc<T>) {
        self.entries().insert(canonical(address).to_string(), value);
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotzone_bus::MemoryBus;

    fn collection() -> DiscoveryCollection<String> {
        DiscoveryCollection::new(Arc::new(MessageSigner::new(Arc::new(MemoryBus::new()))), None)
    }

    #[test]
    fn lookups_are_canonical() {
        let nodes = collection();
        nodes.add("d/p/n/$node", "node".to_string());

        assert_eq!(nodes.get_by_address("d/p/n").as_deref().map(String::as_str), Some("node"));
        assert!(nodes.get_by_address("d/p/n/$set").is_some());
        assert!(nodes.get("d/p/n", "", "").is_some());
        assert!(nodes.get("d/p/n/$configure", "", "").is_some());
        assert!(nodes.get("d", "", "").is_none());
        assert!(nodes.get("d/p", "", "").is_none());
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn get_builds_io_address_from_node_prefix() {
        let outputs = collection();
        outputs.add("d/p/n/temperature/0/$output", "t0".to_string());

        assert!(outputs.get("d/p/n", "temperature", "0").is_some());
        assert!(outputs.get("d/p/n/$node", "temperature", "0").is_some());
        assert!(outputs.get("d/p/n/other/1/$output", "temperature", "0").is_some());
        assert!(outputs.get("d/p/n", "temperature", "1").is_none());
    }

    #[test]
    fn update_replaces_and_old_snapshots_survive() {
        let nodes = collection();
        nodes.add("d/p/n", "first".to_string());
        let before = nodes.get_by_address("d/p/n").unwrap();

        nodes.update("d/p/n/$node", "second".to_string());

        assert_eq!(before.as_str(), "first");
        assert_eq!(nodes.get_by_address("d/p/n").unwrap().as_str(), "second");
        assert_eq!(nodes.get_all().len(), 1);
    }

    #[test]
    fn prefix_scan_respects_segment_boundaries() {
        let outputs = collection();
        outputs.add("d/p/n", "node".to_string());
        outputs.add("d/p/n/temperature/0", "t0".to_string());
        outputs.add("d/p/n2/temperature/0", "other".to_string());

        let mut found: Vec<String> = outputs
            .get_by_address_prefix("d/p/n/$node")
            .iter()
            .map(|value| value.to_string())
            .collect();
        found.sort();

        assert_eq!(found, vec!["node", "t0"]);
        assert!(outputs.get_by_address_prefix("d/p").is_empty());
    }

    #[test]
    fn remove_is_canonical_and_idempotent() {
        let nodes = collection();
        nodes.add("d/p/n", "node".to_string());

        nodes.remove("d/p/n/$node");
        nodes.remove("d/p/n/$node");

        assert!(nodes.is_empty());
    }

    #[test]
    fn unsigned_discovery_is_rejected() {
        let nodes = collection();
        let result = nodes.handle_discovery("d/p/n/$node", br#""plain""#);

        assert!(matches!(result, Err(MessageError::Unsigned)));
        assert!(nodes.is_empty());
    }
}
