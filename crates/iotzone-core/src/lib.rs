//! # iotzone Core
//!
//! Addressing, identity keys, and message envelopes shared by every iotzone crate.
//!
//! ## Addresses
//!
//! Address scheme: `{domain}/{publisherId}/{nodeId}[/{ioType}/{instance}]/{$messageType}`
//!
//! The same string is used as the bus topic and, once the trailing
//! `$messageType` is removed, as the storage key of the object it describes.
//!
//! ## Envelopes
//!
//! - Plain JSON
//! - JWS compact serialization (ES256) around the JSON
//! - JWE compact serialization (ECDH-ES, A256GCM) around the JWS

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod envelope;
pub mod keys;
pub mod messages;

pub use address::{canonical, topic_matches, validate_pattern, Address, AddressError, MessageType};
pub use envelope::EnvelopeError;
pub use keys::{KeyError, KeyPair};
pub use messages::{
    InputDiscoveryMessage, NodeDiscoveryMessage, OutputDiscoveryMessage, OutputValueMessage,
    PublisherIdentity, PublisherIdentityMessage, SetInputMessage,
};
