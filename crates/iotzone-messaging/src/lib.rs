//! # iotzone Messaging
//!
//! Secured messaging on top of an iotzone bus.
//!
//! ## Components
//!
//! - [`MessageSigner`]: publishes objects as signed and optionally encrypted
//!   messages, and decodes inbound messages into verified objects
//! - [`DiscoveryCollection`]: stores discovered objects by canonical address
//!   and admits remote entries only after signature verification
//! - [`persistence`]: JSON snapshots of collections

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collection;
pub mod persistence;
pub mod signer;

pub use collection::DiscoveryCollection;
pub use persistence::{load_snapshot, save_snapshot, SnapshotError};
pub use signer::{resolver, Decoded, MessageError, MessageSigner, PublicKeyResolver};
