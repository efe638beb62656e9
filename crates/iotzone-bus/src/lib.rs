//! # iotzone Bus
//!
//! Transport-agnostic publish/subscribe bus.
//!
//! ## Implementations
//!
//! - [`MqttBus`]: MQTT broker client with connect retry, last will, and
//!   subscription replay on every reconnect
//! - [`MemoryBus`]: in-process bus that delivers synchronously, for tests
//!
//! Subscription patterns use MQTT wildcards: `+` for one segment and a
//! trailing `#` for the remaining segments.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod config;
pub mod memory;
pub mod mqtt;

pub use bus::{handler, BusError, Handler, HandlerError, LastWill, MessageBus, SubscriptionId};
pub use config::BusConfig;
pub use memory::MemoryBus;
pub use mqtt::MqttBus;
