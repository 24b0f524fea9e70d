//! Bus client abstraction and its implementations.
//!
//! - [`BusClient`]: connect / subscribe / publish capability used by the
//!   adapter, the bridge and the remote logger
//! - [`MqttClient`]: production client on top of `rumqttc`
//! - [`SubscriptionRegistry`]: ordered record of subscriptions, replayed
//!   after every transport reconnect
//! - `MemoryBus` / `MemoryClient`: in-process double (feature `test-utils`)

mod client;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod mqtt;
pub mod reconnect;
pub mod registry;
pub mod topic;

pub use client::{BusClient, BusError, MessageStream, STREAM_CAPACITY, same_client};
pub use mqtt::MqttClient;
pub use reconnect::ReconnectPolicy;
pub use registry::SubscriptionRegistry;
