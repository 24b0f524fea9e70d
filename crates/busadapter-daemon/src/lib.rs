//! busadapter Daemon Library
//!
//! Hosts an external worker behind an MQTT bus and relays messages between
//! bus namespaces:
//! - Reconnect-aware bus client that keeps subscriptions alive
//! - Subprocess worker speaking newline-delimited text on stdio
//! - Adapter wiring bus subscriptions to the worker and back
//! - Bridge rewriting topics from one namespace into another

pub mod adapter;
pub mod bridge;
pub mod bus;
pub mod envelope;
pub mod remote_log;
pub mod runtime;
pub mod worker;

pub use adapter::{Adapter, StartError};
pub use bridge::Bridge;
pub use bus::{BusClient, BusError, MqttClient};
pub use worker::{ProcessService, Service, ServiceError, ServiceStreams};
