//! The capability set every bus connection offers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Capacity of every subscription stream.
pub const STREAM_CAPACITY: usize = 256;

/// Messages delivered for one `subscribe` call. The same stream keeps
/// receiving across transport reconnects and closes when the client shuts
/// down.
pub type MessageStream = mpsc::Receiver<String>;

/// A publish/subscribe connection.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Establish the transport connection.
    async fn connect(&self) -> Result<(), BusError>;

    /// Subscribe to a set of topic filters, returning one stream that
    /// carries messages for all of them.
    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream, BusError>;

    /// Publish one message, waiting until the transport has taken it.
    async fn publish(&self, topic: &str, message: &str) -> Result<(), BusError>;
}

/// Whether two handles refer to the same client instance.
///
/// Identity, not configuration: two clients with equal URLs are still two
/// connections.
pub fn same_client(a: &Arc<dyn BusClient>, b: &Arc<dyn BusClient>) -> bool {
    Arc::ptr_eq(a, b)
}

/// Errors from bus operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("invalid bus url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid client id '{0}'")]
    InvalidClientId(String),

    #[error("no topics to subscribe")]
    NoTopics,

    #[error("invalid topic filter '{0}'")]
    InvalidTopic(String),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("{0}")]
    Transport(String),

    #[error("bus client closed")]
    Closed,
}
