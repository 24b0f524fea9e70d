//! Workers: anything that turns a stream of input lines into output and
//! error lines.

mod lines;
pub mod process;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::MessageStream;

pub use process::{ProcessService, WorkerEnv};

/// Output side of a started service.
#[derive(Debug)]
pub struct ServiceStreams {
    /// Lines the worker emits as messages to publish.
    pub output: mpsc::Receiver<String>,
    /// Lines the worker emits as diagnostics.
    pub errors: mpsc::Receiver<String>,
}

/// A worker the adapter can drive.
#[async_trait]
pub trait Service: Send + Sync {
    /// Start the worker. `input` is `None` when there is nothing to feed it.
    async fn start(&self, input: Option<MessageStream>) -> Result<ServiceStreams, ServiceError>;
}

/// Errors from starting a worker.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("empty command line")]
    InvalidCommand,

    #[error("can't start command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("can't get {0}")]
    MissingPipe(&'static str),
}
