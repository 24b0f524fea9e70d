//! Couples a bus subscription to a worker and the worker's output back to
//! the bus.

use std::sync::Arc;

use busadapter_core::{LogLevel, Logger};
use tokio::task::JoinHandle;

use crate::bus::{BusClient, BusError, MessageStream, same_client};
use crate::envelope::{Envelope, parse_log_line};
use crate::worker::{Service, ServiceError, ServiceStreams};

/// Failure of one startup phase.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("can't connect: {0}")]
    Connect(#[source] BusError),

    #[error("can't subscribe: {0}")]
    Subscribe(#[source] BusError),

    #[error("can't start a service: {0}")]
    Service(#[source] ServiceError),
}

/// Connect the listener, and the publisher too unless it is the same
/// instance. A listener that connected stays connected if the publisher
/// then fails.
pub(crate) async fn connect_pair(
    listener: &Arc<dyn BusClient>,
    publisher: &Arc<dyn BusClient>,
    logger: &dyn Logger,
) -> Result<(), StartError> {
    listener.connect().await.map_err(StartError::Connect)?;
    if same_client(listener, publisher) {
        logger.log(
            LogLevel::Debug,
            "MQTT connection: listener and publisher are equal",
        );
    } else {
        publisher.connect().await.map_err(StartError::Connect)?;
    }
    Ok(())
}

pub(crate) async fn subscribe_logged(
    listener: &dyn BusClient,
    topics: &[String],
    logger: &dyn Logger,
) -> Result<MessageStream, StartError> {
    let stream = listener
        .subscribe(topics)
        .await
        .map_err(StartError::Subscribe)?;
    logger.log(
        LogLevel::Info,
        &format!("Topics subscribed: {}", topics.join(", ")),
    );
    Ok(stream)
}

/// Runs a [`Service`] between a listener and a publisher connection.
pub struct Adapter {
    listener: Arc<dyn BusClient>,
    publisher: Arc<dyn BusClient>,
    subscriptions: Vec<String>,
    service: Arc<dyn Service>,
    logger: Arc<dyn Logger>,
}

impl Adapter {
    /// `listener` and `publisher` may be the same instance, in which case it
    /// is connected once.
    pub fn new(
        listener: Arc<dyn BusClient>,
        publisher: Arc<dyn BusClient>,
        subscriptions: Vec<String>,
        service: Arc<dyn Service>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            listener,
            publisher,
            subscriptions,
            service,
            logger,
        }
    }

    /// Connect, subscribe and start the service, then route its output in
    /// the background.
    ///
    /// The returned handle completes once both the output and the error
    /// stream of the service have closed.
    pub async fn start(&self) -> Result<JoinHandle<()>, StartError> {
        connect_pair(&self.listener, &self.publisher, self.logger.as_ref()).await?;

        let input = if self.subscriptions.is_empty() {
            None
        } else {
            Some(
                subscribe_logged(
                    self.listener.as_ref(),
                    &self.subscriptions,
                    self.logger.as_ref(),
                )
                .await?,
            )
        };

        let streams = self
            .service
            .start(input)
            .await
            .map_err(StartError::Service)?;

        let publisher = Arc::clone(&self.publisher);
        let logger = Arc::clone(&self.logger);
        Ok(tokio::spawn(route(publisher, logger, streams)))
    }
}

/// Multiplex the service's two streams until both close. Neither stream has
/// priority over the other.
async fn route(publisher: Arc<dyn BusClient>, logger: Arc<dyn Logger>, streams: ServiceStreams) {
    let ServiceStreams {
        mut output,
        mut errors,
    } = streams;
    let mut output_open = true;
    let mut errors_open = true;

    while output_open || errors_open {
        tokio::select! {
            message = output.recv(), if output_open => match message {
                Some(message) => publish(publisher.as_ref(), logger.as_ref(), &message).await,
                None => output_open = false,
            },
            line = errors.recv(), if errors_open => match line {
                Some(line) => {
                    let (level, message) = parse_log_line(&line);
                    logger.log(level, &message);
                }
                None => errors_open = false,
            },
        }
    }
    tracing::debug!("service streams closed");
}

async fn publish(publisher: &dyn BusClient, logger: &dyn Logger, message: &str) {
    let envelope = match Envelope::parse(message) {
        Ok(envelope) => envelope,
        Err(e) => {
            logger.log(LogLevel::Error, &e.to_string());
            return;
        }
    };
    match publisher.publish(envelope.topic(), message).await {
        Ok(()) => logger.log(LogLevel::Debug, &format!("published: {message}")),
        Err(e) => logger.log(LogLevel::Error, &format!("can't publish: {e}")),
    }
}
