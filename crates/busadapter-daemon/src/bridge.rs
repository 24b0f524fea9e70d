//! Relay between two namespaces.

use std::sync::Arc;

use busadapter_core::{LogLevel, Logger};
use tokio::task::JoinHandle;

use crate::adapter::{StartError, connect_pair, subscribe_logged};
use crate::bus::{BusClient, MessageStream};
use crate::envelope::{Envelope, rewrite_namespace};

/// Forwards messages from a listener namespace into a publisher namespace.
pub struct Bridge {
    listener: Arc<dyn BusClient>,
    publisher: Arc<dyn BusClient>,
    namespace_listener: String,
    namespace_publisher: String,
    subscriptions: Vec<String>,
    logger: Arc<dyn Logger>,
}

impl Bridge {
    pub fn new(
        listener: Arc<dyn BusClient>,
        publisher: Arc<dyn BusClient>,
        namespace_listener: impl Into<String>,
        namespace_publisher: impl Into<String>,
        subscriptions: Vec<String>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            listener,
            publisher,
            namespace_listener: namespace_listener.into(),
            namespace_publisher: namespace_publisher.into(),
            subscriptions,
            logger,
        }
    }

    /// Connect and subscribe, then relay in the background until the
    /// subscription stream closes.
    pub async fn start(&self) -> Result<JoinHandle<()>, StartError> {
        connect_pair(&self.listener, &self.publisher, self.logger.as_ref()).await?;
        let input = subscribe_logged(
            self.listener.as_ref(),
            &self.subscriptions,
            self.logger.as_ref(),
        )
        .await?;

        let relay = Relay {
            publisher: Arc::clone(&self.publisher),
            logger: Arc::clone(&self.logger),
            from: self.namespace_listener.clone(),
            to: self.namespace_publisher.clone(),
        };
        Ok(tokio::spawn(relay.run(input)))
    }
}

struct Relay {
    publisher: Arc<dyn BusClient>,
    logger: Arc<dyn Logger>,
    from: String,
    to: String,
}

impl Relay {
    async fn run(self, mut input: MessageStream) {
        while let Some(message) = input.recv().await {
            self.forward(message).await;
        }
        tracing::debug!(from = %self.from, to = %self.to, "bridge input closed");
    }

    async fn forward(&self, message: String) {
        let mut envelope = match Envelope::parse(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.logger.log(LogLevel::Error, &e.to_string());
                return;
            }
        };

        let old_topic = envelope.topic().to_string();
        let message = if self.from == self.to {
            message
        } else {
            envelope.set_topic(rewrite_namespace(&old_topic, &self.from, &self.to));
            envelope.to_json()
        };

        match self.publisher.publish(envelope.topic(), &message).await {
            Ok(()) => self.logger.log(
                LogLevel::Debug,
                &format!(
                    "MQTT message relayed through bridge: {old_topic} => {}",
                    envelope.topic()
                ),
            ),
            Err(e) => self.logger.log(
                LogLevel::Error,
                &format!("MQTT message for bridge dropped: {message}, error={e}"),
            ),
        }
    }
}
