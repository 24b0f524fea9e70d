//! MQTT implementation of [`BusClient`] on top of `rumqttc`.
//!
//! `connect` drives the event loop until the broker acknowledges the
//! session, then moves it into one dispatch task. Outgoing requests only
//! reach the socket while that task polls, so it never waits on a consumer:
//! incoming publishes are queued to a separate delivery task that feeds the
//! [`SubscriptionRegistry`]. Whenever the transport drops, the dispatcher
//! backs off, lets the event loop reconnect, and replays the registry from
//! another task so existing streams keep flowing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use busadapter_core::{Credentials, LogLevel, Logger};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet, QoS, SubscribeFilter, SubscribeReasonCode,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::topic::validate_filters;
use super::{BusClient, BusError, MessageStream, ReconnectPolicy, SubscriptionRegistry};

/// Port used when the URL names none.
pub const DEFAULT_PORT: u16 = 1883;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;

/// A single MQTT connection with subscription bookkeeping.
pub struct MqttClient {
    url: String,
    client: AsyncClient,
    /// Present until `connect` hands it to the dispatch task.
    event_loop: Mutex<Option<EventLoop>>,
    registry: Arc<SubscriptionRegistry>,
    logger: Arc<dyn Logger>,
    reconnect: ReconnectPolicy,
    connected: AtomicBool,
    closing: watch::Sender<bool>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    /// Create a client for `url` (`tcp://host:port` or `mqtt://host:port`).
    /// Nothing is sent until [`BusClient::connect`].
    pub fn new(
        url: &str,
        client_id: &str,
        credentials: &Credentials,
        logger: Arc<dyn Logger>,
    ) -> Result<Self, BusError> {
        let (host, port) = broker_address(url)?;
        if client_id.is_empty() || client_id.starts_with(' ') {
            return Err(BusError::InvalidClientId(client_id.to_string()));
        }
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if !credentials.is_empty() {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (closing, _) = watch::channel(false);

        Ok(Self {
            url: url.to_string(),
            client,
            event_loop: Mutex::new(Some(event_loop)),
            registry: Arc::new(SubscriptionRegistry::default()),
            logger,
            reconnect: ReconnectPolicy::default(),
            connected: AtomicBool::new(false),
            closing,
            dispatch: Mutex::new(None),
        })
    }

    /// Replace the back-off schedule used after a lost connection.
    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Close the connection. The dispatch task stops and every stream
    /// returned by `subscribe` closes.
    pub async fn disconnect(&self) -> Result<(), BusError> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Err(BusError::NotConnected);
        }
        self.closing.send_replace(true);
        if let Err(e) = self.client.disconnect().await {
            debug!(url = %self.url, error = %e, "disconnect request not delivered");
        }

        let handle = self.dispatch.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(url = %self.url, error = %e, "dispatch task ended abnormally");
            }
        }
        self.registry.close();
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), BusError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }
}

#[async_trait]
impl BusClient for MqttClient {
    async fn connect(&self) -> Result<(), BusError> {
        let mut event_loop = self
            .event_loop
            .lock()
            .take()
            .ok_or(BusError::AlreadyConnected)?;

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    *self.event_loop.lock() = Some(event_loop);
                    return Err(BusError::Refused(format!("{:?}", ack.code)));
                }
                Ok(event) => debug!(url = %self.url, ?event, "event before connack"),
                Err(e) => {
                    *self.event_loop.lock() = Some(event_loop);
                    return Err(connection_error(&e));
                }
            }
        }

        self.connected.store(true, Ordering::Release);
        self.logger.log(
            LogLevel::Info,
            &format!("MQTT client connected to {}", self.url),
        );

        let task = Dispatcher {
            url: self.url.clone(),
            client: self.client.clone(),
            registry: Arc::clone(&self.registry),
            logger: Arc::clone(&self.logger),
            reconnect: self.reconnect.clone(),
            closing: self.closing.subscribe(),
        };
        *self.dispatch.lock() = Some(tokio::spawn(task.run(event_loop)));
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream, BusError> {
        self.ensure_connected()?;
        validate_filters(topics)?;

        // Register before asking the broker so no early message is missed.
        let (index, stream) = self.registry.register(topics);
        if let Err(e) = self.client.subscribe_many(filters(topics)).await {
            self.registry.retire(index);
            return Err(client_error(&e));
        }
        debug!(url = %self.url, index, topics = ?topics, "subscribed");
        Ok(stream)
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<(), BusError> {
        self.ensure_connected()?;
        self.client
            .publish(topic, QoS::AtMostOnce, false, message.as_bytes().to_vec())
            .await
            .map_err(|e| client_error(&e))
    }
}

/// State moved into the dispatch task.
struct Dispatcher {
    url: String,
    client: AsyncClient,
    registry: Arc<SubscriptionRegistry>,
    logger: Arc<dyn Logger>,
    reconnect: ReconnectPolicy,
    closing: watch::Receiver<bool>,
}

impl Dispatcher {
    async fn run(mut self, mut event_loop: EventLoop) {
        let (deliveries, pending) = mpsc::unbounded_channel();
        let delivery = tokio::spawn(deliver_all(Arc::clone(&self.registry), pending));
        let mut attempt: u32 = 0;

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = String::from_utf8_lossy(&publish.payload).into_owned();
                    if deliveries.send((publish.topic, message)).is_err() {
                        warn!(url = %self.url, "delivery task is gone");
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    attempt = 0;
                    self.logger.log(
                        LogLevel::Info,
                        &format!("MQTT client reconnected to {}", self.url),
                    );
                    self.resubscribe();
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        self.logger.log(
                            LogLevel::Error,
                            &format!("broker rejected subscription (packet {})", ack.pkid),
                        );
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!(url = %self.url, "disconnect sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if *self.closing.borrow() {
                        break;
                    }
                    self.logger.log(
                        LogLevel::Info,
                        &format!("MQTT client lost connection to {}: {e}", self.url),
                    );
                    if !self.reconnect.should_retry(attempt) {
                        self.logger.log(
                            LogLevel::Error,
                            &format!("giving up on {} after {attempt} reconnect attempts", self.url),
                        );
                        break;
                    }

                    let delay = self.reconnect.delay_for_attempt(attempt);
                    debug!(url = %self.url, attempt, delay_ms = delay.as_millis(), "reconnecting");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = self.closing.changed() => break,
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }

        // A delivery parked on a full stream holds a clone of its sender;
        // aborting drops it so every stream closes now.
        drop(deliveries);
        delivery.abort();
        self.registry.close();
        debug!(url = %self.url, "dispatch task finished");
    }

    /// Replay the registry onto the new session. The requests wait for room
    /// in the request queue, which only drains while `run` keeps polling.
    fn resubscribe(&self) {
        let url = self.url.clone();
        let client = self.client.clone();
        let registry = Arc::clone(&self.registry);
        let logger = Arc::clone(&self.logger);

        tokio::spawn(async move {
            let failures = registry
                .replay(
                    |topics| {
                        let client = client.clone();
                        async move {
                            client
                                .subscribe_many(filters(&topics))
                                .await
                                .map_err(|e| client_error(&e))
                        }
                    },
                    logger.as_ref(),
                )
                .await;
            debug!(url = %url, failures, "subscriptions replayed");
        });
    }
}

/// Feed queued publishes to the registry in arrival order.
async fn deliver_all(
    registry: Arc<SubscriptionRegistry>,
    mut pending: mpsc::UnboundedReceiver<(String, String)>,
) {
    while let Some((topic, message)) = pending.recv().await {
        registry.deliver(&topic, &message).await;
    }
}

fn filters(topics: &[String]) -> Vec<SubscribeFilter> {
    topics
        .iter()
        .map(|t| SubscribeFilter::new(t.clone(), QoS::AtMostOnce))
        .collect()
}

fn connection_error(e: &ConnectionError) -> BusError {
    match e {
        ConnectionError::ConnectionRefused(code) => BusError::Refused(format!("{code:?}")),
        other => BusError::Transport(other.to_string()),
    }
}

fn client_error(e: &ClientError) -> BusError {
    BusError::Transport(e.to_string())
}

/// Split a broker URL into host and port.
pub fn broker_address(raw: &str) -> Result<(String, u16), BusError> {
    let invalid = |reason: String| BusError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "tcp" | "mqtt" => {}
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host".into()))?;
    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_PORT)))
}
