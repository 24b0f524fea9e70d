//! In-process bus for tests.
//!
//! `MemoryBus` plays the broker: it remembers, per client, which filters are
//! active on the current session. `MemoryClient` keeps the same
//! [`SubscriptionRegistry`] a real client does, so a simulated reconnect
//! (session dropped, registry replayed) exercises the production replay
//! path.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use busadapter_core::{ConsoleLogger, Logger};
use parking_lot::Mutex;

use super::topic::{matches_any, validate_filters};
use super::{BusClient, BusError, MessageStream, SubscriptionRegistry};

/// Broker side of the in-memory bus.
#[derive(Default)]
pub struct MemoryBus {
    clients: Mutex<Vec<Weak<MemoryClient>>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn live_clients(&self) -> Vec<Arc<MemoryClient>> {
        let mut clients = self.clients.lock();
        clients.retain(|c| c.strong_count() > 0);
        clients.iter().filter_map(Weak::upgrade).collect()
    }

    /// Deliver `message` to every client whose session selects `topic`.
    pub async fn route(&self, topic: &str, message: &str) {
        for client in self.live_clients() {
            if client.session_matches(topic) {
                client.registry.deliver(topic, message).await;
            }
        }
    }

    /// Forget every session, as a restarted broker would.
    pub fn drop_sessions(&self) {
        for client in self.live_clients() {
            client.session.lock().clear();
        }
    }

    /// Close every subscription stream of every client. Publishing still
    /// works but reaches nobody.
    pub fn close(&self) {
        for client in self.live_clients() {
            client.registry.close();
        }
    }
}

/// Client side of the in-memory bus.
pub struct MemoryClient {
    bus: Arc<MemoryBus>,
    registry: SubscriptionRegistry,
    /// Filters the broker currently holds for this client.
    session: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, String)>>,
    logger: Arc<dyn Logger>,
    connected: AtomicBool,
    connects: AtomicUsize,
    fail_connect: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
    fail_resubscribe: Mutex<Vec<String>>,
}

impl MemoryClient {
    pub fn new(bus: &Arc<MemoryBus>) -> Arc<Self> {
        Self::with_logger(bus, Arc::new(ConsoleLogger::default()))
    }

    pub fn with_logger(bus: &Arc<MemoryBus>, logger: Arc<dyn Logger>) -> Arc<Self> {
        let client = Arc::new(Self {
            bus: Arc::clone(bus),
            registry: SubscriptionRegistry::default(),
            session: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            logger,
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            fail_resubscribe: Mutex::new(Vec::new()),
        });
        bus.clients.lock().push(Arc::downgrade(&client));
        client
    }

    /// Make every following `connect` fail with "connect error".
    pub fn fail_connect(&self) {
        self.fail_connect.store(true, Ordering::Release);
    }

    /// Make every following `subscribe` fail with "subscribe error".
    pub fn fail_subscribe(&self) {
        self.fail_subscribe.store(true, Ordering::Release);
    }

    /// Make every following `publish` fail with "publish error".
    pub fn fail_publish(&self) {
        self.fail_publish.store(true, Ordering::Release);
    }

    /// Make replay of any registration containing `topic` fail.
    pub fn fail_resubscribe(&self, topic: &str) {
        self.fail_resubscribe.lock().push(topic.to_string());
    }

    /// How many times `connect` was called.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    /// Every `(topic, message)` this client published, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    /// Simulate a transport reconnect: the broker-side session is lost and
    /// the registry is replayed onto the new one. Returns the number of
    /// registrations that failed to resubscribe.
    pub async fn reconnect(&self) -> usize {
        self.session.lock().clear();
        self.registry
            .replay(
                |topics| std::future::ready(self.resubscribe(&topics)),
                self.logger.as_ref(),
            )
            .await
    }

    fn resubscribe(&self, topics: &[String]) -> Result<(), BusError> {
        if topics
            .iter()
            .any(|t| self.fail_resubscribe.lock().contains(t))
        {
            return Err(BusError::Transport("subscribe error".into()));
        }
        self.session.lock().extend_from_slice(topics);
        Ok(())
    }

    fn session_matches(&self, topic: &str) -> bool {
        matches_any(&self.session.lock(), topic)
    }
}

#[async_trait]
impl BusClient for MemoryClient {
    async fn connect(&self) -> Result<(), BusError> {
        self.connects.fetch_add(1, Ordering::AcqRel);
        if self.fail_connect.load(Ordering::Acquire) {
            return Err(BusError::Transport("connect error".into()));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream, BusError> {
        if self.fail_subscribe.load(Ordering::Acquire) {
            return Err(BusError::Transport("subscribe error".into()));
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(BusError::NotConnected);
        }
        validate_filters(topics)?;

        let (_, stream) = self.registry.register(topics);
        self.session.lock().extend_from_slice(topics);
        Ok(stream)
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<(), BusError> {
        if self.fail_publish.load(Ordering::Acquire) {
            return Err(BusError::Transport("publish error".into()));
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(BusError::NotConnected);
        }
        self.published
            .lock()
            .push((topic.to_string(), message.to_string()));
        self.bus.route(topic, message).await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use busadapter_core::LogLevel;
    use busadapter_core::logging::MemoryLogger;
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn topics(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    async fn next(stream: &mut MessageStream) -> String {
        timeout(WAIT, stream.recv())
            .await
            .expect("message within timeout")
            .expect("stream open")
    }

    async fn connected(bus: &Arc<MemoryBus>) -> Arc<MemoryClient> {
        let client = MemoryClient::new(bus);
        client.connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn independent_clients_receive_their_topics() {
        let bus = MemoryBus::new();
        let client1 = connected(&bus).await;
        let client2 = connected(&bus).await;
        let client3 = connected(&bus).await;

        let mut messages2 = client2.subscribe(&topics(&["test", "work"])).await.unwrap();
        let mut messages3 = client3.subscribe(&topics(&["work", "job"])).await.unwrap();

        client1.publish("test", "123").await.unwrap();
        client1.publish("job", "456").await.unwrap();
        client1.publish("work", "789").await.unwrap();
        client1.publish("job", "012").await.unwrap();

        assert_eq!(next(&mut messages2).await, "123");
        assert_eq!(next(&mut messages2).await, "789");
        assert_eq!(next(&mut messages3).await, "456");
        assert_eq!(next(&mut messages3).await, "789");
        assert_eq!(next(&mut messages3).await, "012");
    }

    #[tokio::test]
    async fn streams_survive_reconnect() {
        let bus = MemoryBus::new();
        let publisher = connected(&bus).await;
        let client = connected(&bus).await;

        let mut a = client.subscribe(&topics(&["test", "work"])).await.unwrap();
        let mut b = client.subscribe(&topics(&["work", "job"])).await.unwrap();

        bus.drop_sessions();
        publisher.publish("test", "lost").await.unwrap();
        assert_eq!(client.reconnect().await, 0);

        publisher.publish("test", "123").await.unwrap();
        publisher.publish("job", "456").await.unwrap();
        publisher.publish("work", "789").await.unwrap();

        assert_eq!(next(&mut a).await, "123");
        assert_eq!(next(&mut a).await, "789");
        assert_eq!(next(&mut b).await, "456");
        assert_eq!(next(&mut b).await, "789");
    }

    #[tokio::test]
    async fn failed_resubscribe_does_not_stop_the_rest() {
        let bus = MemoryBus::new();
        let publisher = connected(&bus).await;
        let logger = Arc::new(MemoryLogger::new());
        let client = MemoryClient::with_logger(&bus, logger.clone());
        client.connect().await.unwrap();

        let mut a = client.subscribe(&topics(&["a"])).await.unwrap();
        let mut b = client.subscribe(&topics(&["b"])).await.unwrap();
        client.fail_resubscribe("a");

        assert_eq!(client.reconnect().await, 1);
        assert_eq!(
            logger.at(LogLevel::Error),
            vec!["can't resubscribe to a: subscribe error"]
        );

        publisher.publish("a", "dropped").await.unwrap();
        publisher.publish("b", "kept").await.unwrap();
        assert_eq!(next(&mut b).await, "kept");
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let bus = MemoryBus::new();
        let client = connected(&bus).await;
        let mut stream = client.subscribe(&topics(&["a"])).await.unwrap();

        bus.close();
        assert!(timeout(WAIT, stream.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forced_failures() {
        let bus = MemoryBus::new();
        let client = MemoryClient::new(&bus);
        client.fail_connect();
        assert_eq!(
            client.connect().await.unwrap_err().to_string(),
            "connect error"
        );
        assert_eq!(client.connect_count(), 1);

        let other = connected(&bus).await;
        other.fail_subscribe();
        other.fail_publish();
        assert!(other.subscribe(&topics(&["a"])).await.is_err());
        assert!(other.publish("a", "x").await.is_err());
        assert!(other.published().is_empty());
    }
}
