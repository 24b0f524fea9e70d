//! Ordered record of every `subscribe` call made on a client.
//!
//! Each registration owns the sending half of the stream handed back to the
//! caller. Registrations are only ever appended, so an index stays valid for
//! the lifetime of the client, and replay after a reconnect walks them in
//! the order they were made. A single lock guards the list; it is never held
//! across an await.

use std::future::Future;

use busadapter_core::{LogLevel, Logger};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::topic::matches_any;
use super::{BusError, MessageStream, STREAM_CAPACITY};

struct Registration {
    topics: Vec<String>,
    sink: mpsc::Sender<String>,
}

/// Append-only subscription list shared between `subscribe` callers and the
/// transport's dispatch task.
pub struct SubscriptionRegistry {
    entries: Mutex<Vec<Option<Registration>>>,
    capacity: usize,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(STREAM_CAPACITY)
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry whose streams buffer `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record a new subscription and return its index and stream.
    pub fn register(&self, topics: &[String]) -> (usize, MessageStream) {
        let (sink, stream) = mpsc::channel(self.capacity);
        let mut entries = self.entries.lock();
        entries.push(Some(Registration {
            topics: topics.to_vec(),
            sink,
        }));
        (entries.len() - 1, stream)
    }

    /// Retire a registration whose initial subscribe request failed. Its
    /// stream closes and it is skipped by later replays.
    pub fn retire(&self, index: usize) {
        if let Some(slot) = self.entries.lock().get_mut(index) {
            *slot = None;
        }
    }

    /// Live registrations as `(index, topics)`, in registration order.
    pub fn topics(&self) -> Vec<(usize, Vec<String>)> {
        self.entries
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|r| (i, r.topics.clone())))
            .collect()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries.lock().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-issue every live registration through `resubscribe`, in order.
    /// Each request completes before the next one starts.
    ///
    /// A failure is logged and does not stop the remaining registrations.
    /// Returns the number of failures.
    pub async fn replay<F, Fut>(&self, mut resubscribe: F, logger: &dyn Logger) -> usize
    where
        F: FnMut(Vec<String>) -> Fut,
        Fut: Future<Output = Result<(), BusError>>,
    {
        let mut failures = 0;
        for (index, topics) in self.topics() {
            match resubscribe(topics.clone()).await {
                Ok(()) => debug!(index, topics = ?topics, "resubscribed"),
                Err(e) => {
                    failures += 1;
                    logger.log(
                        LogLevel::Error,
                        &format!("can't resubscribe to {}: {e}", topics.join(", ")),
                    );
                }
            }
        }
        failures
    }

    /// Hand a message to every registration whose filters select `topic`.
    ///
    /// Waits while a stream is full. A stream whose receiver is gone is
    /// skipped.
    pub async fn deliver(&self, topic: &str, message: &str) -> usize {
        let sinks: Vec<mpsc::Sender<String>> = self
            .entries
            .lock()
            .iter()
            .flatten()
            .filter(|r| matches_any(&r.topics, topic))
            .map(|r| r.sink.clone())
            .collect();

        let mut delivered = 0;
        for sink in sinks {
            if sink.send(message.to_string()).await.is_ok() {
                delivered += 1;
            } else {
                debug!(topic, "subscription stream dropped by its consumer");
            }
        }
        delivered
    }

    /// Close every stream. Registrations are kept so indices stay stable,
    /// but nothing is delivered or replayed afterwards.
    pub fn close(&self) {
        for slot in self.entries.lock().iter_mut() {
            *slot = None;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use busadapter_core::logging::MemoryLogger;

    use super::*;

    fn topics(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn deliver_routes_by_filter() {
        let registry = SubscriptionRegistry::default();
        let (_, mut a) = registry.register(&topics(&["test", "work"]));
        let (_, mut b) = registry.register(&topics(&["work", "job"]));

        assert_eq!(registry.deliver("test", "123").await, 1);
        assert_eq!(registry.deliver("job", "456").await, 1);
        assert_eq!(registry.deliver("work", "789").await, 2);
        assert_eq!(registry.deliver("other", "000").await, 0);

        assert_eq!(a.recv().await.unwrap(), "123");
        assert_eq!(a.recv().await.unwrap(), "789");
        assert_eq!(b.recv().await.unwrap(), "456");
        assert_eq!(b.recv().await.unwrap(), "789");
    }

    #[tokio::test]
    async fn replay_preserves_registration_order() {
        let registry = SubscriptionRegistry::default();
        let (_a, _sa) = registry.register(&topics(&["a"]));
        let (_b, _sb) = registry.register(&topics(&["b1", "b2"]));
        let (_c, _sc) = registry.register(&topics(&["c"]));

        let mut seen = Vec::new();
        let logger = MemoryLogger::new();
        let failures = registry
            .replay(
                |t| {
                    seen.push(t);
                    std::future::ready(Ok(()))
                },
                &logger,
            )
            .await;

        assert_eq!(failures, 0);
        assert_eq!(seen, vec![topics(&["a"]), topics(&["b1", "b2"]), topics(&["c"])]);
        assert!(logger.records().is_empty());
    }

    #[tokio::test]
    async fn replay_continues_after_a_failure() {
        let registry = SubscriptionRegistry::default();
        let (_, _sa) = registry.register(&topics(&["a"]));
        let (_, _sb) = registry.register(&topics(&["b"]));
        let (_, _sc) = registry.register(&topics(&["c"]));

        let mut attempted = Vec::new();
        let logger = MemoryLogger::new();
        let failures = registry
            .replay(
                |t| {
                    attempted.push(t[0].clone());
                    std::future::ready(if t[0] == "b" {
                        Err(BusError::Transport("subscribe error".into()))
                    } else {
                        Ok(())
                    })
                },
                &logger,
            )
            .await;

        assert_eq!(failures, 1);
        assert_eq!(attempted, vec!["a", "b", "c"]);
        assert_eq!(
            logger.at(LogLevel::Error),
            vec!["can't resubscribe to b: subscribe error"]
        );
    }

    #[tokio::test]
    async fn replay_waits_for_each_request_in_turn() {
        let registry = SubscriptionRegistry::default();
        let (_, _sa) = registry.register(&topics(&["a"]));
        let (_, _sb) = registry.register(&topics(&["b"]));

        let log = Arc::new(Mutex::new(Vec::new()));
        let logger = MemoryLogger::new();
        let failures = registry
            .replay(
                |t| {
                    let log = Arc::clone(&log);
                    async move {
                        log.lock().push(format!("start {}", t[0]));
                        tokio::task::yield_now().await;
                        log.lock().push(format!("done {}", t[0]));
                        Ok(())
                    }
                },
                &logger,
            )
            .await;

        assert_eq!(failures, 0);
        assert_eq!(*log.lock(), vec!["start a", "done a", "start b", "done b"]);
    }

    #[tokio::test]
    async fn retired_registrations_are_skipped() {
        let registry = SubscriptionRegistry::default();
        let (first, mut stream) = registry.register(&topics(&["a"]));
        let (_, _keep) = registry.register(&topics(&["b"]));
        registry.retire(first);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.topics(), vec![(1, topics(&["b"]))]);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_ends_every_stream() {
        let registry = SubscriptionRegistry::default();
        let (_, mut a) = registry.register(&topics(&["a"]));
        let (_, mut b) = registry.register(&topics(&["b"]));
        registry.close();

        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.deliver("a", "late").await, 0);
    }

    #[tokio::test]
    async fn dropped_consumer_does_not_block_others() {
        let registry = SubscriptionRegistry::default();
        let (_, dropped) = registry.register(&topics(&["a"]));
        let (_, mut kept) = registry.register(&topics(&["a"]));
        drop(dropped);

        assert_eq!(registry.deliver("a", "x").await, 1);
        assert_eq!(kept.recv().await.unwrap(), "x");
    }
}
