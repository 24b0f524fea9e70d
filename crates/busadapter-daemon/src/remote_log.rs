//! Logger that also publishes records to the bus.
//!
//! Records go to the console logger first. Those at or above the remote
//! threshold are then queued and published by a background task on
//! `<namespace>/log/<service_name>/<service_uuid>/<level>`. Remote
//! publishing is best-effort: a failed publish is reported on the console
//! only, and when the queue is full new records are dropped with a console
//! note.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use busadapter_core::{LogLevel, Logger, Settings};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::bus::BusClient;

/// Who is logging, as stamped on every remote record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSource {
    pub namespace: String,
    pub service_name: String,
    pub service_uuid: String,
    pub service_host: String,
}

impl LogSource {
    /// Remote records go to the publisher namespace.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            namespace: settings.namespace_publisher.clone(),
            service_name: settings.service_name.clone(),
            service_uuid: settings.service_uuid.clone(),
            service_host: settings.service_host.clone(),
        }
    }
}

/// Records waiting for the publisher.
pub const LOG_QUEUE_CAPACITY: usize = 1024;

type Outgoing = (String, String);

pub struct BusLogger {
    console: Arc<dyn Logger>,
    remote_threshold: LogLevel,
    source: LogSource,
    clock: fn() -> DateTime<Utc>,
    capacity: usize,
    queue: OnceLock<mpsc::Sender<Outgoing>>,
    /// Records dropped since the queue last accepted one.
    dropped: AtomicUsize,
}

impl BusLogger {
    pub fn new(console: Arc<dyn Logger>, remote_threshold: LogLevel, source: LogSource) -> Self {
        Self {
            console,
            remote_threshold,
            source,
            clock: Utc::now,
            capacity: LOG_QUEUE_CAPACITY,
            queue: OnceLock::new(),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Bound the number of records waiting to be published.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Replace the clock used for `created_at`.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Start publishing through `publisher`. Records logged before this are
    /// not published. Only the first call has any effect.
    pub fn attach(&self, publisher: Arc<dyn BusClient>) {
        let (tx, mut rx) = mpsc::channel::<Outgoing>(self.capacity);
        if self.queue.set(tx).is_err() {
            tracing::warn!("remote logger already attached");
            return;
        }

        let console = Arc::clone(&self.console);
        tokio::spawn(async move {
            while let Some((topic, body)) = rx.recv().await {
                if let Err(e) = publisher.publish(&topic, &body).await {
                    console.log(
                        LogLevel::Error,
                        &format!("can't publish a log message: {body}: {e}"),
                    );
                }
            }
        });
    }

    fn record(&self, level: LogLevel, message: &str) -> Outgoing {
        let source = &self.source;
        let topic = format!(
            "{}/log/{}/{}/{level}",
            source.namespace, source.service_name, source.service_uuid
        );
        let created_at = (self.clock)().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let body = json!({
            "topic": topic,
            "service_name": source.service_name,
            "service_uuid": source.service_uuid,
            "service_host": source.service_host,
            "created_at": created_at,
            "payload": {
                "log_entry": {
                    "log_level": level.as_str(),
                    "log_message": message,
                }
            }
        });
        (topic, body.to_string())
    }
}

impl Logger for BusLogger {
    fn log(&self, level: LogLevel, message: &str) {
        self.console.log(level, message);

        if level.is_weaker(self.remote_threshold) {
            return;
        }
        if let Some(queue) = self.queue.get() {
            self.enqueue(queue, self.record(level, message));
        }
    }
}

impl BusLogger {
    /// Console notes go straight to the console logger so they never
    /// re-enter the queue.
    fn enqueue(&self, queue: &mpsc::Sender<Outgoing>, record: Outgoing) {
        match queue.try_send(record) {
            Ok(()) => {
                let dropped = self.dropped.swap(0, Ordering::AcqRel);
                if dropped > 0 {
                    self.console.log(
                        LogLevel::Warning,
                        &format!("{dropped} log records were not published: queue was full"),
                    );
                }
            }
            Err(TrySendError::Full(_)) => {
                if self.dropped.fetch_add(1, Ordering::AcqRel) == 0 {
                    self.console.log(
                        LogLevel::Warning,
                        "remote log queue is full, dropping records",
                    );
                }
            }
            // The drain task only ends with the runtime.
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use busadapter_core::logging::MemoryLogger;
    use chrono::{TimeDelta, TimeZone};
    use parking_lot::Mutex;
    use tokio::sync::watch;

    use super::*;
    use crate::bus::memory::{MemoryBus, MemoryClient};
    use crate::bus::{BusError, MessageStream};

    /// Publisher that holds every publish until its gate opens.
    struct Gated {
        open: watch::Receiver<bool>,
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BusClient for Gated {
        async fn connect(&self) -> Result<(), BusError> {
            Ok(())
        }

        async fn subscribe(&self, _topics: &[String]) -> Result<MessageStream, BusError> {
            Err(BusError::NotConnected)
        }

        async fn publish(&self, _topic: &str, message: &str) -> Result<(), BusError> {
            let mut open = self.open.clone();
            open.wait_for(|open| *open)
                .await
                .map_err(|_| BusError::Closed)?;
            self.published.lock().push(message.to_string());
            Ok(())
        }
    }

    fn fixed_clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 3, 4, 5, 6, 7).unwrap() + TimeDelta::try_milliseconds(89).unwrap()
    }

    fn source() -> LogSource {
        LogSource {
            namespace: "default".into(),
            service_name: "svc".into(),
            service_uuid: "uuid1".into(),
            service_host: "host1".into(),
        }
    }

    async fn eventually(condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn publishes_records_at_or_above_threshold() {
        let bus = MemoryBus::new();
        let client = MemoryClient::new(&bus);
        client.connect().await.unwrap();
        let console = Arc::new(MemoryLogger::new());
        let logger =
            BusLogger::new(console.clone(), LogLevel::Warning, source()).with_clock(fixed_clock);
        logger.attach(client.clone());

        logger.log(LogLevel::Info, "quiet");
        logger.log(LogLevel::Error, "loud");

        eventually(|| !client.published().is_empty()).await;
        let published = client.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "default/log/svc/uuid1/error");
        assert_eq!(
            published[0].1,
            concat!(
                r#"{"topic":"default/log/svc/uuid1/error","#,
                r#""service_name":"svc","service_uuid":"uuid1","service_host":"host1","#,
                r#""created_at":"2019-03-04T05:06:07.089Z","#,
                r#""payload":{"log_entry":{"log_level":"error","log_message":"loud"}}}"#
            )
        );
        assert_eq!(console.records().len(), 2);
    }

    #[tokio::test]
    async fn nothing_is_published_before_attach() {
        let bus = MemoryBus::new();
        let client = MemoryClient::new(&bus);
        client.connect().await.unwrap();
        let console = Arc::new(MemoryLogger::new());
        let logger = BusLogger::new(console.clone(), LogLevel::Debug, source());

        logger.log(LogLevel::Error, "early");
        logger.attach(client.clone());
        logger.log(LogLevel::Error, "late");

        eventually(|| !client.published().is_empty()).await;
        assert_eq!(client.published().len(), 1);
        assert!(client.published()[0].1.contains("late"));
        assert_eq!(console.at(LogLevel::Error), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn failed_publish_is_reported_on_console_only() {
        let bus = MemoryBus::new();
        let client = MemoryClient::new(&bus);
        client.connect().await.unwrap();
        client.fail_publish();
        let console = Arc::new(MemoryLogger::new());
        let logger = BusLogger::new(console.clone(), LogLevel::Debug, source());
        logger.attach(client.clone());

        logger.log(LogLevel::Critical, "down");

        eventually(|| console.records().len() == 2).await;
        let reported = console.at(LogLevel::Error);
        assert_eq!(reported.len(), 1);
        assert!(reported[0].starts_with("can't publish a log message: "));
        assert!(reported[0].ends_with(": publish error"));
        assert!(client.published().is_empty());
    }

    #[tokio::test]
    async fn full_queue_drops_records_with_a_console_note() {
        let (gate, open) = watch::channel(false);
        let publisher = Arc::new(Gated {
            open,
            published: Mutex::new(Vec::new()),
        });
        let console = Arc::new(MemoryLogger::new());
        let logger = BusLogger::new(console.clone(), LogLevel::Debug, source())
            .with_queue_capacity(2);
        logger.attach(publisher.clone());

        // The drain task has not run yet, so only two records fit.
        for i in 0..6 {
            logger.log(LogLevel::Error, &format!("record {i}"));
        }
        assert_eq!(
            console.at(LogLevel::Warning),
            vec!["remote log queue is full, dropping records"]
        );

        gate.send_replace(true);
        eventually(|| publisher.published.lock().len() == 2).await;

        logger.log(LogLevel::Error, "after");
        eventually(|| publisher.published.lock().len() == 3).await;
        assert_eq!(
            console.at(LogLevel::Warning),
            vec![
                "remote log queue is full, dropping records",
                "4 log records were not published: queue was full",
            ]
        );
        let published = publisher.published.lock().clone();
        assert!(published[0].contains("record 0"));
        assert!(published[1].contains("record 1"));
        assert!(published[2].contains("after"));
    }
}
