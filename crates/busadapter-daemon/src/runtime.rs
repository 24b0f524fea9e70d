//! Process bootstrap shared by the `bus-adapter` and `bus-bridge` binaries.

use std::sync::Arc;

use busadapter_core::{ConsoleLogger, LogLevel, Logger, Settings};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bus::{BusClient, BusError, MqttClient};
use crate::remote_log::{BusLogger, LogSource};

/// Flags common to both daemons.
#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// Tracing filter used when `RUST_LOG` is not set. Records are also
    /// subject to `LOG_LEVEL_CONSOLE`.
    #[arg(long, default_value = "info,busadapter_daemon=debug,busadapter_core=debug")]
    pub log_filter: String,
}

/// Console logger at the configured threshold, publishing to the bus once a
/// publisher is attached.
pub fn build_logger(settings: &Settings) -> Arc<BusLogger> {
    Arc::new(BusLogger::new(
        Arc::new(ConsoleLogger::new(settings.log_level_console)),
        settings.log_level_remote,
        LogSource::from_settings(settings),
    ))
}

/// Log `message` as critical and exit with status 1.
pub fn fatal(logger: &dyn Logger, message: &str) -> ! {
    logger.log(LogLevel::Critical, message);
    std::process::exit(1)
}

/// The listener and publisher connections of one daemon. When both resolve
/// to the same broker and credentials a single client serves both roles.
pub struct Connections {
    listener: Arc<MqttClient>,
    publisher: Option<Arc<MqttClient>>,
}

impl Connections {
    pub fn open(settings: &Settings, logger: Arc<dyn Logger>) -> Result<Self, BusError> {
        let listener = Arc::new(MqttClient::new(
            &settings.listener_url,
            &settings.client_id("listener"),
            &settings.listener_credentials,
            Arc::clone(&logger),
        )?);

        let publisher = if settings.shares_connection() {
            None
        } else {
            Some(Arc::new(MqttClient::new(
                &settings.publisher_url,
                &settings.client_id("publisher"),
                &settings.publisher_credentials,
                logger,
            )?))
        };

        Ok(Self {
            listener,
            publisher,
        })
    }

    pub fn listener(&self) -> Arc<dyn BusClient> {
        self.listener.clone()
    }

    /// The publisher role; the listener instance itself when shared.
    pub fn publisher(&self) -> Arc<dyn BusClient> {
        match &self.publisher {
            Some(publisher) => publisher.clone(),
            None => self.listener.clone(),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.publisher.is_none()
    }

    /// Disconnect every client that is still connected.
    pub async fn close(&self) {
        for client in std::iter::once(&self.listener).chain(self.publisher.as_ref()) {
            if let Err(e) = client.disconnect().await {
                debug!(url = client.url(), error = %e, "disconnect skipped");
            }
        }
    }
}

/// Wait for the routing task to finish or for Ctrl+C / SIGTERM.
pub async fn wait_for_shutdown(done: JoinHandle<()>) -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        result = done => {
            result?;
            info!("Message routing finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }
    Ok(())
}
