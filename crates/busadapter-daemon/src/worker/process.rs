//! Subprocess worker.
//!
//! Spawns the configured command with piped standard streams. Input lines go
//! to stdin, stdout lines become output messages and stderr lines become
//! diagnostics.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use busadapter_core::{Logger, Settings};
use tokio::process::Command;
use tracing::{info, warn};

use super::lines::{spawn_line_reader, spawn_line_writer};
use super::{Service, ServiceError, ServiceStreams};
use crate::bus::MessageStream;

/// Identity handed to the worker through its environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerEnv {
    pub service_name: String,
    pub service_uuid: String,
    pub service_host: String,
    pub namespace_listener: String,
    pub namespace_publisher: String,
}

impl WorkerEnv {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            service_name: settings.service_name.clone(),
            service_uuid: settings.service_uuid.clone(),
            service_host: settings.service_host.clone(),
            namespace_listener: settings.namespace_listener.clone(),
            namespace_publisher: settings.namespace_publisher.clone(),
        }
    }

    fn vars(&self) -> [(&'static str, &str); 5] {
        [
            ("SERVICE_NAME", self.service_name.as_str()),
            ("SERVICE_UUID", self.service_uuid.as_str()),
            ("SERVICE_HOST", self.service_host.as_str()),
            ("NAMESPACE_LISTENER", self.namespace_listener.as_str()),
            ("NAMESPACE_PUBLISHER", self.namespace_publisher.as_str()),
        ]
    }
}

/// Runs an external command as the worker.
pub struct ProcessService {
    cmd_line: String,
    env: WorkerEnv,
    logger: Arc<dyn Logger>,
}

impl ProcessService {
    /// `cmd_line` is split on whitespace: the first word is the program,
    /// the rest its arguments.
    pub fn new(cmd_line: impl Into<String>, env: WorkerEnv, logger: Arc<dyn Logger>) -> Self {
        Self {
            cmd_line: cmd_line.into(),
            env,
            logger,
        }
    }

    pub fn cmd_line(&self) -> &str {
        &self.cmd_line
    }
}

#[async_trait]
impl Service for ProcessService {
    async fn start(&self, input: Option<MessageStream>) -> Result<ServiceStreams, ServiceError> {
        let mut words = self.cmd_line.split_whitespace();
        let program = words.next().ok_or(ServiceError::InvalidCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(words)
            .envs(self.env.vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(command = %self.cmd_line, "Spawning worker");
        let mut child = cmd.spawn().map_err(|source| ServiceError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(ServiceError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ServiceError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ServiceError::MissingPipe("stderr"))?;

        // Without input nobody writes to stdin, but closing it would hand the
        // worker an EOF it never asked for. Keep it open until the worker exits.
        let idle_stdin = match input {
            Some(input) => {
                spawn_line_writer(stdin, input, Arc::clone(&self.logger));
                None
            }
            None => Some(stdin),
        };

        let output = spawn_line_reader(stdout, "stdout", Arc::clone(&self.logger));
        let errors = spawn_line_reader(stderr, "stderr", Arc::clone(&self.logger));

        let pid = child.id();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => info!(?pid, %status, "Worker exited"),
                Ok(status) => warn!(?pid, %status, "Worker exited"),
                Err(e) => warn!(?pid, error = %e, "Error waiting for worker"),
            }
            drop(idle_stdin);
        });

        Ok(ServiceStreams { output, errors })
    }
}
