//! Configuration resolution for the adapter and bridge daemons.
//!
//! Everything comes from environment variables, read through a lookup
//! function so tests can supply their own map. Credentials and the topic
//! list live in files whose paths are themselves configurable:
//!
//! 1. Built-in defaults
//! 2. Environment variables
//! 3. Files referenced by environment variables (credentials, subscriptions)

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::level::LogLevel;

pub const DEFAULT_NAMESPACE: &str = "default";
/// Listener namespace that disables prefixing of subscription topics.
pub const NULL_NAMESPACE: &str = "null";
pub const DEFAULT_LISTENER_URL: &str = "tcp://mqtt:1883";
pub const DEFAULT_PUBLISHER_URL: &str = "tcp://mqtt:1883";
pub const DEFAULT_LISTENER_CREDENTIALS: &str = "/run/secrets/mqtt_listener.json";
pub const DEFAULT_PUBLISHER_CREDENTIALS: &str = "/run/secrets/mqtt_publisher.json";
pub const DEFAULT_SERVICE_PROCESSOR: &str = "/srv/processor";
pub const DEFAULT_SUBSCRIPTIONS_FILE: &str = "/srv/subscriptions.txt";
pub const DEFAULT_LOG_LEVEL: &str = "error";

/// Username/password pair handed to the bus transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

/// Fully resolved daemon settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub service_name: String,
    pub service_uuid: String,
    pub service_host: String,
    /// Worker command line; `None` for the bridge.
    pub service_cmd_line: Option<String>,

    pub namespace_listener: String,
    pub namespace_publisher: String,

    pub listener_url: String,
    pub listener_credentials: Credentials,
    pub publisher_url: String,
    pub publisher_credentials: Credentials,

    /// Fully qualified topics, in file order.
    pub subscriptions: Vec<String>,

    pub log_level_console: LogLevel,
    pub log_level_remote: LogLevel,
}

impl Settings {
    /// Settings for the adapter daemon, which also needs a worker command.
    pub fn adapter<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::resolve(&lookup, true)
    }

    /// Settings for the bridge daemon.
    pub fn bridge<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::resolve(&lookup, false)
    }

    /// Whether listener and publisher resolve to the same connection.
    pub fn shares_connection(&self) -> bool {
        self.listener_url == self.publisher_url
            && self.listener_credentials == self.publisher_credentials
    }

    /// MQTT client id for one connection role (`listener` / `publisher`).
    pub fn client_id(&self, role: &str) -> String {
        format!(
            "{}_{}_{}_{role}",
            self.service_name, self.service_host, self.service_uuid
        )
    }

    fn resolve(lookup: &dyn Fn(&str) -> Option<String>, with_processor: bool) -> Result<Self> {
        let service_name = lookup("SERVICE_NAME").unwrap_or_default();
        let service_uuid = uuid::Uuid::new_v4().to_string();
        let service_host = hostname();

        let service_cmd_line = if with_processor {
            Some(service_cmd_line(lookup)?)
        } else {
            None
        };

        let namespace = non_empty(lookup("NAMESPACE")).unwrap_or_else(|| DEFAULT_NAMESPACE.into());
        let namespace_listener =
            non_empty(lookup("NAMESPACE_LISTENER")).unwrap_or_else(|| namespace.clone());
        let namespace_publisher =
            non_empty(lookup("NAMESPACE_PUBLISHER")).unwrap_or_else(|| namespace.clone());

        let listener_url = url_or_default(lookup, "MQTT_LISTENER_URL", DEFAULT_LISTENER_URL);
        let publisher_url = url_or_default(lookup, "MQTT_PUBLISHER_URL", DEFAULT_PUBLISHER_URL);

        let listener_credentials = credentials(
            lookup,
            "Listener",
            "MQTT_LISTENER_CREDENTIALS",
            DEFAULT_LISTENER_CREDENTIALS,
        )?;
        let publisher_credentials = credentials(
            lookup,
            "Publisher",
            "MQTT_PUBLISHER_CREDENTIALS",
            DEFAULT_PUBLISHER_CREDENTIALS,
        )?;

        let subscriptions = subscriptions(lookup, &namespace_listener)?;

        let log_level =
            non_empty(lookup("LOG_LEVEL")).unwrap_or_else(|| DEFAULT_LOG_LEVEL.into());
        let log_level_console =
            non_empty(lookup("LOG_LEVEL_CONSOLE")).unwrap_or_else(|| log_level.clone());
        let log_level_remote = non_empty(lookup("LOG_LEVEL_MQTT")).unwrap_or(log_level);

        Ok(Self {
            service_name,
            service_uuid,
            service_host,
            service_cmd_line,
            namespace_listener,
            namespace_publisher,
            listener_url,
            listener_credentials,
            publisher_url,
            publisher_credentials,
            subscriptions,
            log_level_console: LogLevel::parse_or_debug(&log_level_console),
            log_level_remote: LogLevel::parse_or_debug(&log_level_remote),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn url_or_default(lookup: &dyn Fn(&str) -> Option<String>, var: &str, default: &str) -> String {
    non_empty(lookup(var)).unwrap_or_else(|| {
        info!("{var} not set, trying default url '{default}'");
        default.to_string()
    })
}

fn service_cmd_line(lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let cmd_line = match lookup("SERVICE_PROCESSOR") {
        None => {
            warn!("SERVICE_PROCESSOR not set, trying {DEFAULT_SERVICE_PROCESSOR}");
            DEFAULT_SERVICE_PROCESSOR.to_string()
        }
        Some(value) if value.trim().is_empty() => {
            return Err(Error::Config("SERVICE_PROCESSOR can't be empty".into()));
        }
        Some(value) => value,
    };

    let program = cmd_line
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::Config("SERVICE_PROCESSOR can't be empty".into()))?;
    let metadata = std::fs::metadata(program)?;
    if metadata.is_dir() {
        return Err(Error::Config(
            "SERVICE_PROCESSOR should reference a file".into(),
        ));
    }
    Ok(cmd_line)
}

fn credentials(
    lookup: &dyn Fn(&str) -> Option<String>,
    title: &str,
    var: &str,
    default_path: &str,
) -> Result<Credentials> {
    let path = match lookup(var) {
        None => {
            warn!("{var} not set, trying default location {default_path}");
            PathBuf::from(default_path)
        }
        Some(value) if value.trim().is_empty() => {
            return Err(Error::Config(format!("{var} can't be empty")));
        }
        Some(value) => PathBuf::from(value),
    };
    load_credentials(title, &path)
}

/// Read a `{"username": ..., "password": ...}` file.
///
/// A missing file yields empty credentials; any other failure is an error.
pub fn load_credentials(title: &str, path: &Path) -> Result<Credentials> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "{title} credentials file '{}' doesn't exist - trying to connect with empty credentials",
                path.display()
            );
            return Ok(Credentials::default());
        }
        Err(e) => {
            return Err(Error::Credentials {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };

    info!("{title} credentials found at '{}'", path.display());
    serde_json::from_str(&content).map_err(|e| Error::Credentials {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn subscriptions(lookup: &dyn Fn(&str) -> Option<String>, namespace: &str) -> Result<Vec<String>> {
    let path = match lookup("SUBSCRIPTIONS") {
        None => {
            warn!("SUBSCRIPTIONS not set, trying default location '{DEFAULT_SUBSCRIPTIONS_FILE}'");
            PathBuf::from(DEFAULT_SUBSCRIPTIONS_FILE)
        }
        Some(value) if value.trim().is_empty() => {
            info!("SUBSCRIPTIONS set to nil, starting without subscriptions");
            return Ok(Vec::new());
        }
        Some(value) => PathBuf::from(value),
    };
    load_subscriptions(&path, namespace)
}

/// Read one topic per line, skipping blank lines and prefixing each topic
/// with `namespace/` unless the namespace is [`NULL_NAMESPACE`].
pub fn load_subscriptions(path: &Path, namespace: &str) -> Result<Vec<String>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "Subscriptions file not found at '{}', starting without subscriptions: {e}",
                path.display()
            );
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(Error::Subscriptions {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    info!("Subscriptions file found at '{}'", path.display());
    let topics = parse_subscriptions(&content, namespace);
    if topics.is_empty() {
        warn!("Subscriptions file empty, starting without subscriptions");
    }
    Ok(topics)
}

fn parse_subscriptions(content: &str, namespace: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|topic| {
            if namespace == NULL_NAMESPACE {
                topic.to_string()
            } else {
                format!("{namespace}/{topic}")
            }
        })
        .collect()
}

#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct Env {
        vars: HashMap<String, String>,
        _dir: tempfile::TempDir,
        dir: PathBuf,
    }

    impl Env {
        fn new() -> Self {
            let dir = tempfile::TempDir::new().unwrap();
            let path = dir.path().to_path_buf();
            let mut env = Self {
                vars: HashMap::new(),
                _dir: dir,
                dir: path,
            };
            let processor = env.write("processor", "#!/bin/sh\n");
            env.set("SERVICE_PROCESSOR", &processor);
            env.set("SUBSCRIPTIONS", "");
            let listener = env.path("missing-listener.json");
            let publisher = env.path("missing-publisher.json");
            env.set("MQTT_LISTENER_CREDENTIALS", &listener);
            env.set("MQTT_PUBLISHER_CREDENTIALS", &publisher);
            env
        }

        fn path(&self, name: &str) -> String {
            self.dir.join(name).display().to_string()
        }

        fn write(&self, name: &str, content: &str) -> String {
            let path = self.dir.join(name);
            std::fs::write(&path, content).unwrap();
            path.display().to_string()
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars.insert(key.to_string(), value.to_string());
        }

        fn unset(&mut self, key: &str) {
            self.vars.remove(key);
        }

        fn lookup(&self) -> impl Fn(&str) -> Option<String> + '_ {
            |key| self.vars.get(key).cloned()
        }
    }

    #[test]
    fn defaults_apply_when_unset() {
        let env = Env::new();
        let settings = Settings::adapter(env.lookup()).unwrap();

        assert_eq!(settings.namespace_listener, DEFAULT_NAMESPACE);
        assert_eq!(settings.namespace_publisher, DEFAULT_NAMESPACE);
        assert_eq!(settings.listener_url, DEFAULT_LISTENER_URL);
        assert_eq!(settings.publisher_url, DEFAULT_PUBLISHER_URL);
        assert!(settings.listener_credentials.is_empty());
        assert!(settings.subscriptions.is_empty());
        assert_eq!(settings.log_level_console, LogLevel::Error);
        assert_eq!(settings.log_level_remote, LogLevel::Error);
        assert!(settings.shares_connection());
        assert_eq!(settings.service_uuid.len(), 36);
    }

    #[test]
    fn namespaces_fall_back_to_shared_namespace() {
        let mut env = Env::new();
        env.set("NAMESPACE", "tick");
        env.set("NAMESPACE_PUBLISHER", "tack");
        let settings = Settings::bridge(env.lookup()).unwrap();

        assert_eq!(settings.namespace_listener, "tick");
        assert_eq!(settings.namespace_publisher, "tack");
        assert!(settings.service_cmd_line.is_none());
    }

    #[test]
    fn subscriptions_are_prefixed_with_listener_namespace() {
        let mut env = Env::new();
        let file = env.write("subscriptions.txt", "first\n\n  second  \n");
        env.set("SUBSCRIPTIONS", &file);
        env.set("NAMESPACE_LISTENER", "tick");
        let settings = Settings::adapter(env.lookup()).unwrap();

        assert_eq!(settings.subscriptions, vec!["tick/first", "tick/second"]);
    }

    #[test]
    fn null_namespace_keeps_topics_verbatim() {
        let topics = parse_subscriptions("a/b\nc\n", NULL_NAMESPACE);
        assert_eq!(topics, vec!["a/b", "c"]);
    }

    #[test]
    fn missing_subscriptions_file_means_no_subscriptions() {
        let mut env = Env::new();
        let missing = env.path("nope.txt");
        env.set("SUBSCRIPTIONS", &missing);
        let settings = Settings::adapter(env.lookup()).unwrap();
        assert!(settings.subscriptions.is_empty());
    }

    #[test]
    fn credentials_are_parsed_from_json() {
        let mut env = Env::new();
        let file = env.write(
            "listener.json",
            r#"{"username": "user123", "password": "password123"}"#,
        );
        env.set("MQTT_LISTENER_CREDENTIALS", &file);
        let settings = Settings::adapter(env.lookup()).unwrap();

        assert_eq!(
            settings.listener_credentials,
            Credentials::new("user123", "password123")
        );
        assert!(settings.publisher_credentials.is_empty());
        assert!(!settings.shares_connection());
    }

    #[test]
    fn malformed_credentials_are_an_error() {
        let mut env = Env::new();
        let file = env.write("listener.json", "not json");
        env.set("MQTT_LISTENER_CREDENTIALS", &file);
        let err = Settings::adapter(env.lookup()).unwrap_err();
        assert!(matches!(err, Error::Credentials { .. }));
    }

    #[test]
    fn blank_credentials_variable_is_an_error() {
        let mut env = Env::new();
        env.set("MQTT_PUBLISHER_CREDENTIALS", "  ");
        let err = Settings::adapter(env.lookup()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: MQTT_PUBLISHER_CREDENTIALS can't be empty"
        );
    }

    #[test]
    fn blank_processor_is_an_error() {
        let mut env = Env::new();
        env.set("SERVICE_PROCESSOR", "");
        assert!(Settings::adapter(env.lookup()).is_err());
    }

    #[test]
    fn processor_must_not_be_a_directory() {
        let mut env = Env::new();
        let dir = env.dir.display().to_string();
        env.set("SERVICE_PROCESSOR", &format!("{dir} --flag"));
        let err = Settings::adapter(env.lookup()).unwrap_err();
        assert!(err.to_string().contains("should reference a file"));
    }

    #[test]
    fn bridge_ignores_processor() {
        let mut env = Env::new();
        env.unset("SERVICE_PROCESSOR");
        assert!(Settings::bridge(env.lookup()).is_ok());
    }

    #[test]
    fn log_levels_cascade() {
        let mut env = Env::new();
        env.set("LOG_LEVEL", "warning");
        env.set("LOG_LEVEL_MQTT", "INFO");
        let settings = Settings::adapter(env.lookup()).unwrap();

        assert_eq!(settings.log_level_console, LogLevel::Warning);
        assert_eq!(settings.log_level_remote, LogLevel::Info);
    }

    #[test]
    fn client_ids_carry_role() {
        let env = Env::new();
        let mut settings = Settings::adapter(env.lookup()).unwrap();
        settings.service_name = "svc".into();
        settings.service_host = "host".into();
        settings.service_uuid = "id".into();

        assert_eq!(settings.client_id("listener"), "svc_host_id_listener");
        assert_eq!(settings.client_id("publisher"), "svc_host_id_publisher");
    }
}
