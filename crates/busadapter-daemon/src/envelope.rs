//! Inspection and rewriting of JSON bus messages.
//!
//! Only the top-level `topic` field is interpreted. Everything else in a
//! message is carried along untouched.

use busadapter_core::LogLevel;
use serde_json::Value;

/// Why a message cannot be routed. Displays as the log line the routing
/// loops emit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("missing topic: {0}")]
    MissingTopic(String),
}

/// A parsed message with a routable topic.
#[derive(Debug, Clone)]
pub struct Envelope {
    body: Value,
    topic: String,
}

impl Envelope {
    /// Parse `raw` and extract its `topic`. A topic that is absent, empty or
    /// not a string makes the message unroutable.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let body: Value =
            serde_json::from_str(raw).map_err(|_| EnvelopeError::InvalidJson(raw.to_string()))?;
        let topic = match body.get("topic") {
            Some(Value::String(topic)) if !topic.is_empty() => topic.clone(),
            _ => return Err(EnvelopeError::MissingTopic(raw.to_string())),
        };
        Ok(Self { body, topic })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Point the message at `topic`, updating the body to match.
    pub fn set_topic(&mut self, topic: String) {
        if let Value::Object(fields) = &mut self.body {
            fields.insert("topic".to_string(), Value::String(topic.clone()));
        }
        self.topic = topic;
    }

    /// Serialise the body. Field order is kept as parsed.
    pub fn to_json(&self) -> String {
        self.body.to_string()
    }
}

/// Replace the first `"<from>/"` in `topic` with `"<to>/"`.
pub fn rewrite_namespace(topic: &str, from: &str, to: &str) -> String {
    topic.replacen(&format!("{from}/"), &format!("{to}/"), 1)
}

/// Interpret one line of worker diagnostics.
///
/// A JSON object with a non-empty string `log_message` yields that message
/// and its `log_level` (error when absent or unknown). Anything else is
/// reported verbatim at error level.
pub fn parse_log_line(raw: &str) -> (LogLevel, String) {
    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(raw) else {
        return (LogLevel::Error, raw.to_string());
    };
    match fields.get("log_message").and_then(Value::as_str) {
        Some(message) if !message.is_empty() => {
            let level = fields
                .get("log_level")
                .and_then(Value::as_str)
                .and_then(LogLevel::parse)
                .unwrap_or(LogLevel::Error);
            (level, message.to_string())
        }
        _ => (LogLevel::Error, raw.to_string()),
    }
}
