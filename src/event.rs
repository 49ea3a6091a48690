//! Log events as delivered by the external logging pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity of a log event, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    /// Upper-case name used in rendered output ("ERROR", "WARN", ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Level::Trace),
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "ERROR" | "ERR" | "FATAL" => Ok(Level::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// A single log event.
///
/// Immutable once built; the appender shares events as `Arc<LogEvent>`
/// between the buffer, the trigger path and the dispatch worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    /// Source name, usually the logger or module path.
    pub logger: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    /// Associated error or stack trace text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogEvent {
    /// Create an event stamped with the current time.
    pub fn new(level: Level, logger: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            logger: logger.into(),
            message: message.into(),
            thread: None,
            error: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
    }

    #[test]
    fn level_parses_case_insensitively() {
        assert_eq!("error".parse::<Level>().unwrap(), Level::Error);
        assert_eq!("WARNING".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!("Info".parse::<Level>().unwrap(), Level::Info);
        assert!("loud".parse::<Level>().is_err());
    }

    #[test]
    fn level_deserializes_from_lowercase_yaml() {
        let level: Level = serde_yaml::from_str("warn").unwrap();
        assert_eq!(level, Level::Warn);
    }

    #[test]
    fn event_builder_sets_optional_fields() {
        let event = LogEvent::new(Level::Error, "app.db", "query failed")
            .with_thread("worker-1")
            .with_error("timeout after 5s");

        assert_eq!(event.level, Level::Error);
        assert_eq!(event.logger, "app.db");
        assert_eq!(event.thread.as_deref(), Some("worker-1"));
        assert_eq!(event.error.as_deref(), Some("timeout after 5s"));
    }

    #[test]
    fn level_display_is_upper_case() {
        assert_eq!(Level::Warn.to_string(), "WARN");
    }
}
