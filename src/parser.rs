//! Log line parsing for the `logmailer` binary.
//!
//! Two line formats are accepted:
//! - NDJSON objects with `level`, `message` and optional `timestamp`,
//!   `logger`, `thread` and `error` fields
//! - plain text lines matched by a regex with named groups `level`,
//!   `logger` and `message`, and optionally `timestamp` and `thread`
//!
//! Multi-line stack traces are supported through [`LineAssembler`]:
//! indented lines and `Caused by:` lines are appended to the error detail
//! of the event before them.
//!
//! # Error Handling
//!
//! Unparseable lines are skipped. Use [`record_parse_error`] to log and
//! count them.

use crate::error::{ConfigError, ParseError};
use crate::event::{Level, LogEvent};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::Deserialize;

/// Default input pattern, matching lines such as
/// `2026-01-15T10:49:35.123Z [main] ERROR app.orders - payment failed`.
/// Timestamp and thread are optional.
pub const DEFAULT_LINE_PATTERN: &str = r"^(?:(?P<timestamp>\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?)\s+)?(?:\[(?P<thread>[^\]]*)\]\s+)?(?P<level>[A-Za-z]+)\s+(?P<logger>\S+)\s+-\s+(?P<message>.*)$";

const DEFAULT_LOGGER: &str = "root";

/// Record a parse error with logging and metrics.
pub fn record_parse_error(error: &ParseError) {
    let error_type = match error {
        ParseError::NoMatch => "no_match",
        ParseError::InvalidLevel(_) => "invalid_level",
        ParseError::InvalidJson(_) => "invalid_json",
    };

    match error {
        ParseError::NoMatch => {
            tracing::debug!("Line did not match input pattern, skipping");
        }
        e => {
            tracing::warn!(error = %e, "Unparseable log line, skipping");
        }
    }

    metrics::counter!("logmailer_parse_errors_total", "error_type" => error_type).increment(1);
}

#[derive(Debug, Deserialize)]
struct JsonLine {
    #[serde(default)]
    timestamp: Option<String>,
    level: String,
    #[serde(default)]
    logger: Option<String>,
    message: String,
    #[serde(default)]
    thread: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Turns single input lines into events.
#[derive(Debug, Clone)]
pub struct LineParser {
    regex: Regex,
}

impl LineParser {
    /// # Errors
    /// Returns `ConfigError::ValidationError` if the pattern is not a valid
    /// regex or lacks one of the required named groups.
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern)
            .map_err(|e| ConfigError::ValidationError(format!("input.pattern: {}", e)))?;

        let names: Vec<&str> = regex.capture_names().flatten().collect();
        let missing: Vec<&str> = ["level", "logger", "message"]
            .into_iter()
            .filter(|group| !names.contains(group))
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "input.pattern: missing named group(s): {}",
                missing.join(", ")
            )));
        }

        Ok(Self { regex })
    }

    /// Parse one line.
    ///
    /// # Errors
    /// - `ParseError::InvalidJson` for a malformed JSON object
    /// - `ParseError::NoMatch` if the pattern does not match
    /// - `ParseError::InvalidLevel` for an unknown level name
    pub fn parse(&self, line: &str) -> Result<LogEvent, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim_start().starts_with('{') {
            return self.parse_json(line);
        }

        let captures = self.regex.captures(line).ok_or(ParseError::NoMatch)?;
        let group = |name: &str| captures.name(name).map(|m| m.as_str());

        let level = parse_level(group("level").unwrap_or_default())?;
        let mut event = LogEvent::new(
            level,
            group("logger").unwrap_or(DEFAULT_LOGGER),
            group("message").unwrap_or_default(),
        );
        if let Some(timestamp) = group("timestamp").and_then(parse_timestamp) {
            event = event.with_timestamp(timestamp);
        }
        if let Some(thread) = group("thread").filter(|t| !t.is_empty()) {
            event = event.with_thread(thread);
        }
        Ok(event)
    }

    fn parse_json(&self, line: &str) -> Result<LogEvent, ParseError> {
        let raw: JsonLine =
            serde_json::from_str(line).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

        let mut event = LogEvent::new(
            parse_level(&raw.level)?,
            raw.logger.unwrap_or_else(|| DEFAULT_LOGGER.to_string()),
            raw.message,
        );
        if let Some(timestamp) = raw.timestamp.as_deref().and_then(parse_timestamp) {
            event = event.with_timestamp(timestamp);
        }
        if let Some(thread) = raw.thread {
            event = event.with_thread(thread);
        }
        if let Some(error) = raw.error {
            event = event.with_error(error);
        }
        Ok(event)
    }
}

fn parse_level(raw: &str) -> Result<Level, ParseError> {
    raw.parse::<Level>()
        .map_err(|_| ParseError::InvalidLevel(raw.to_string()))
}

/// Parse RFC 3339 or naive `YYYY-MM-DD HH:MM:SS[.fff]` (taken as UTC).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let normalized = raw.replacen(' ', "T", 1).replace(',', ".");
    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn is_continuation(line: &str) -> bool {
    line.starts_with([' ', '\t']) || line.starts_with("Caused by:")
}

/// Groups multi-line records into events.
///
/// An event is complete once the next event line arrives, or when
/// [`LineAssembler::flush`] is called.
#[derive(Debug)]
pub struct LineAssembler {
    parser: LineParser,
    pending: Option<LogEvent>,
}

impl LineAssembler {
    pub fn new(parser: LineParser) -> Self {
        Self {
            parser,
            pending: None,
        }
    }

    /// Feed one line; returns the previous event once it is complete.
    ///
    /// # Errors
    /// Returns the parse error of a line that is neither an event nor a
    /// continuation. The pending event is kept.
    pub fn feed(&mut self, line: &str) -> Result<Option<LogEvent>, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(None);
        }

        if is_continuation(line)
            && let Some(pending) = self.pending.as_mut()
        {
            let detail = match pending.error.take() {
                Some(mut detail) => {
                    detail.push('\n');
                    detail.push_str(line);
                    detail
                }
                None => line.to_string(),
            };
            pending.error = Some(detail);
            return Ok(None);
        }

        let event = self.parser.parse(line)?;
        Ok(self.pending.replace(event))
    }

    /// Take the pending event, if any.
    pub fn flush(&mut self) -> Option<LogEvent> {
        self.pending.take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn default_parser() -> LineParser {
        LineParser::new(DEFAULT_LINE_PATTERN).unwrap()
    }

    #[test]
    fn parse_full_line() {
        let event = default_parser()
            .parse("2026-01-15T10:49:35.123Z [worker-1] ERROR app.orders - payment failed")
            .unwrap();

        assert_eq!(event.level, Level::Error);
        assert_eq!(event.logger, "app.orders");
        assert_eq!(event.message, "payment failed");
        assert_eq!(event.thread.as_deref(), Some("worker-1"));
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2026, 1, 15, 10, 49, 35).unwrap()
                + chrono::Duration::milliseconds(123)
        );
    }

    #[test]
    fn parse_minimal_line() {
        let event = default_parser().parse("WARN db.pool - slow query").unwrap();
        assert_eq!(event.level, Level::Warn);
        assert_eq!(event.logger, "db.pool");
        assert_eq!(event.message, "slow query");
        assert!(event.thread.is_none());
    }

    #[test]
    fn parse_naive_timestamp_with_comma_millis() {
        let event = default_parser()
            .parse("2026-01-15 10:49:35,500 INFO app - started")
            .unwrap();
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2026, 1, 15, 10, 49, 35).unwrap()
                + chrono::Duration::milliseconds(500)
        );
    }

    #[test]
    fn parse_level_aliases() {
        let parser = default_parser();
        assert_eq!(parser.parse("warning app - x").unwrap().level, Level::Warn);
        assert_eq!(parser.parse("FATAL app - x").unwrap().level, Level::Error);
    }

    #[test]
    fn parse_unknown_level_fails() {
        let err = default_parser().parse("LOUD app - x").unwrap_err();
        assert_eq!(err, ParseError::InvalidLevel("LOUD".to_string()));
    }

    #[test]
    fn parse_no_match_fails() {
        let err = default_parser().parse("just some text").unwrap_err();
        assert_eq!(err, ParseError::NoMatch);
    }

    #[test]
    fn parse_json_line() {
        let line = r#"{"timestamp":"2026-01-15T10:49:35Z","level":"error","logger":"app","message":"boom","error":"stack"}"#;
        let event = default_parser().parse(line).unwrap();

        assert_eq!(event.level, Level::Error);
        assert_eq!(event.logger, "app");
        assert_eq!(event.error.as_deref(), Some("stack"));
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2026, 1, 15, 10, 49, 35).unwrap()
        );
    }

    #[test]
    fn parse_json_line_defaults_logger() {
        let event = default_parser()
            .parse(r#"{"level":"info","message":"hello"}"#)
            .unwrap();
        assert_eq!(event.logger, "root");
    }

    #[test]
    fn parse_invalid_json_fails() {
        let err = default_parser().parse(r#"{"level": "info""#).unwrap_err();
        assert!(matches!(err, ParseError::InvalidJson(_)));
    }

    #[test]
    fn custom_pattern_requires_named_groups() {
        let err = LineParser::new(r"^(?P<level>\w+) (?P<message>.*)$").unwrap_err();
        assert!(err.to_string().contains("logger"));

        let err = LineParser::new(r"(?P<level>[").unwrap_err();
        assert!(err.to_string().contains("input.pattern"));
    }

    #[test]
    fn custom_pattern_parses() {
        let parser =
            LineParser::new(r"^(?P<level>[A-Z]+)\s+(?P<logger>\S+)\s+(?P<message>.*)$").unwrap();
        let event = parser.parse("ERROR kernel oops").unwrap();
        assert_eq!(event.logger, "kernel");
        assert_eq!(event.message, "oops");
    }

    #[test]
    fn assembler_joins_stack_trace_lines() {
        let mut assembler = LineAssembler::new(default_parser());

        assert!(assembler.feed("ERROR app - failed").unwrap().is_none());
        assert!(assembler.feed("\tat Foo.bar(Foo.java:10)").unwrap().is_none());
        assert!(assembler.feed("Caused by: java.io.IOException").unwrap().is_none());

        let completed = assembler.feed("INFO app - next").unwrap().unwrap();
        assert_eq!(completed.message, "failed");
        assert_eq!(
            completed.error.as_deref(),
            Some("\tat Foo.bar(Foo.java:10)\nCaused by: java.io.IOException")
        );

        let last = assembler.flush().unwrap();
        assert_eq!(last.message, "next");
        assert!(assembler.flush().is_none());
    }

    #[test]
    fn assembler_keeps_pending_on_garbage_line() {
        let mut assembler = LineAssembler::new(default_parser());
        assembler.feed("ERROR app - failed").unwrap();

        assert_eq!(assembler.feed("garbage").unwrap_err(), ParseError::NoMatch);
        assert!(assembler.has_pending());
        assert_eq!(assembler.flush().unwrap().message, "failed");
    }

    #[test]
    fn assembler_ignores_leading_continuation_and_blank_lines() {
        let mut assembler = LineAssembler::new(default_parser());
        assert!(assembler.feed("").unwrap().is_none());
        assert_eq!(
            assembler.feed("    at orphan").unwrap_err(),
            ParseError::NoMatch
        );
        assert!(!assembler.has_pending());
    }
}
