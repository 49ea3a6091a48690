//! Centralized error types for logmailer using thiserror.
//!
//! Library code returns these typed errors; only the binary converts
//! them into `anyhow` errors.

use std::time::Duration;
use thiserror::Error;

/// Errors related to configuration loading and validation.
///
/// Any of these is fatal to starting the appender.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to load config file: {0}")]
    LoadError(String),
    #[error("invalid configuration: {0}")]
    ValidationError(String),
    #[error("invalid template in '{field}': {message}")]
    InvalidTemplate { field: String, message: String },
    #[error("invalid address in '{field}': {message}")]
    InvalidAddress { field: String, message: String },
    #[error("invalid smtp settings: {0}")]
    InvalidSmtp(String),
    #[error("{}", join_errors(.0))]
    Invalid(Vec<ConfigError>),
    #[error("failed to start appender: {0}")]
    Startup(String),
}

fn join_errors(errors: &[ConfigError]) -> String {
    let joined = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "{} configuration error{}: {}",
        errors.len(),
        if errors.len() > 1 { "s" } else { "" },
        joined
    )
}

/// Errors related to parsing input log lines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line did not match input pattern")]
    NoMatch,
    #[error("invalid level: {0}")]
    InvalidLevel(String),
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
}

/// Errors raised by the mail transport capability.
///
/// Never retried: the failure is recorded on the send outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error("TLS negotiation failed: {0}")]
    Tls(String),
    #[error("message rejected by server: {0}")]
    Rejected(String),
    #[error("transport timed out: {0}")]
    Timeout(String),
    #[error("failed to build message: {0}")]
    Message(String),
}

/// Errors related to rendering events or the subject line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("template render failed in {part}: {message}")]
    RenderFailed { part: String, message: String },
    #[error("nothing to render: snapshot is empty")]
    EmptySnapshot,
}

/// Why a send attempt did not succeed. Carried by `SendOutcome`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("rendering error: {0}")]
    Render(#[from] RenderError),
    #[error("send exceeded timeout of {0:?}")]
    Timeout(Duration),
    #[error("send cancelled before completion")]
    Cancelled,
    #[error("send aborted after shutdown grace period of {0:?}")]
    ShutdownTimeout(Duration),
}

/// Errors returned while waiting on a `SendHandle`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("send did not complete within {0:?}")]
    Timeout(Duration),
}

/// Errors returned to the thread pushing an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppendError {
    #[error("appender is stopped")]
    Stopped,
    #[error("synchronous send failed: {0}")]
    Send(#[from] SendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::LoadError("file not found".to_string());
        assert_eq!(
            err.to_string(),
            "failed to load config file: file not found"
        );

        let err = ConfigError::ValidationError("to must not be empty".to_string());
        assert_eq!(
            err.to_string(),
            "invalid configuration: to must not be empty"
        );
    }

    #[test]
    fn config_error_invalid_template_display() {
        let err = ConfigError::InvalidTemplate {
            field: "subject".to_string(),
            message: "unexpected end of input".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid template in 'subject': unexpected end of input"
        );
    }

    #[test]
    fn config_error_invalid_joins_all_errors() {
        let err = ConfigError::Invalid(vec![
            ConfigError::ValidationError("to must not be empty".to_string()),
            ConfigError::InvalidSmtp("host must not be empty".to_string()),
        ]);
        assert_eq!(
            err.to_string(),
            "2 configuration errors: invalid configuration: to must not be empty; \
             invalid smtp settings: host must not be empty"
        );
    }

    #[test]
    fn parse_error_display() {
        assert_eq!(
            ParseError::NoMatch.to_string(),
            "line did not match input pattern"
        );
        assert_eq!(
            ParseError::InvalidLevel("LOUD".to_string()).to_string(),
            "invalid level: LOUD"
        );
    }

    #[test]
    fn transport_error_display() {
        let err = TransportError::Authentication("535 5.7.8 bad credentials".to_string());
        assert_eq!(
            err.to_string(),
            "authentication rejected: 535 5.7.8 bad credentials"
        );

        let err = TransportError::Connection("connection refused".to_string());
        assert_eq!(err.to_string(), "connection failed: connection refused");
    }

    #[test]
    fn send_error_wraps_transport_and_render() {
        let err: SendError = TransportError::Tls("handshake".to_string()).into();
        assert_eq!(
            err.to_string(),
            "transport error: TLS negotiation failed: handshake"
        );

        let err: SendError = RenderError::EmptySnapshot.into();
        assert_eq!(
            err.to_string(),
            "rendering error: nothing to render: snapshot is empty"
        );
    }

    #[test]
    fn send_error_timeout_display() {
        let err = SendError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "send exceeded timeout of 30s");

        let err = SendError::ShutdownTimeout(Duration::from_millis(500));
        assert_eq!(
            err.to_string(),
            "send aborted after shutdown grace period of 500ms"
        );
    }

    #[test]
    fn append_error_display() {
        assert_eq!(AppendError::Stopped.to_string(), "appender is stopped");

        let err = AppendError::Send(SendError::Cancelled);
        assert_eq!(
            err.to_string(),
            "synchronous send failed: send cancelled before completion"
        );
    }

    #[test]
    fn wait_error_display() {
        let err = WaitError::Timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "send did not complete within 5s");
    }
}
