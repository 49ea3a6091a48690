//! Logmailer - buffer log events and mail the recent history when a
//! severe event is logged.
//!
//! Pipeline: [`MailAppender::on_event`] pushes into a [`CyclicBuffer`],
//! a [`TriggerPolicy`] decides whether to send, the [`Dispatcher`] runs
//! one send at a time, the [`Composer`] renders the buffer snapshot and
//! a [`MailTransport`] delivers it.

pub mod appender;
pub mod buffer;
pub mod cli;
pub mod compose;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod layout;
pub mod metrics;
pub mod parser;
pub mod transport;
pub mod trigger;

// Re-export commonly used types
pub use appender::MailAppender;
pub use buffer::CyclicBuffer;
pub use cli::LogFormat;
pub use compose::{BodyKind, BodyPart, Composer, EmailMessage};
pub use config::{AppenderConfig, Config, RuntimeConfig};
pub use dispatch::{
    DispatchSettings, DispatchState, Dispatcher, SendHandle, SendOutcome, SendStatus, StatusEvent,
};
pub use error::{AppendError, ConfigError, RenderError, SendError, TransportError, WaitError};
pub use event::{Level, LogEvent};
pub use layout::{HtmlLayout, Layout, TextLayout};
pub use metrics::{MetricsServer, register_metric_descriptions};
pub use parser::{LineAssembler, LineParser, record_parse_error};
pub use transport::{MailTransport, SmtpMailTransport};
pub use trigger::{EveryNth, RateLimited, SeverityThreshold, TriggerPolicy};
