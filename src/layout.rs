//! Layouts turning log events into mail body text.
//!
//! A layout exposes a fixed header, a per-event rendering and a fixed
//! footer. The composer always frames the rendered events with the
//! header and footer, however many events the buffer kept.
//!
//! Two layouts ship with the crate, both powered by minijinja:
//! - [`TextLayout`]: one line per event from a configurable pattern
//! - [`HtmlLayout`]: an XHTML table, every event field HTML-escaped
//!
//! # Template context
//!
//! Patterns see the following variables: `timestamp` (RFC 3339, UTC),
//! `time` (formatted in the layout timezone), `level`, `logger`,
//! `message`, `thread` and `error`.

use crate::compose::BodyKind;
use crate::config::{CompiledHtmlLayout, CompiledTextLayout};
use crate::error::RenderError;
use crate::event::LogEvent;
use chrono_tz::Tz;
use minijinja::{AutoEscape, Environment, UndefinedBehavior, context};
use serde::Serialize;
use std::sync::Arc;

/// Default per-event pattern of the text layout.
pub const DEFAULT_TEXT_PATTERN: &str =
    "{{ time }} {{ level }} {{ logger }} - {{ message }}{% if error %}\n{{ error }}{% endif %}";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %Z";

const HTML_HEAD: &str = r#"<!DOCTYPE html PUBLIC "-//W3C//DTD XHTML 1.0 Strict//EN" "http://www.w3.org/TR/xhtml1/DTD/xhtml1-strict.dtd">
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
<title>{{ title }}</title>
<style type="text/css">
table { margin-left: 2em; margin-right: 2em; border-left: 2px solid #AAA; }
td { font-family: monospace; padding: 0.2em 0.5em; border-bottom: 1px solid #DDD; }
tr.warn td.level { color: #993300; font-weight: bold; }
tr.error td.level { color: #993300; font-weight: bold; background: #FFCCAA; }
td.exception { background: #A2AEE8; white-space: pre; }
</style>
</head>
<body>
"#;

const HTML_TABLE_OPEN: &str = r#"<table cellspacing="0">
<tr><th>Time</th><th>Thread</th><th>Level</th><th>Logger</th><th>Message</th></tr>
"#;

const HTML_ROW: &str = r#"<tr class="{{ level | lower }}"><td>{{ time }}</td><td>{{ thread }}</td><td class="level">{{ level }}</td><td>{{ logger }}</td><td>{{ message }}</td></tr>
{% if error %}<tr><td class="exception" colspan="5">{{ error }}</td></tr>
{% endif %}"#;

/// Rendering capability for one content kind.
///
/// Implementations must be pure: no I/O, same input gives same output.
pub trait Layout: Send + Sync {
    /// Content kind of the produced body part.
    fn kind(&self) -> BodyKind;

    /// Text emitted before the first event.
    fn header(&self) -> &str;

    /// Render a single event.
    fn format_event(&self, event: &LogEvent) -> Result<String, RenderError>;

    /// Text emitted after the last event.
    fn footer(&self) -> &str;

    /// Render an ordered sequence of events framed by header and footer.
    fn render(&self, events: &[Arc<LogEvent>]) -> Result<String, RenderError> {
        let mut out = String::from(self.header());
        for event in events {
            out.push_str(&self.format_event(event)?);
        }
        out.push_str(self.footer());
        Ok(out)
    }
}

impl std::fmt::Debug for dyn Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layout").field("kind", &self.kind()).finish()
    }
}

/// Template context built from one event.
#[derive(Debug, Serialize)]
pub(crate) struct EventContext<'a> {
    timestamp: String,
    time: String,
    level: &'static str,
    logger: &'a str,
    message: &'a str,
    thread: &'a str,
    error: Option<&'a str>,
}

impl<'a> EventContext<'a> {
    pub(crate) fn new(event: &'a LogEvent, timezone: Tz) -> Self {
        Self {
            timestamp: event.timestamp.to_rfc3339(),
            time: event
                .timestamp
                .with_timezone(&timezone)
                .format(TIME_FORMAT)
                .to_string(),
            level: event.level.as_str(),
            logger: &event.logger,
            message: &event.message,
            thread: event.thread.as_deref().unwrap_or_default(),
            error: event.error.as_deref(),
        }
    }
}

fn lenient_env() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env
}

/// Plain text layout: header, one pattern-rendered line per event, footer.
pub struct TextLayout {
    env: Environment<'static>,
    header: String,
    pattern: String,
    footer: String,
    timezone: Tz,
}

impl TextLayout {
    /// Create a text layout rendering timestamps in UTC.
    pub fn new(header: impl Into<String>, pattern: impl Into<String>, footer: impl Into<String>) -> Self {
        Self {
            env: lenient_env(),
            header: header.into(),
            pattern: pattern.into(),
            footer: footer.into(),
            timezone: Tz::UTC,
        }
    }

    pub fn from_compiled(compiled: &CompiledTextLayout, timezone: Tz) -> Self {
        Self::new(&*compiled.header, &*compiled.pattern, &*compiled.footer).with_timezone(timezone)
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }
}

impl Default for TextLayout {
    fn default() -> Self {
        Self::new("", DEFAULT_TEXT_PATTERN, "")
    }
}

impl Layout for TextLayout {
    fn kind(&self) -> BodyKind {
        BodyKind::Text
    }

    fn header(&self) -> &str {
        &self.header
    }

    fn format_event(&self, event: &LogEvent) -> Result<String, RenderError> {
        let mut line = self
            .env
            .render_str(&self.pattern, EventContext::new(event, self.timezone))
            .map_err(|e| RenderError::RenderFailed {
                part: "text event".to_string(),
                message: e.to_string(),
            })?;
        // minijinja drops the trailing newline of a template source
        if !line.ends_with('\n') {
            line.push('\n');
        }
        Ok(line)
    }

    fn footer(&self) -> &str {
        &self.footer
    }
}

/// XHTML table layout. Every event field is escaped.
pub struct HtmlLayout {
    env: Environment<'static>,
    header: String,
    footer: String,
    timezone: Tz,
}

impl HtmlLayout {
    /// Create an HTML layout.
    ///
    /// `header` and `footer` are trusted fragments placed before and after
    /// the events table; `title` is escaped.
    ///
    /// # Errors
    /// Returns `RenderError::RenderFailed` if the document head cannot be rendered.
    pub fn new(title: &str, header: &str, footer: &str) -> Result<Self, RenderError> {
        let mut env = lenient_env();
        env.set_auto_escape_callback(|_| AutoEscape::Html);

        let head = env
            .render_str(HTML_HEAD, context! { title => title })
            .map_err(|e| RenderError::RenderFailed {
                part: "html head".to_string(),
                message: e.to_string(),
            })?;

        let mut full_header = head;
        full_header.push_str(header);
        if !header.is_empty() && !header.ends_with('\n') {
            full_header.push('\n');
        }
        full_header.push_str(HTML_TABLE_OPEN);

        let mut full_footer = String::from("</table>\n");
        full_footer.push_str(footer);
        if !footer.is_empty() && !footer.ends_with('\n') {
            full_footer.push('\n');
        }
        full_footer.push_str("</body>\n</html>\n");

        Ok(Self {
            env,
            header: full_header,
            footer: full_footer,
            timezone: Tz::UTC,
        })
    }

    /// # Errors
    /// Returns `RenderError::RenderFailed` if the document head cannot be rendered.
    pub fn from_compiled(compiled: &CompiledHtmlLayout, timezone: Tz) -> Result<Self, RenderError> {
        Ok(Self::new(&compiled.title, &compiled.header, &compiled.footer)?.with_timezone(timezone))
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }
}

impl Layout for HtmlLayout {
    fn kind(&self) -> BodyKind {
        BodyKind::Html
    }

    fn header(&self) -> &str {
        &self.header
    }

    fn format_event(&self, event: &LogEvent) -> Result<String, RenderError> {
        self.env
            .render_str(HTML_ROW, EventContext::new(event, self.timezone))
            .map(|mut row| {
                if !row.ends_with('\n') {
                    row.push('\n');
                }
                row
            })
            .map_err(|e| RenderError::RenderFailed {
                part: "html event".to_string(),
                message: e.to_string(),
            })
    }

    fn footer(&self) -> &str {
        &self.footer
    }
}
