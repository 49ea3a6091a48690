//! Message composition: buffer snapshot to outbound mail.
//!
//! Composition is pure. It never touches the network and may run on any
//! thread. The dispatcher calls it when a send job starts, with the
//! snapshot taken at that moment.

use crate::config::{DEFAULT_SUBJECT, RuntimeConfig};
use crate::error::{ConfigError, RenderError};
use crate::event::LogEvent;
use crate::layout::{EventContext, HtmlLayout, Layout, TextLayout};
use chrono_tz::Tz;
use lettre::message::Mailbox;
use minijinja::{Environment, UndefinedBehavior};
use std::sync::Arc;

/// Content kind of one body part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Text,
    Html,
}

impl BodyKind {
    /// MIME type of the part.
    pub fn mime_type(&self) -> &'static str {
        match self {
            BodyKind::Text => "text/plain; charset=utf-8",
            BodyKind::Html => "text/html; charset=utf-8",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart {
    pub kind: BodyKind,
    pub content: String,
}

/// A fully rendered mail, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub from: Mailbox,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub bcc: Vec<Mailbox>,
    pub subject: String,
    /// Body parts in order: text before html when both exist.
    pub parts: Vec<BodyPart>,
    /// Number of events rendered in the body.
    pub event_count: usize,
}

impl EmailMessage {
    /// Body part of the given kind, if present.
    pub fn part(&self, kind: BodyKind) -> Option<&str> {
        self.parts
            .iter()
            .find(|p| p.kind == kind)
            .map(|p| p.content.as_str())
    }

    pub fn is_multipart(&self) -> bool {
        self.parts.len() > 1
    }
}

/// Builds [`EmailMessage`]s from buffer snapshots.
pub struct Composer {
    from: Mailbox,
    to: Vec<Mailbox>,
    cc: Vec<Mailbox>,
    bcc: Vec<Mailbox>,
    subject: Option<String>,
    env: Environment<'static>,
    text: Option<Arc<dyn Layout>>,
    html: Option<Arc<dyn Layout>>,
    timezone: Tz,
}

impl Composer {
    /// Create a composer rendering the body with a single layout.
    pub fn new(from: Mailbox, to: Vec<Mailbox>, layout: Arc<dyn Layout>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Lenient);

        Self {
            from,
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: None,
            env,
            text: None,
            html: None,
            timezone: Tz::UTC,
        }
        .with_layout(layout)
    }

    /// Build the composer described by a validated configuration.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if no layout is configured
    /// or the HTML layout cannot be prepared.
    pub fn from_runtime(config: &RuntimeConfig) -> Result<Self, ConfigError> {
        let timezone = config.layout.timezone;
        let text = config
            .layout
            .text
            .as_ref()
            .map(|t| Arc::new(TextLayout::from_compiled(t, timezone)) as Arc<dyn Layout>);
        let html = config
            .layout
            .html
            .as_ref()
            .map(|h| HtmlLayout::from_compiled(h, timezone).map(|l| Arc::new(l) as Arc<dyn Layout>))
            .transpose()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        let first = text.clone().or_else(|| html.clone()).ok_or_else(|| {
            ConfigError::ValidationError("layout needs at least one of 'text' or 'html'".to_string())
        })?;

        let mut composer = Self::new(config.from.clone(), config.to.clone(), first)
            .with_cc(config.cc.clone())
            .with_bcc(config.bcc.clone())
            .with_timezone(timezone);
        if let Some(html) = html {
            composer = composer.with_layout(html);
        }
        if let Some(subject) = &config.subject {
            composer = composer.with_subject(subject.clone());
        }
        Ok(composer)
    }

    /// Add a layout, replacing any previous layout of the same kind.
    pub fn with_layout(mut self, layout: Arc<dyn Layout>) -> Self {
        match layout.kind() {
            BodyKind::Text => self.text = Some(layout),
            BodyKind::Html => self.html = Some(layout),
        }
        self
    }

    pub fn with_cc(mut self, cc: Vec<Mailbox>) -> Self {
        self.cc = cc;
        self
    }

    pub fn with_bcc(mut self, bcc: Vec<Mailbox>) -> Self {
        self.bcc = bcc;
        self
    }

    /// Subject template, rendered against the triggering event.
    pub fn with_subject(mut self, template: impl Into<String>) -> Self {
        self.subject = Some(template.into());
        self
    }

    /// Timezone used by the subject's `time` variable.
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Render a message for `snapshot`.
    ///
    /// The subject is rendered against `trigger`, or against the last
    /// event of the snapshot when no trigger is given. Each configured
    /// layout produces one body part; header and footer are always
    /// emitted.
    ///
    /// # Errors
    /// Returns `RenderError::EmptySnapshot` for an empty snapshot and
    /// `RenderError::RenderFailed` if a template fails to render.
    pub fn compose(
        &self,
        snapshot: &[Arc<LogEvent>],
        trigger: Option<&LogEvent>,
    ) -> Result<EmailMessage, RenderError> {
        let last = snapshot.last().ok_or(RenderError::EmptySnapshot)?;
        let subject_event = trigger.unwrap_or(last.as_ref());

        let mut parts = Vec::with_capacity(2);
        for layout in [&self.text, &self.html].into_iter().flatten() {
            parts.push(BodyPart {
                kind: layout.kind(),
                content: layout.render(snapshot)?,
            });
        }

        Ok(EmailMessage {
            from: self.from.clone(),
            to: self.to.clone(),
            cc: self.cc.clone(),
            bcc: self.bcc.clone(),
            subject: self.render_subject(subject_event)?,
            parts,
            event_count: snapshot.len(),
        })
    }

    fn render_subject(&self, event: &LogEvent) -> Result<String, RenderError> {
        let Some(template) = &self.subject else {
            return Ok(DEFAULT_SUBJECT.to_string());
        };

        let rendered = self
            .env
            .render_str(template, EventContext::new(event, self.timezone))
            .map_err(|e| RenderError::RenderFailed {
                part: "subject".to_string(),
                message: e.to_string(),
            })?;

        // header values cannot span lines
        let subject = rendered
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        if subject.is_empty() {
            Ok(DEFAULT_SUBJECT.to_string())
        } else {
            Ok(subject)
        }
    }
}

impl std::fmt::Debug for Composer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composer")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("subject", &self.subject)
            .field("text", &self.text.is_some())
            .field("html", &self.html.is_some())
            .finish()
    }
}
