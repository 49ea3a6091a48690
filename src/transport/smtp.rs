//! SMTP transport built on lettre.

use super::MailTransport;
use crate::compose::{BodyKind, EmailMessage};
use crate::config::{RuntimeSmtp, TlsMode};
use crate::error::{ConfigError, TransportError};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;

/// SMTP reply codes meaning the server refused our credentials.
const AUTH_FAILURE_CODES: [&str; 3] = ["530", "534", "535"];

/// Production transport delivering through an SMTP server.
pub struct SmtpMailTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    port: u16,
    tls: TlsMode,
}

impl SmtpMailTransport {
    /// Build the transport from validated SMTP settings.
    ///
    /// No connection is opened here; the first send connects.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidSmtp` if TLS parameters cannot be built.
    pub fn from_runtime(smtp: &RuntimeSmtp, timeout: Duration) -> Result<Self, ConfigError> {
        let tls_parameters = || {
            TlsParameters::builder(smtp.host.clone())
                .dangerous_accept_invalid_certs(!smtp.tls_verify)
                .build()
                .map_err(|e| ConfigError::InvalidSmtp(format!("TLS configuration error: {}", e)))
        };

        let builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
            .port(smtp.port)
            .timeout(Some(timeout));

        let builder = match smtp.tls {
            TlsMode::None => builder,
            TlsMode::Starttls => builder.tls(Tls::Required(tls_parameters()?)),
            TlsMode::Tls => builder.tls(Tls::Wrapper(tls_parameters()?)),
        };

        let builder = match &smtp.credentials {
            Some(credentials) => builder.credentials(Credentials::new(
                credentials.username.clone(),
                credentials.password.expose().to_string(),
            )),
            None => builder,
        };

        let builder = match &smtp.hello_name {
            Some(name) => builder.hello_name(ClientId::Domain(name.clone())),
            None => builder,
        };

        Ok(Self {
            inner: builder.build(),
            host: smtp.host.clone(),
            port: smtp.port,
            tls: smtp.tls,
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), TransportError> {
        let email = build_message(message)?;
        let recipients = email.envelope().to().len();

        self.inner
            .send(email)
            .await
            .map_err(|e| classify_smtp_error(&e))?;

        tracing::debug!(
            host = %self.host,
            port = self.port,
            recipients = recipients,
            "Message accepted by SMTP server"
        );
        Ok(())
    }
}

impl std::fmt::Debug for SmtpMailTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // credentials stay out of debug output
        f.debug_struct("SmtpMailTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .finish()
    }
}

/// Convert a composed message into a lettre message.
///
/// A single body part becomes a single-part message; text and html
/// become a `multipart/alternative` with the text part first.
///
/// # Errors
/// Returns `TransportError::Message` if lettre rejects the message.
pub fn build_message(message: &EmailMessage) -> Result<Message, TransportError> {
    let mut builder = Message::builder()
        .from(message.from.clone())
        .subject(message.subject.as_str());
    for to in &message.to {
        builder = builder.to(to.clone());
    }
    for cc in &message.cc {
        builder = builder.cc(cc.clone());
    }
    for bcc in &message.bcc {
        builder = builder.bcc(bcc.clone());
    }

    let built = match message.parts.as_slice() {
        [] => {
            return Err(TransportError::Message(
                "message has no body part".to_string(),
            ));
        }
        [single] => builder
            .header(content_type(single.kind))
            .body(single.content.clone()),
        parts => {
            let mut alternative = MultiPart::alternative().build();
            for part in parts {
                alternative = alternative.singlepart(
                    SinglePart::builder()
                        .header(content_type(part.kind))
                        .body(part.content.clone()),
                );
            }
            builder.multipart(alternative)
        }
    };

    built.map_err(|e| TransportError::Message(e.to_string()))
}

fn content_type(kind: BodyKind) -> ContentType {
    match kind {
        BodyKind::Text => ContentType::TEXT_PLAIN,
        BodyKind::Html => ContentType::TEXT_HTML,
    }
}

/// Map a lettre SMTP error onto the transport error kinds.
pub fn classify_smtp_error(error: &lettre::transport::smtp::Error) -> TransportError {
    classify(&SmtpFailure {
        code: error.status().map(|code| code.to_string()),
        message: error.to_string(),
        timeout: error.is_timeout(),
        tls: error.is_tls(),
        permanent: error.is_permanent(),
        transient: error.is_transient(),
    })
}

#[derive(Debug, Default)]
struct SmtpFailure {
    code: Option<String>,
    message: String,
    timeout: bool,
    tls: bool,
    permanent: bool,
    transient: bool,
}

fn classify(failure: &SmtpFailure) -> TransportError {
    let message = failure.message.clone();
    let lower = message.to_lowercase();

    let auth_code = failure
        .code
        .as_deref()
        .is_some_and(|code| AUTH_FAILURE_CODES.contains(&code));

    if failure.timeout {
        TransportError::Timeout(message)
    } else if auth_code || lower.contains("authentication") || lower.contains("invalid credentials")
    {
        TransportError::Authentication(message)
    } else if failure.tls {
        TransportError::Tls(message)
    } else if failure.permanent || failure.transient {
        TransportError::Rejected(message)
    } else {
        TransportError::Connection(message)
    }
}
