//! Runtime configuration: the validated, immutable form of `AppenderConfig`.

use super::env::{resolve_env_vars, resolve_template_source};
use super::secret::SecretString;
use super::types::{AppenderConfig, OverlapPolicy, TlsMode, TriggerConfig};
use super::validation::{
    parse_mailboxes, tls_port_mismatch, validate_jinja_template, validate_template_render,
};
use crate::error::ConfigError;
use crate::layout::DEFAULT_TEXT_PATTERN;
use chrono_tz::Tz;
use lettre::message::Mailbox;
use std::path::Path;
use std::time::Duration;

/// Validated appender configuration, shared read-only after start.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub smtp: RuntimeSmtp,
    pub from: Mailbox,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub bcc: Vec<Mailbox>,
    pub subject: Option<String>,
    pub buffer_size: usize,
    pub asynchronous: bool,
    pub trigger: TriggerConfig,
    pub overlap: OverlapPolicy,
    pub max_pending: usize,
    pub send_timeout: Duration,
    pub shutdown_grace: Duration,
    pub layout: CompiledLayout,
}

/// SMTP settings with environment variables resolved.
#[derive(Debug, Clone)]
pub struct RuntimeSmtp {
    pub host: String,
    pub port: u16,
    pub tls: TlsMode,
    pub tls_verify: bool,
    pub credentials: Option<SmtpCredentials>,
    pub hello_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SmtpCredentials {
    pub username: String,
    pub password: SecretString,
}

/// Layout templates with file sources resolved.
#[derive(Debug, Clone)]
pub struct CompiledLayout {
    pub text: Option<CompiledTextLayout>,
    pub html: Option<CompiledHtmlLayout>,
    pub timezone: Tz,
}

#[derive(Debug, Clone, Default)]
pub struct CompiledTextLayout {
    pub header: String,
    pub pattern: String,
    pub footer: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompiledHtmlLayout {
    pub title: String,
    pub header: String,
    pub footer: String,
}

impl AppenderConfig {
    /// Validate every field and produce the runtime form.
    ///
    /// All problems are collected; the appender never starts on error.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` holding every validation error found.
    pub fn compile(&self, config_dir: &Path) -> Result<RuntimeConfig, ConfigError> {
        let mut errors = Vec::new();

        let smtp = self.compile_smtp(&mut errors);

        let from = match parse_mailboxes(std::slice::from_ref(&self.from)) {
            Ok(mut boxes) if boxes.len() == 1 => boxes.pop(),
            Ok(_) => {
                errors.push(ConfigError::InvalidAddress {
                    field: "from".to_string(),
                    message: "exactly one sender address is required".to_string(),
                });
                None
            }
            Err(message) => {
                errors.push(ConfigError::InvalidAddress {
                    field: "from".to_string(),
                    message,
                });
                None
            }
        };

        let to = collect_addresses("to", &self.to, &mut errors);
        if to.is_empty() && !errors.iter().any(|e| is_address_error(e, "to")) {
            errors.push(ConfigError::ValidationError(
                "'to' must contain at least one email address".to_string(),
            ));
        }
        let cc = collect_addresses("cc", &self.cc, &mut errors);
        let bcc = collect_addresses("bcc", &self.bcc, &mut errors);

        if let Some(subject) = &self.subject
            && let Err(message) =
                validate_jinja_template(subject).and_then(|_| validate_template_render(subject))
        {
            errors.push(ConfigError::InvalidTemplate {
                field: "subject".to_string(),
                message,
            });
        }

        if self.buffer_size == 0 {
            errors.push(ConfigError::ValidationError(
                "buffer_size must be at least 1".to_string(),
            ));
        }
        if self.send_timeout.is_zero() {
            errors.push(ConfigError::ValidationError(
                "send_timeout must be greater than zero".to_string(),
            ));
        }
        if self.overlap == OverlapPolicy::Queue && self.max_pending == 0 {
            errors.push(ConfigError::ValidationError(
                "max_pending must be at least 1 with overlap: queue".to_string(),
            ));
        }

        validate_trigger(&self.trigger, &mut errors);

        let layout = self.compile_layout(config_dir, &mut errors);

        match (smtp, from, layout) {
            (Some(smtp), Some(from), Some(layout)) if errors.is_empty() => Ok(RuntimeConfig {
                smtp,
                from,
                to,
                cc,
                bcc,
                subject: self.subject.clone(),
                buffer_size: self.buffer_size,
                asynchronous: self.asynchronous,
                trigger: self.trigger.clone(),
                overlap: self.overlap,
                max_pending: self.max_pending,
                send_timeout: self.send_timeout,
                shutdown_grace: self.shutdown_grace,
                layout,
            }),
            _ => Err(ConfigError::Invalid(errors)),
        }
    }

    fn compile_smtp(&self, errors: &mut Vec<ConfigError>) -> Option<RuntimeSmtp> {
        let before = errors.len();
        let smtp = &self.smtp;

        if smtp.host.trim().is_empty() {
            errors.push(ConfigError::InvalidSmtp(
                "smtp.host must not be empty".to_string(),
            ));
        }
        if smtp.port == 0 {
            errors.push(ConfigError::InvalidSmtp(
                "smtp.port must be between 1 and 65535".to_string(),
            ));
        }

        let username = match smtp.username.as_deref().map(resolve_env_vars).transpose() {
            Ok(username) => username,
            Err(e) => {
                errors.push(ConfigError::InvalidSmtp(format!("smtp.username: {}", e)));
                None
            }
        };

        let password = match smtp
            .password
            .as_ref()
            .map(|p| resolve_env_vars(p.expose()).map(SecretString::new))
            .transpose()
        {
            Ok(password) => password,
            Err(e) => {
                errors.push(ConfigError::InvalidSmtp(format!("smtp.password: {}", e)));
                None
            }
        };

        let credentials = match (smtp.username.is_some(), smtp.password.is_some()) {
            (true, false) => {
                errors.push(ConfigError::InvalidSmtp(
                    "smtp.password required when smtp.username is set".to_string(),
                ));
                None
            }
            (false, true) => {
                errors.push(ConfigError::InvalidSmtp(
                    "smtp.username required when smtp.password is set".to_string(),
                ));
                None
            }
            _ => username
                .zip(password)
                .map(|(username, password)| SmtpCredentials { username, password }),
        };

        if let Some(warning) = tls_port_mismatch(smtp.tls, smtp.port) {
            tracing::warn!(host = %smtp.host, port = smtp.port, "{}", warning);
        }

        (errors.len() == before).then(|| RuntimeSmtp {
            host: smtp.host.trim().to_string(),
            port: smtp.port,
            tls: smtp.tls,
            tls_verify: smtp.tls_verify,
            credentials,
            hello_name: smtp.hello_name.clone(),
        })
    }

    fn compile_layout(
        &self,
        config_dir: &Path,
        errors: &mut Vec<ConfigError>,
    ) -> Option<CompiledLayout> {
        let before = errors.len();
        let layout = &self.layout;

        if layout.text.is_none() && layout.html.is_none() {
            errors.push(ConfigError::ValidationError(
                "layout needs at least one of 'text' or 'html'".to_string(),
            ));
        }

        let mut resolve = |field: &str, inline: Option<&String>, file: Option<&String>| {
            match resolve_template_source(
                field,
                inline.map(String::as_str),
                file.map(String::as_str),
                config_dir,
            ) {
                Ok(source) => source.unwrap_or_default(),
                Err(e) => {
                    errors.push(e);
                    String::new()
                }
            }
        };

        let text = layout.text.as_ref().map(|text| CompiledTextLayout {
            header: resolve(
                "layout.text.header",
                text.header.as_ref(),
                text.header_file.as_ref(),
            ),
            pattern: text
                .pattern
                .clone()
                .unwrap_or_else(|| DEFAULT_TEXT_PATTERN.to_string()),
            footer: resolve(
                "layout.text.footer",
                text.footer.as_ref(),
                text.footer_file.as_ref(),
            ),
        });

        let html = layout.html.as_ref().map(|html| CompiledHtmlLayout {
            title: html.title.clone().unwrap_or_else(|| "Log events".to_string()),
            header: resolve(
                "layout.html.header",
                html.header.as_ref(),
                html.header_file.as_ref(),
            ),
            footer: resolve(
                "layout.html.footer",
                html.footer.as_ref(),
                html.footer_file.as_ref(),
            ),
        });

        if let Some(text) = &text
            && let Err(message) = validate_jinja_template(&text.pattern)
                .and_then(|_| validate_template_render(&text.pattern))
        {
            errors.push(ConfigError::InvalidTemplate {
                field: "layout.text.pattern".to_string(),
                message,
            });
        }

        let timezone = match layout.timezone.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                errors.push(ConfigError::ValidationError(format!(
                    "layout.timezone '{}' is not a valid timezone",
                    layout.timezone
                )));
                None
            }
        };

        match timezone {
            Some(timezone) if errors.len() == before => Some(CompiledLayout {
                text,
                html,
                timezone,
            }),
            _ => None,
        }
    }
}

fn collect_addresses(field: &str, entries: &[String], errors: &mut Vec<ConfigError>) -> Vec<Mailbox> {
    match parse_mailboxes(entries) {
        Ok(boxes) => boxes,
        Err(message) => {
            errors.push(ConfigError::InvalidAddress {
                field: field.to_string(),
                message,
            });
            Vec::new()
        }
    }
}

fn is_address_error(error: &ConfigError, field_name: &str) -> bool {
    matches!(error, ConfigError::InvalidAddress { field, .. } if field == field_name)
}

fn validate_trigger(trigger: &TriggerConfig, errors: &mut Vec<ConfigError>) {
    match trigger {
        TriggerConfig::Severity { .. } => {}
        TriggerConfig::RateLimited { count, window, .. } => {
            if *count == 0 {
                errors.push(ConfigError::ValidationError(
                    "trigger.count must be at least 1".to_string(),
                ));
            }
            if window.is_zero() {
                errors.push(ConfigError::ValidationError(
                    "trigger.window must be greater than zero".to_string(),
                ));
            }
        }
        TriggerConfig::Count { every, .. } => {
            if *every == 0 {
                errors.push(ConfigError::ValidationError(
                    "trigger.every must be at least 1".to_string(),
                ));
            }
        }
    }
}
