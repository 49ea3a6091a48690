//! Core configuration types and loading.

use super::runtime::RuntimeConfig;
use super::secret::SecretString;
use crate::buffer::DEFAULT_BUFFER_SIZE;
use crate::error::ConfigError;
use crate::event::Level;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/logmailer/config.yaml";

/// Subject used when no subject template is configured.
pub const DEFAULT_SUBJECT: &str = "Log alert";

/// Main configuration structure for the logmailer binary.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Mail appender settings.
    pub appender: AppenderConfig,
    /// How the binary turns input lines into events.
    #[serde(default)]
    pub input: InputConfig,
    /// Metrics exposition configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Settings of one mail appender.
///
/// Immutable once the appender has started: the appender keeps its own
/// compiled copy (`RuntimeConfig`) and exposes no mutation API.
#[derive(Debug, Clone, Deserialize)]
pub struct AppenderConfig {
    pub smtp: SmtpConfig,
    pub from: String,
    /// Recipients. An entry may hold several comma separated addresses.
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Subject template evaluated against the triggering event.
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_true")]
    pub asynchronous: bool,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub overlap: OverlapPolicy,
    /// Pending sends kept distinct under `OverlapPolicy::Queue`.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
    #[serde(default)]
    pub layout: LayoutConfig,
}

/// SMTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Username (supports `${ENV_VAR}` substitution).
    #[serde(default)]
    pub username: Option<String>,
    /// Password (supports `${ENV_VAR}` substitution).
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub tls: TlsMode,
    #[serde(default = "default_true")]
    pub tls_verify: bool,
    /// Name announced in EHLO/HELO. Defaults to the local hostname.
    #[serde(default)]
    pub hello_name: Option<String>,
}

/// TLS mode for SMTP connections.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    None,
    #[default]
    Starttls,
    /// Implicit TLS (SMTPS).
    Tls,
}

/// Which events trigger a send.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Every event at or above `level`.
    Severity {
        #[serde(default = "default_trigger_level")]
        level: Level,
    },
    /// At most `count` triggers per `window`, optionally per logger.
    RateLimited {
        #[serde(default = "default_trigger_level")]
        level: Level,
        count: u32,
        #[serde(with = "humantime_serde")]
        window: Duration,
        #[serde(default)]
        per_logger: bool,
    },
    /// Every `every`-th event at or above `level`.
    Count {
        #[serde(default = "default_trigger_level")]
        level: Level,
        every: u64,
    },
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig::Severity {
            level: default_trigger_level(),
        }
    }
}

/// What happens to triggers arriving while a send is in flight.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Keep a single pending send; later triggers fold into it.
    #[default]
    Coalesce,
    /// Keep one pending send per trigger, up to `max_pending`.
    Queue,
}

/// Layouts used to render the message body.
///
/// With both layouts configured the message is multipart, text first.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LayoutConfig {
    #[serde(default)]
    pub text: Option<TextLayoutConfig>,
    #[serde(default)]
    pub html: Option<HtmlLayoutConfig>,
    /// Timezone for rendered timestamps (e.g., "UTC", "Europe/Paris").
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            text: Some(TextLayoutConfig::default()),
            html: None,
            timezone: default_timezone(),
        }
    }
}

/// Plain text layout settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TextLayoutConfig {
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub header_file: Option<String>,
    /// Per-event template. See `layout::DEFAULT_TEXT_PATTERN`.
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub footer: Option<String>,
    #[serde(default)]
    pub footer_file: Option<String>,
}

/// HTML layout settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct HtmlLayoutConfig {
    #[serde(default)]
    pub title: Option<String>,
    /// Fragment emitted before the events table.
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub header_file: Option<String>,
    /// Fragment emitted after the events table.
    #[serde(default)]
    pub footer: Option<String>,
    #[serde(default)]
    pub footer_file: Option<String>,
}

/// Input parsing for the binary.
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// Regex with named groups `level`, `logger`, `message` and the
    /// optional `timestamp` and `thread`.
    #[serde(default = "default_line_pattern")]
    pub pattern: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            pattern: default_line_pattern(),
        }
    }
}

/// Metrics exposition configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

pub(crate) fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_max_pending() -> usize {
    16
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_trigger_level() -> Level {
    Level::Error
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_line_pattern() -> String {
    crate::parser::DEFAULT_LINE_PATTERN.to_string()
}

impl Config {
    /// Load configuration from a file path.
    ///
    /// # Errors
    /// Returns [`ConfigError::LoadError`] if the file cannot be read.
    /// Returns [`ConfigError::ValidationError`] if the YAML is invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadError(format!("{}: {}", path.display(), e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    ///
    /// # Errors
    /// Returns [`ConfigError::ValidationError`] if the YAML is invalid.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Validate the whole file, collecting every error found.
    ///
    /// Returns the compiled appender settings on success.
    ///
    /// # Errors
    /// Returns all validation errors from the appender and input sections.
    pub fn validate(&self, config_dir: &Path) -> Result<RuntimeConfig, Vec<ConfigError>> {
        let (runtime, mut errors) = match self.appender.compile(config_dir) {
            Ok(runtime) => (Some(runtime), Vec::new()),
            Err(ConfigError::Invalid(errors)) => (None, errors),
            Err(e) => (None, vec![e]),
        };

        if let Err(e) = regex::Regex::new(&self.input.pattern) {
            errors.push(ConfigError::ValidationError(format!(
                "input.pattern: {}",
                e
            )));
        }

        match runtime {
            Some(runtime) if errors.is_empty() => Ok(runtime),
            _ => Err(errors),
        }
    }
}
