//! Configuration loading and validation for logmailer.
//!
//! This module handles loading the YAML configuration file,
//! validation, and resolving environment variables for secrets.

mod env;
mod runtime;
mod secret;
mod types;
mod validation;

// Re-exports publics
pub use env::{resolve_env_vars, resolve_template_source};
pub use runtime::{
    CompiledHtmlLayout, CompiledLayout, CompiledTextLayout, RuntimeConfig, RuntimeSmtp,
    SmtpCredentials,
};
pub use secret::SecretString;
pub use types::{
    AppenderConfig, Config, DEFAULT_CONFIG_PATH, DEFAULT_SUBJECT, HtmlLayoutConfig, InputConfig,
    LayoutConfig, MetricsConfig, OverlapPolicy, SmtpConfig, TextLayoutConfig, TlsMode,
    TriggerConfig,
};
pub use validation::validate_template_render;
