//! Template, address and port validation utilities.

use super::types::TlsMode;
use lettre::message::Mailbox;
use minijinja::{Environment, UndefinedBehavior};

/// Validates Jinja template syntax.
pub(crate) fn validate_jinja_template(source: &str) -> Result<(), String> {
    let mut env = Environment::new();
    env.add_template("_validate", source)
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Validates a Jinja template by performing a test render with empty data.
/// Detects runtime errors like unknown filters.
///
/// # Errors
/// Returns an error string if the template syntax is invalid or uses unknown filters.
pub fn validate_template_render(source: &str) -> Result<(), String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.add_template("_render_test", source)
        .map_err(|e| e.to_string())?;

    let tmpl = env
        .get_template("_render_test")
        .map_err(|e| e.to_string())?;
    tmpl.render(serde_json::json!({}))
        .map_err(|e| e.to_string())?;

    Ok(())
}

/// Splits configured address entries on commas and parses each address.
///
/// An entry like `"Ops <ops@example.com>, dev@example.com"` yields two
/// mailboxes. Order is preserved.
pub(crate) fn parse_mailboxes(entries: &[String]) -> Result<Vec<Mailbox>, String> {
    entries
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(|addr| {
            addr.parse::<Mailbox>()
                .map_err(|e| format!("'{}': {}", addr, e))
        })
        .collect()
}

/// Returns a warning when the TLS mode does not match the usual port.
///
/// Informational only: non-standard ports are legitimate.
pub(crate) fn tls_port_mismatch(tls: TlsMode, port: u16) -> Option<String> {
    match (tls, port) {
        (TlsMode::Tls, p) if p != 465 => Some(format!(
            "implicit TLS is usually served on port 465, configured port is {}",
            p
        )),
        (TlsMode::Starttls, 465) => {
            Some("port 465 usually expects implicit TLS, not STARTTLS".to_string())
        }
        (TlsMode::Starttls, p) if p != 587 && p != 25 => Some(format!(
            "STARTTLS is usually offered on port 587 or 25, configured port is {}",
            p
        )),
        (TlsMode::None, 465) => {
            Some("port 465 usually expects implicit TLS, TLS is disabled".to_string())
        }
        _ => None,
    }
}
