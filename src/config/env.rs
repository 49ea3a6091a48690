//! Environment variable substitution and template file resolution.

use crate::error::ConfigError;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Maximum size for header/footer template files (1MB).
const MAX_TEMPLATE_FILE_SIZE: u64 = 1024 * 1024;

static ENV_VAR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Resolves `${VAR_NAME}` patterns in a string.
///
/// # Errors
/// Returns `ConfigError::ValidationError` listing every undefined variable.
pub fn resolve_env_vars(value: &str) -> Result<String, ConfigError> {
    let mut result = value.to_string();
    let mut errors = Vec::new();

    for cap in ENV_VAR_REGEX.captures_iter(value) {
        let full_match = &cap[0];
        let var_name = &cap[1];

        match std::env::var(var_name) {
            Ok(var_value) => {
                result = result.replace(full_match, &var_value);
            }
            Err(_) => {
                errors.push(var_name.to_string());
            }
        }
    }

    if errors.is_empty() {
        Ok(result)
    } else {
        Err(ConfigError::ValidationError(format!(
            "undefined environment variable{}: {}",
            if errors.len() > 1 { "s" } else { "" },
            errors.join(", ")
        )))
    }
}

/// Resolves a layout fragment that may be given inline or as a file.
///
/// Priority: file > inline > None. Relative paths are resolved against
/// `config_dir`.
///
/// # Errors
/// Returns `ConfigError::ValidationError` if the file is missing,
/// unreadable, larger than 1MB or not UTF-8.
pub fn resolve_template_source(
    field: &str,
    inline: Option<&str>,
    file: Option<&str>,
    config_dir: &Path,
) -> Result<Option<String>, ConfigError> {
    if inline.is_some() && file.is_some() {
        tracing::warn!(
            field = %field,
            "both inline and file template defined, using file"
        );
    }

    let Some(file_path) = file else {
        return Ok(inline.map(str::to_string));
    };

    let path = if Path::new(file_path).is_absolute() {
        PathBuf::from(file_path)
    } else {
        config_dir.join(file_path)
    };

    let metadata = std::fs::metadata(&path).map_err(|e| {
        ConfigError::ValidationError(format!(
            "{}_file '{}' cannot be read: {}",
            field,
            path.display(),
            e
        ))
    })?;

    if metadata.len() > MAX_TEMPLATE_FILE_SIZE {
        return Err(ConfigError::ValidationError(format!(
            "{}_file '{}' exceeds maximum size of 1MB ({} bytes)",
            field,
            path.display(),
            metadata.len()
        )));
    }

    let content = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::InvalidData {
            ConfigError::ValidationError(format!(
                "{}_file '{}' must be valid UTF-8",
                field,
                path.display()
            ))
        } else {
            ConfigError::ValidationError(format!(
                "{}_file '{}' cannot be read: {}",
                field,
                path.display(),
                e
            ))
        }
    })?;

    tracing::debug!(field = %field, path = %path.display(), "template source: file");
    Ok(Some(content))
}
