//! Configuration loading from disk.
//!
//! Config files carry upstream credentials, so raw secrets do not have to
//! live in the file: any `${VAR}` occurrence is replaced with the value of
//! that environment variable before parsing. A reference to an undefined
//! variable fails the whole load, which on hot reload means the previous
//! snapshot stays authoritative instead of half-expanded credentials going
//! live.

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config references undefined environment variable '{name}'")]
    UndefinedVar { name: String },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load, expand, parse and validate the configuration file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let expanded = expand_env_vars(&raw)?;
    let config: ProxyConfig = toml::from_str(&expanded)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Substitute `${VAR}` references with environment values. Anything that is
/// not a well-formed `${...}` reference passes through untouched, so plain
/// `$` signs in keys or URLs are safe.
fn expand_env_vars(raw: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if is_var_name(&after[..end]) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        return Err(ConfigError::UndefinedVar {
                            name: name.to_string(),
                        })
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                // not a reference, keep the literal "${"
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn is_var_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
