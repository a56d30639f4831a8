//! Shared configuration and time helpers used across the gravgate crates.

use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide configuration, resolved once at startup from the
/// environment. Missing required fields are a fatal startup error per the
/// gateway's exit behavior (see `GatewayError::Config`).
#[derive(Debug, Clone)]
pub struct Config {
    pub panel_user: String,
    pub panel_password: String,
    pub api_key: String,
    pub data_dir: String,
    pub host: String,
    pub port: u16,
    pub hourly_limit: u32,
    pub max_log_items: usize,
    pub log_retention_days: i64,
    pub upstream_timeout_secs: u64,
    pub retry_status_codes: Vec<u16>,
    pub retry_max_attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// `PANEL_USER`, `PANEL_PASSWORD`, and `API_KEY` are required; their
    /// absence is fatal (the caller is expected to log and exit 1). There is
    /// intentionally no `'admin'` fallback for `PANEL_USER` since it would be
    /// unreachable alongside the required-at-startup check.
    pub fn from_env() -> Result<Self, ConfigError> {
        let panel_user = require_env("PANEL_USER")?;
        let panel_password = require_env("PANEL_PASSWORD")?;
        let api_key = require_env("API_KEY")?;

        Ok(Self {
            panel_user,
            panel_password,
            api_key,
            data_dir: optional_env("DATA_DIR").unwrap_or_else(|| "./data".to_string()),
            host: optional_env("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_optional("PORT", 8787)?,
            hourly_limit: parse_optional("HOURLY_LIMIT", 100)?,
            max_log_items: parse_optional("MAX_LOG_ITEMS", 2000)?,
            log_retention_days: parse_optional("LOG_RETENTION_DAYS", 14)?,
            upstream_timeout_secs: parse_optional("UPSTREAM_TIMEOUT_SECS", 180)?,
            retry_status_codes: parse_status_code_list(
                optional_env("RETRY_STATUS_CODES").as_deref(),
            )?,
            retry_max_attempts: parse_optional("RETRY_MAX_ATTEMPTS", 2)?,
        })
    }
}

fn parse_status_code_list(raw: Option<&str>) -> Result<Vec<u16>, ConfigError> {
    match raw {
        None => Ok(vec![429, 500]),
        Some(value) => value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "RETRY_STATUS_CODES",
                    value: part.to_string(),
                })
            })
            .collect(),
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingVar(name))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_optional<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional_env(name) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

/// Milliseconds since the Unix epoch, used for `issued_at`/`created_at`
/// timestamps throughout the credential and log data models.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Atomically writes `bytes` to `path`: write to a sibling temp file, then
/// rename into place. Creates the parent directory if needed. Used by both
/// the credential store and the log store so a crash never leaves either
/// file partially written.
pub async fn atomic_write(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn atomic_write_round_trips() {
        let dir = std::env::temp_dir().join(format!("gravgate-test-{}", now_ms()));
        let path = dir.join("sub").join("file.json");
        atomic_write(&path, b"{\"a\":1}").await.unwrap();
        let read = tokio::fs::read(&path).await.unwrap();
        assert_eq!(read, b"{\"a\":1}");
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
