//! Process configuration
//!
//! Every setting is a command line flag that can also be provided through a
//! `CERTIFICATOR_` prefixed environment variable.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use certificator_common::telemetry::LogFormat;
use certificator_common::{Error, Result};

use crate::reconciler::ReconcilerSettings;

/// Distributes CA certificate bundles into every namespace of a cluster
#[derive(Parser, Debug, Clone)]
#[command(name = "certificator", version, about, long_about = None)]
pub struct Config {
    /// URLs to download CA certificates from (comma separated)
    #[arg(long, env = "CERTIFICATOR_CA_URLS", value_delimiter = ',')]
    pub ca_urls: Vec<String>,

    /// Directories to read CA certificates from (comma separated)
    #[arg(long, env = "CERTIFICATOR_CA_DIRECTORIES", value_delimiter = ',')]
    pub ca_directories: Vec<PathBuf>,

    /// Time limit for one bundle refresh
    #[arg(long, env = "CERTIFICATOR_DOWNLOAD_TIMEOUT", default_value = "5s", value_parser = parse_duration)]
    pub download_timeout: Duration,

    /// Time between successful bundle refreshes
    #[arg(long, env = "CERTIFICATOR_DOWNLOAD_INTERVAL", default_value = "24h", value_parser = parse_duration)]
    pub download_interval: Duration,

    /// Time before retrying a failed bundle refresh
    #[arg(long, env = "CERTIFICATOR_DOWNLOAD_RETRY_INTERVAL", default_value = "10m", value_parser = parse_duration)]
    pub download_retry_interval: Duration,

    /// Time before retrying namespaces that failed to converge
    #[arg(long, env = "CERTIFICATOR_APPLY_BACKOFF", default_value = "5m", value_parser = parse_duration)]
    pub apply_backoff: Duration,

    /// Time limit for one apply round
    #[arg(long, env = "CERTIFICATOR_APPLY_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub apply_timeout: Duration,

    /// Delay that coalesces bursts of namespace and bundle changes
    #[arg(long, env = "CERTIFICATOR_APPLY_DEBOUNCE", default_value = "1s", value_parser = parse_duration)]
    pub apply_debounce: Duration,

    /// Bound on queued and concurrently running apply operations
    #[arg(long, env = "CERTIFICATOR_APPLY_QUEUE_CAPACITY", default_value_t = 1024)]
    pub apply_queue_capacity: usize,

    /// Password protecting the JKS artifact
    #[arg(long, env = "CERTIFICATOR_JKS_PASSWORD", default_value = "changeme", hide_env_values = true)]
    pub jks_password: String,

    /// Only distribute to namespaces matching this label selector
    #[arg(long, env = "CERTIFICATOR_NAMESPACE_LABEL_SELECTOR")]
    pub namespace_label_selector: Option<String>,

    /// Log output format (text or json)
    #[arg(long, env = "CERTIFICATOR_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "CERTIFICATOR_LOG_LEVEL", default_value = "debug")]
    pub log_level: String,

    /// OTLP collector endpoint; telemetry export is disabled when unset
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Check the configuration and make every directory absolute
    pub fn validate(&mut self) -> Result<()> {
        if self.ca_urls.is_empty() && self.ca_directories.is_empty() {
            return Err(Error::config("no CA certificate sources configured"));
        }
        if self.apply_queue_capacity == 0 {
            return Err(Error::config_for_field(
                "apply_queue_capacity",
                "must be greater than zero",
            ));
        }
        for (field, value) in [
            ("download_timeout", self.download_timeout),
            ("download_interval", self.download_interval),
            ("download_retry_interval", self.download_retry_interval),
            ("apply_backoff", self.apply_backoff),
            ("apply_timeout", self.apply_timeout),
            ("apply_debounce", self.apply_debounce),
        ] {
            if value.is_zero() {
                return Err(Error::config_for_field(field, "must be greater than zero"));
            }
        }

        for directory in &mut self.ca_directories {
            let absolute = std::path::absolute(&*directory).map_err(|e| {
                Error::config_for_field("ca_directories", format!("{}: {e}", directory.display()))
            })?;
            let metadata = std::fs::metadata(&absolute).map_err(|e| {
                Error::config_for_field("ca_directories", format!("{}: {e}", absolute.display()))
            })?;
            if !metadata.is_dir() {
                return Err(Error::config_for_field(
                    "ca_directories",
                    format!("{} is not a directory", absolute.display()),
                ));
            }
            *directory = absolute;
        }

        Ok(())
    }

    /// Settings for the reconciliation loop
    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            download_timeout: self.download_timeout,
            download_interval: self.download_interval,
            download_retry_interval: self.download_retry_interval,
            apply_backoff: self.apply_backoff,
            apply_timeout: self.apply_timeout,
            apply_debounce: self.apply_debounce,
            apply_queue_capacity: self.apply_queue_capacity,
            jks_password: self.jks_password.clone(),
            ..ReconcilerSettings::default()
        }
    }
}

/// Parse a Go style duration such as `500ms`, `10m` or `1h30m`
///
/// A bare `0` is accepted; every other value needs a unit on each number.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut remaining = s;
    while !remaining.is_empty() {
        let num_end = remaining
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(remaining.len());
        if num_end == 0 {
            return Err(format!(
                "expected a number at position {} in '{s}'",
                s.len() - remaining.len()
            ));
        }
        let value: u64 = remaining[..num_end]
            .parse()
            .map_err(|_| format!("invalid number in duration '{s}'"))?;
        remaining = &remaining[num_end..];

        let unit_end = remaining
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(remaining.len());
        let unit = match &remaining[..unit_end] {
            "h" => Duration::from_secs(3600),
            "m" => Duration::from_secs(60),
            "s" => Duration::from_secs(1),
            "ms" => Duration::from_millis(1),
            "" => return Err(format!("missing unit suffix (h/m/s/ms) in duration '{s}'")),
            other => {
                return Err(format!(
                    "invalid duration unit '{other}' in '{s}' (expected h, m, s or ms)"
                ))
            }
        };
        remaining = &remaining[unit_end..];

        let part = u32::try_from(value)
            .ok()
            .and_then(|v| unit.checked_mul(v))
            .ok_or_else(|| format!("duration '{s}' is too large"))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("duration '{s}' is too large"))?;
    }

    Ok(total)
}
