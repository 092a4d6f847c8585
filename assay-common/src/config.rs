//! Configuration loading for the assay services
//!
//! Settings resolve in two tiers: an optional TOML file (path taken from
//! `ASSAY_CONFIG`, default `assay.toml` in the working directory), then
//! `ASSAY_*` environment variables which override individual fields.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

/// Service settings with compiled defaults.
///
/// Field names map 1:1 to TOML keys and to `ASSAY_<UPPER_SNAKE>` env vars.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Inference backend base URL
    pub backend_base_url: String,
    /// Inference backend API key (Bearer token)
    pub backend_api_key: String,

    /// Cap on simultaneous in-flight backend operations (uploads, questions)
    pub max_concurrent_requests: usize,
    /// Seconds between document parse-status polls
    pub poll_interval_secs: f64,
    /// Wall-clock timeout for a document parse, in seconds
    pub parse_timeout_secs: f64,

    /// Prefix for auto-generated dataset/chat names
    pub chat_name_prefix: String,
    /// Retrieval similarity threshold passed to the answering session
    pub similarity_threshold: f64,
    /// Number of chunks retrieved per question
    pub top_n: u32,

    /// Fold vendor responses into the question prompt when present
    pub process_vendor_response: bool,
    /// Keep only references actually cited in the answer text
    pub only_cited_references: bool,

    /// SQLite database file path
    pub database_path: String,

    /// Delete tasks older than this many days; 0 disables the sweeper
    pub task_retention_days: i64,
    /// Hours between retention sweep cycles
    pub sweep_interval_hours: f64,

    /// HTTP bind address
    pub host: String,
    /// HTTP bind port
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_base_url: "http://localhost:9380".to_string(),
            backend_api_key: String::new(),
            max_concurrent_requests: 5,
            poll_interval_secs: 3.0,
            parse_timeout_secs: 600.0,
            chat_name_prefix: "assay".to_string(),
            similarity_threshold: 0.1,
            top_n: 8,
            process_vendor_response: false,
            only_cited_references: true,
            database_path: "./assay.db".to_string(),
            task_retention_days: 0,
            sweep_interval_hours: 24.0,
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl Settings {
    /// Load settings: TOML file (if present) overridden by environment.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("ASSAY_CONFIG").unwrap_or_else(|_| "assay.toml".to_string());
        let mut settings = Self::load_toml(Path::new(&config_path))?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Parse the TOML config file, falling back to defaults when absent.
    pub fn load_toml(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        info!("Loaded configuration from {}", path.display());
        Ok(settings)
    }

    /// Apply `ASSAY_*` environment variable overrides in place.
    pub fn apply_env_overrides(&mut self) {
        override_string("ASSAY_BACKEND_BASE_URL", &mut self.backend_base_url);
        override_string("ASSAY_BACKEND_API_KEY", &mut self.backend_api_key);
        override_parsed("ASSAY_MAX_CONCURRENT_REQUESTS", &mut self.max_concurrent_requests);
        override_parsed("ASSAY_POLL_INTERVAL_SECS", &mut self.poll_interval_secs);
        override_parsed("ASSAY_PARSE_TIMEOUT_SECS", &mut self.parse_timeout_secs);
        override_string("ASSAY_CHAT_NAME_PREFIX", &mut self.chat_name_prefix);
        override_parsed("ASSAY_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        override_parsed("ASSAY_TOP_N", &mut self.top_n);
        override_parsed("ASSAY_PROCESS_VENDOR_RESPONSE", &mut self.process_vendor_response);
        override_parsed("ASSAY_ONLY_CITED_REFERENCES", &mut self.only_cited_references);
        override_string("ASSAY_DATABASE_PATH", &mut self.database_path);
        override_parsed("ASSAY_TASK_RETENTION_DAYS", &mut self.task_retention_days);
        override_parsed("ASSAY_SWEEP_INTERVAL_HOURS", &mut self.sweep_interval_hours);
        override_string("ASSAY_HOST", &mut self.host);
        override_parsed("ASSAY_PORT", &mut self.port);
    }

    /// Validate fields that would otherwise fail deep inside the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(Error::Config(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_secs <= 0.0 {
            return Err(Error::Config(
                "poll_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn override_string(var: &str, field: &mut String) {
    if let Ok(value) = std::env::var(var) {
        *field = value;
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, field: &mut T) {
    if let Ok(value) = std::env::var(var) {
        match value.parse::<T>() {
            Ok(parsed) => *field = parsed,
            Err(_) => warn!("Ignoring unparseable {}={}", var, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.max_concurrent_requests, 5);
        assert_eq!(s.task_retention_days, 0);
        assert!(s.only_cited_references);
        assert!(!s.process_vendor_response);
    }

    #[test]
    fn missing_toml_file_yields_defaults() {
        let s = Settings::load_toml(Path::new("/nonexistent/assay.toml")).unwrap();
        assert_eq!(s.port, Settings::default().port);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_absent_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "backend_base_url = \"http://rag:9380\"\ntask_retention_days = 7"
        )
        .unwrap();

        let s = Settings::load_toml(file.path()).unwrap();
        assert_eq!(s.backend_base_url, "http://rag:9380");
        assert_eq!(s.task_retention_days, 7);
        assert_eq!(s.top_n, 8);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a number").unwrap();

        let err = Settings::load_toml(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let s = Settings {
            max_concurrent_requests: 0,
            ..Settings::default()
        };
        assert!(s.validate().is_err());
    }
}
