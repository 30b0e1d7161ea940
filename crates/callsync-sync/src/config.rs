//! Sync settings: YAML file, then environment overrides, then validation.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use callsync_adapters::MAX_PAGE_SIZE;
use callsync_core::ExtractionMode;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("reading config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database_url: String,
    pub call_logs_api_base: Option<String>,
    pub call_api_token: Option<String>,
    pub caller_phone: Option<String>,
    pub require_transcript: bool,
    pub extraction_mode: ExtractionMode,
    pub fetch_limit: usize,
    pub page_size: u32,
    pub poll_interval_secs: u64,
    pub force_reprocess: bool,
    pub record_concurrency: usize,
    pub http_timeout_secs: u64,
    pub extraction_timeout_secs: u64,
    pub llm_api_base: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub max_transcript_chars: usize,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://callsync.db".to_string(),
            call_logs_api_base: None,
            call_api_token: None,
            caller_phone: None,
            require_transcript: true,
            extraction_mode: ExtractionMode::Fast,
            fetch_limit: 50,
            page_size: 50,
            poll_interval_secs: 60,
            force_reprocess: false,
            record_concurrency: 1,
            http_timeout_secs: 30,
            extraction_timeout_secs: 60,
            llm_api_base: "https://api.openai.com/v1".to_string(),
            llm_api_key: None,
            llm_model: "gpt-4o-mini".to_string(),
            llm_temperature: 0.3,
            max_transcript_chars: 4000,
            web_port: 8000,
        }
    }
}

impl SyncConfig {
    /// Defaults, then the YAML file named by `CALLSYNC_CONFIG`, then individual env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("CALLSYNC_CONFIG").filter(|p| !p.trim().is_empty()) {
            Some(path) => Self::from_yaml_file(PathBuf::from(path))?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.page_size = config.page_size.clamp(1, MAX_PAGE_SIZE);
        Ok(config)
    }

    pub fn from_yaml_file(path: PathBuf) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = text("CALLSYNC_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = text("CALL_LOGS_API_BASE") {
            self.call_logs_api_base = Some(v);
        }
        if let Some(v) = text("CALL_API_TOKEN") {
            self.call_api_token = Some(v);
        }
        if let Some(v) = text("CALLSYNC_CALLER_PHONE") {
            self.caller_phone = Some(v);
        }
        if let Some(v) = text("LLM_API_BASE") {
            self.llm_api_base = v;
        }
        if let Some(v) = text("LLM_API_KEY") {
            self.llm_api_key = Some(v);
        }
        if let Some(v) = text("LLM_MODEL") {
            self.llm_model = v;
        }

        if let Some(v) = text("CALLSYNC_REQUIRE_TRANSCRIPT") {
            self.require_transcript = parse_bool("CALLSYNC_REQUIRE_TRANSCRIPT", &v)?;
        }
        if let Some(v) = text("CALLSYNC_FORCE_REPROCESS") {
            self.force_reprocess = parse_bool("CALLSYNC_FORCE_REPROCESS", &v)?;
        }
        if let Some(v) = text("CALLSYNC_EXTRACTION_MODE") {
            self.extraction_mode = parse_value("CALLSYNC_EXTRACTION_MODE", &v)?;
        }
        if let Some(v) = text("CALLSYNC_FETCH_LIMIT") {
            self.fetch_limit = parse_value("CALLSYNC_FETCH_LIMIT", &v)?;
        }
        if let Some(v) = text("CALLSYNC_PAGE_SIZE") {
            self.page_size = parse_value("CALLSYNC_PAGE_SIZE", &v)?;
        }
        if let Some(v) = text("CALLSYNC_POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_value("CALLSYNC_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = text("CALLSYNC_RECORD_CONCURRENCY") {
            self.record_concurrency = parse_value("CALLSYNC_RECORD_CONCURRENCY", &v)?;
        }
        if let Some(v) = text("CALLSYNC_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_value("CALLSYNC_HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = text("CALLSYNC_EXTRACTION_TIMEOUT_SECS") {
            self.extraction_timeout_secs = parse_value("CALLSYNC_EXTRACTION_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = text("LLM_TEMPERATURE") {
            self.llm_temperature = parse_value("LLM_TEMPERATURE", &v)?;
        }
        if let Some(v) = text("CALLSYNC_MAX_TRANSCRIPT_CHARS") {
            self.max_transcript_chars = parse_value("CALLSYNC_MAX_TRANSCRIPT_CHARS", &v)?;
        }
        if let Some(v) = text("CALLSYNC_WEB_PORT") {
            self.web_port = parse_value("CALLSYNC_WEB_PORT", &v)?;
        }
        Ok(())
    }

    /// Checks everything a scheduler needs before it starts. Errors here are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call_logs_api_base.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("CALL_LOGS_API_BASE"));
        }
        if self.call_api_token.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("CALL_API_TOKEN"));
        }
        if self.extraction_mode == ExtractionMode::Rich
            && self.llm_api_key.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::Missing("LLM_API_KEY"));
        }
        if self.fetch_limit == 0 {
            return Err(invalid("CALLSYNC_FETCH_LIMIT", self.fetch_limit, "must be at least 1"));
        }
        if self.poll_interval_secs == 0 {
            return Err(invalid(
                "CALLSYNC_POLL_INTERVAL_SECS",
                self.poll_interval_secs,
                "must be at least 1",
            ));
        }
        if self.record_concurrency == 0 {
            return Err(invalid(
                "CALLSYNC_RECORD_CONCURRENCY",
                self.record_concurrency,
                "must be at least 1",
            ));
        }
        if !(0.0..=2.0).contains(&self.llm_temperature) {
            return Err(invalid("LLM_TEMPERATURE", self.llm_temperature, "must be within 0.0..=2.0"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }
}

fn invalid(key: &'static str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

fn parse_value<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| invalid(key, value, &e.to_string()))
}
