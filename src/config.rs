//! Configuration loader and validator for the backoffice desk.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub backend: Backend,
    #[serde(default)]
    pub email: Option<Email>,
    pub admin: Admin,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Rest,
    Sqlite,
}

/// Where records live: the hosted REST API or a local SQLite file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backend {
    pub kind: BackendKind,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

/// HTTP email API used for email notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Email {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Admin {
    pub email: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// SQLite URL: `DATABASE_URL`, then `backend.database_url`, then a file in `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.backend.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/ngo-desk.db", self.app.data_dir))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn valid_url(raw: &str) -> bool {
    Url::parse(raw).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.max_attempts == 0 {
        return Err(ConfigError::Invalid("app.max_attempts must be > 0"));
    }

    if cfg.backend.kind == BackendKind::Rest {
        if !valid_url(&cfg.backend.url) {
            return Err(ConfigError::Invalid("backend.url must be an http(s) URL"));
        }
        if cfg.backend.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("backend.api_key must be non-empty"));
        }
    }

    if let Some(email) = &cfg.email {
        if !valid_url(&email.api_url) {
            return Err(ConfigError::Invalid("email.api_url must be an http(s) URL"));
        }
        if email.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("email.api_key must be non-empty"));
        }
        if !email.from.contains('@') {
            return Err(ConfigError::Invalid("email.from must be an email address"));
        }
    }

    if !cfg.admin.email.contains('@') {
        return Err(ConfigError::Invalid("admin.email must be an email address"));
    }

    Ok(())
}

/// Reference configuration file.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 3600
  max_attempts: 5

backend:
  kind: rest
  url: "https://YOUR_PROJECT.supabase.co/"
  api_key: "YOUR_SERVICE_ROLE_KEY"

email:
  api_url: "https://api.resend.com/"
  api_key: "YOUR_EMAIL_API_KEY"
  from: "Blood Desk <desk@example.org>"

admin:
  email: "admin@example.org"
"#
}
