use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_ASPECT_RATIO: &str = "3:4";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0} not found")]
    Missing(PathBuf),
    #[error("provider {0:?} is not configured")]
    UnknownProvider(String),
    #[error("provider {provider:?} has no API key (set it in the config or {env_hint})")]
    MissingApiKey { provider: String, env_hint: String },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    GoogleGenai,
    OpenaiCompatible,
    Dryrun,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::GoogleGenai => "google_genai",
            ProviderKind::OpenaiCompatible => "openai_compatible",
            ProviderKind::Dryrun => "dryrun",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::GoogleGenai => "gemini-3-pro-image-preview",
            ProviderKind::OpenaiCompatible => "gpt-image-1",
            ProviderKind::Dryrun => "dryrun-image-1",
        }
    }

    pub fn default_base_url(self) -> Option<&'static str> {
        match self {
            ProviderKind::GoogleGenai => Some("https://generativelanguage.googleapis.com/v1beta"),
            ProviderKind::OpenaiCompatible => Some("https://api.openai.com/v1"),
            ProviderKind::Dryrun => None,
        }
    }

    fn api_key_env(self) -> &'static [&'static str] {
        match self {
            ProviderKind::GoogleGenai => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
            ProviderKind::OpenaiCompatible => &["OPENAI_API_KEY"],
            ProviderKind::Dryrun => &[],
        }
    }

    pub fn requires_api_key(self) -> bool {
        !self.api_key_env().is_empty()
    }
}

/// One entry under `providers:` in the YAML config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_aspect_ratio")]
    pub default_aspect_ratio: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_temperature() -> f64 {
    1.0
}

fn default_aspect_ratio() -> String {
    DEFAULT_ASPECT_RATIO.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl ProviderSettings {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            api_key: None,
            base_url: None,
            model: None,
            temperature: default_temperature(),
            default_aspect_ratio: default_aspect_ratio(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn dryrun() -> Self {
        Self::new(ProviderKind::Dryrun)
    }

    /// Key from the config, falling back to the provider's environment variables.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| {
                self.kind
                    .api_key_env()
                    .iter()
                    .find_map(|key| non_empty_env(key))
            })
    }

    pub fn resolved_model(&self) -> String {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(self.kind.default_model())
            .to_string()
    }

    pub fn resolved_base_url(&self) -> Option<String> {
        self.base_url
            .as_deref()
            .map(|value| value.trim().trim_end_matches('/'))
            .filter(|value| !value.is_empty())
            .or(self.kind.default_base_url())
            .map(str::to_string)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn require_api_key(&self, provider: &str) -> Result<String, ConfigError> {
        if !self.kind.requires_api_key() {
            return Ok(String::new());
        }
        self.resolved_api_key()
            .ok_or_else(|| ConfigError::MissingApiKey {
                provider: provider.to_string(),
                env_hint: self.kind.api_key_env().join(" or "),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub active_provider: String,
    #[serde(default)]
    pub providers: IndexMap<String, ProviderSettings>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        let mut providers = IndexMap::new();
        providers.insert("dryrun".to_string(), ProviderSettings::dryrun());
        Self {
            active_provider: "dryrun".to_string(),
            providers,
        }
    }
}

/// Startup findings. Warnings never stop the process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigReport {
    pub active_provider: String,
    pub providers: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

impl ProvidersConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::Missing(path.to_path_buf()))
            }
            Err(err) => {
                return Err(ConfigError::Parse {
                    path: path.display().to_string(),
                    message: err.to_string(),
                })
            }
        };
        Self::from_yaml(&raw).map_err(|err| match err {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|err| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: err.to_string(),
        })
    }

    pub fn active(&self) -> Result<(&str, &ProviderSettings), ConfigError> {
        self.providers
            .get_key_value(self.active_provider.as_str())
            .map(|(name, settings)| (name.as_str(), settings))
            .ok_or_else(|| ConfigError::UnknownProvider(self.active_provider.clone()))
    }

    pub fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport {
            active_provider: self.active_provider.clone(),
            providers: self.providers.keys().cloned().collect(),
            warnings: Vec::new(),
        };
        if self.providers.is_empty() {
            report.warnings.push("no image providers configured".to_string());
        }
        match self.active() {
            Ok((name, settings)) => {
                if let Err(err) = settings.require_api_key(name) {
                    report.warnings.push(err.to_string());
                }
            }
            Err(err) => report.warnings.push(err.to_string()),
        }
        for (name, settings) in &self.providers {
            if name != &self.active_provider && settings.require_api_key(name).is_err() {
                report
                    .warnings
                    .push(format!("inactive provider {name:?} has no API key"));
            }
        }
        report
    }
}

/// Engine knobs that are not provider specific.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub history_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub thumbnail_width: u32,
    pub retry_concurrency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            history_dir: PathBuf::from("history"),
            heartbeat_interval: Duration::from_secs(30),
            thumbnail_width: 400,
            retry_concurrency: 3,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            history_dir: non_empty_env("REDINK_HISTORY_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.history_dir),
            heartbeat_interval: parse_env::<u64>("REDINK_HEARTBEAT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            thumbnail_width: parse_env::<u32>("REDINK_THUMBNAIL_WIDTH")
                .filter(|width| *width > 0)
                .unwrap_or(defaults.thumbnail_width),
            retry_concurrency: parse_env::<usize>("REDINK_RETRY_CONCURRENCY")
                .filter(|count| *count > 0)
                .unwrap_or(defaults.retry_concurrency),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = non_empty_env(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
