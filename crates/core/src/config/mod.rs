use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::prompts::{
    PromptMode, TemplateLibrary, TemplateSource, TemplateStore, TemplateStoreError,
};

pub const DEFAULT_PROVIDER: &str = "siliconflow";
pub const DEFAULT_ENDPOINT_URL: &str = "https://api.siliconflow.cn/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "Pro/deepseek-ai/DeepSeek-R1";

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay() -> u64 {
    2
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no API key configured; set `service.api_key` in the config file")]
    MissingApiKey,
    #[error("failed to load custom templates: {0}")]
    Templates(#[from] TemplateStoreError),
}

/// Connection settings for one generation backend. Immutable once handed to
/// a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    pub api_key: String,
    pub model: String,
    pub endpoint_url: String,
    pub timeout: Duration,
}

impl ServiceConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = endpoint_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            endpoint_url: DEFAULT_ENDPOINT_URL.to_string(),
            timeout: Duration::from_secs(default_timeout()),
        }
    }
}

/// Bounded retry budget with linear backoff: the wait after failed attempt
/// `n` (0-indexed) is `base_delay * (n + 1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: usize, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub const fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt.saturating_add(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(default_max_retries(), Duration::from_secs(default_retry_delay()))
    }
}

/// Yields the credentials and retry budget the generation client runs with.
pub trait SettingsProvider {
    fn service_config(&self) -> Result<ServiceConfig, ConfigError>;
    fn retry_policy(&self) -> RetryPolicy;
    fn provider_name(&self) -> &str {
        DEFAULT_PROVIDER
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServiceSettings {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub endpoint_url: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: String::new(),
            model: default_model(),
            endpoint_url: String::new(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

impl ServiceSettings {
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TemplateSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl TemplateSettings {
    fn inline(&self, mode: PromptMode) -> Option<&str> {
        let value = match mode {
            PromptMode::Generation => self.generation.as_deref(),
            PromptMode::Continuation => self.continuation.as_deref(),
        };
        value.filter(|template| !template.trim().is_empty())
    }

    /// Templates from the configured directory with inline templates layered on top.
    pub fn load_library(&self) -> Result<TemplateLibrary, TemplateStoreError> {
        let mut library = match &self.directory {
            Some(dir) => TemplateLibrary::from_directory(dir)?,
            None => TemplateLibrary::new(),
        };

        for mode in [PromptMode::Generation, PromptMode::Continuation] {
            if let Some(template) = self.inline(mode) {
                library.set(mode, template, TemplateSource::Config);
            }
        }
        Ok(library)
    }
}

impl TemplateStore for TemplateSettings {
    fn template_for(&self, mode: PromptMode) -> Option<String> {
        self.inline(mode).map(str::to_string)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub templates: TemplateSettings,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    pub fn template_library(&self) -> Result<TemplateLibrary, ConfigError> {
        Ok(self.templates.load_library()?)
    }
}

impl SettingsProvider for Config {
    fn service_config(&self) -> Result<ServiceConfig, ConfigError> {
        let service = &self.service;
        if !service.has_api_key() {
            return Err(ConfigError::MissingApiKey);
        }

        let model = if service.model.trim().is_empty() {
            default_model()
        } else {
            service.model.trim().to_string()
        };

        Ok(ServiceConfig {
            api_key: service.api_key.clone(),
            model,
            endpoint_url: service.endpoint_url.trim().to_string(),
            timeout: Duration::from_secs(service.timeout.max(1)),
        })
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.service.max_retries,
            Duration::from_secs(self.service.retry_delay),
        )
    }

    fn provider_name(&self) -> &str {
        &self.service.provider
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            Config::from_path(&path)?
        } else {
            Config::default()
        };

        Ok(Self { path, config })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        Config::from_path(path.as_ref())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn reload(&mut self) -> Result<(), ConfigError> {
        if self.path.exists() {
            self.config = Config::from_path(&self.path)?;
        } else {
            self.config = Config::default();
        }
        Ok(())
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.to_path(&self.path)
    }
}
