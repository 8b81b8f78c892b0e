//! Unveil dispatch configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, UnveilError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnveilConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub sms: SmsConfig,
}

fn default_database_path() -> String { "~/.unveil/unveil.db".into() }

impl Default for UnveilConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            gateway: GatewayConfig::default(),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            push: PushConfig::default(),
            sms: SmsConfig::default(),
        }
    }
}

impl UnveilConfig {
    /// Load config from a specific path, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| UnveilError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| UnveilError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config.with_env_overrides())
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| UnveilError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Secrets may come from the environment instead of the file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(secret) = std::env::var("UNVEIL_CRON_SECRET") {
            self.gateway.cron_secret = secret;
        }
        if let Ok(key) = std::env::var("UNVEIL_PUSH_API_KEY") {
            self.push.api_key = key;
        }
        if let Ok(token) = std::env::var("UNVEIL_SMS_AUTH_TOKEN") {
            self.sms.auth_token = token;
        }
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch.claim_limit == 0 {
            return Err(UnveilError::Config("batch.claim_limit must be > 0".into()));
        }
        if self.batch.job_concurrency == 0 || self.batch.recipient_concurrency == 0 {
            return Err(UnveilError::Config("batch concurrency must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(UnveilError::Config("retry.max_attempts must be > 0".into()));
        }
        if self.retry.delays_ms.is_empty() {
            return Err(UnveilError::Config("retry.delays_ms must not be empty".into()));
        }
        if self.push.provider == ProviderKind::Http && self.push.endpoint.is_empty() {
            return Err(UnveilError::Config("push.endpoint required for http provider".into()));
        }
        if self.sms.provider == ProviderKind::Http && self.sms.endpoint.is_empty() {
            return Err(UnveilError::Config("sms.endpoint required for http provider".into()));
        }
        Ok(())
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Unveil home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".unveil")
    }
}

/// HTTP gateway (timer invocation surface) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret the timer presents. Empty disables the protected routes.
    #[serde(default)]
    pub cron_secret: String,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 8787 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cron_secret: String::new(),
        }
    }
}

/// Per-invocation batch sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_claim_limit")]
    pub claim_limit: usize,
    #[serde(default = "default_job_concurrency")]
    pub job_concurrency: usize,
    #[serde(default = "default_recipient_concurrency")]
    pub recipient_concurrency: usize,
    /// Grace window before a `Sending` job is considered abandoned.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "bool_true")]
    pub sweep_on_run: bool,
}

fn default_claim_limit() -> usize { 25 }
fn default_job_concurrency() -> usize { 2 }
fn default_recipient_concurrency() -> usize { 16 }
fn default_stale_after() -> u64 { 900 }
fn bool_true() -> bool { true }

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            claim_limit: default_claim_limit(),
            job_concurrency: default_job_concurrency(),
            recipient_concurrency: default_recipient_concurrency(),
            stale_after_secs: default_stale_after(),
            sweep_on_run: true,
        }
    }
}

impl BatchConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

/// Retry schedule for channel sends (Retryable errors only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delays_ms")]
    pub delays_ms: Vec<u64>,
}

fn default_max_attempts() -> u32 { 3 }
fn default_delays_ms() -> Vec<u64> { vec![1000, 2000, 5000] }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delays_ms: default_delays_ms(),
        }
    }
}

/// Which transport backs a channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Real HTTP gateway.
    Http,
    /// Log-only transport that always succeeds; for local runs.
    Log,
}

/// Push gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Notification title shown above the message body.
    #[serde(default = "default_push_title")]
    pub title: String,
    #[serde(default = "default_push_rate")]
    pub rate_per_second: u32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_provider() -> ProviderKind { ProviderKind::Log }
fn default_push_title() -> String { "New message from your host".into() }
fn default_push_rate() -> u32 { 50 }
fn default_timeout() -> u64 { 10 }

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: String::new(),
            api_key: String::new(),
            title: default_push_title(),
            rate_per_second: default_push_rate(),
            timeout_secs: default_timeout(),
        }
    }
}

impl PushConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// SMS gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub from_number: String,
    #[serde(default = "default_sms_rate")]
    pub rate_per_second: u32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_sms_rate() -> u32 { 10 }

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: String::new(),
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            rate_per_second: default_sms_rate(),
            timeout_secs: default_timeout(),
        }
    }
}

impl SmsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
