use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

use crate::cache::Budgets;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheConfig,
    pub stream: StreamConfig,
    pub persistence: PersistenceConfig,
    pub system: SystemConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_sessions: usize,
    pub max_full_sessions: usize,
    pub max_messages_per_session: usize,
    pub max_total_bytes: u64,
    pub ttl_days: i64,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub reorder_window_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    Memory,
    Fs,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    pub path: String,
    pub flush_interval_ms: u64,
    pub retry_interval_ms: u64,
    pub max_write_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub channel_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_sessions: 50,
            max_full_sessions: 10,
            max_messages_per_session: 500,
            max_total_bytes: 100 * 1024 * 1024,
            ttl_days: 7,
            sweep_interval_ms: 60_000,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reorder_window_ms: 2_000,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            max_attempts: 8,
            attempt_timeout_ms: 15_000,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Fs,
            path: "./cache".to_string(),
            flush_interval_ms: 250,
            retry_interval_ms: 2_000,
            max_write_attempts: 10,
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_env = env::var("CONFIG_ENV").unwrap_or_else(|_| "default".to_string());

        let config = Config::builder()
            .add_source(File::with_name(&format!("config/{}", config_env)).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn budgets(&self) -> Budgets {
        Budgets {
            max_sessions: self.cache.max_sessions,
            max_full_sessions: self.cache.max_full_sessions,
            max_messages_per_session: self.cache.max_messages_per_session,
            max_total_bytes: self.cache.max_total_bytes,
            ttl: chrono::Duration::days(self.cache.ttl_days),
        }
    }

    /// Fail fast on limits that would make every write evict itself
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_sessions == 0 {
            anyhow::bail!("cache.max_sessions must be at least 1");
        }
        if self.cache.max_full_sessions > self.cache.max_sessions {
            anyhow::bail!(
                "cache.max_full_sessions ({}) exceeds cache.max_sessions ({})",
                self.cache.max_full_sessions,
                self.cache.max_sessions
            );
        }
        if self.cache.ttl_days <= 0 {
            anyhow::bail!("cache.ttl_days must be positive");
        }
        if self.stream.backoff_base_ms > self.stream.backoff_cap_ms {
            anyhow::bail!("stream.backoff_base_ms exceeds stream.backoff_cap_ms");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_budgets() {
        let settings = Settings::default();
        let budgets = settings.budgets();
        assert_eq!(budgets.max_sessions, 50);
        assert_eq!(budgets.max_full_sessions, 10);
        assert_eq!(budgets.max_messages_per_session, 500);
        assert_eq!(budgets.max_total_bytes, 100 * 1024 * 1024);
        assert_eq!(budgets.ttl, chrono::Duration::days(7));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_limits() {
        let mut settings = Settings::default();
        settings.cache.max_full_sessions = 60;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = Config::builder()
            .add_source(config::File::from_str(
                "[cache]\nmax_sessions = 20\n[persistence]\nbackend = \"sqlite\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let settings: Settings = config.try_deserialize().unwrap();
        assert_eq!(settings.cache.max_sessions, 20);
        assert_eq!(settings.cache.max_full_sessions, 10);
        assert_eq!(settings.persistence.backend, PersistenceBackend::Sqlite);
        assert_eq!(settings.stream.reorder_window_ms, 2_000);
    }
}
