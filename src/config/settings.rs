//! Configuration settings for Rettelse.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub database: DatabaseSettings,
    pub queue: QueueSettings,
    pub lock: LockSettings,
    pub worker: WorkerSettings,
    pub transcription: TranscriptionSettings,
    pub notifier: NotifierSettings,
    pub server: ServerSettings,
    pub prompts: PromptSettings,
}


/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Directory for storing application data.
    pub data_dir: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.rettelse".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Path to the SQLite database holding videos, chunks, jobs and segments.
    pub sqlite_path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            sqlite_path: "~/.rettelse/rettelse.db".to_string(),
        }
    }
}

/// Job queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// How long a computed queue summary may be served from cache.
    pub summary_cache_ms: u64,
    /// How often an idle worker re-checks the queue.
    pub poll_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            summary_cache_ms: 250,
            poll_interval_ms: 1000,
        }
    }
}

/// Chunk lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// TTL used when a caller does not ask for one.
    pub default_ttl_secs: u64,
    /// Lower bound for requested TTLs.
    pub min_ttl_secs: u64,
    /// Upper bound for requested TTLs.
    pub max_ttl_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            min_ttl_secs: 30,
            max_ttl_secs: 3600,
        }
    }
}

impl LockSettings {
    /// Clamp a requested TTL into the configured bounds.
    pub fn clamp_ttl(&self, requested: Option<Duration>) -> Duration {
        let secs = requested
            .map(|d| d.as_secs())
            .unwrap_or(self.default_ttl_secs)
            .clamp(self.min_ttl_secs, self.max_ttl_secs.max(self.min_ttl_secs));
        Duration::from_secs(secs)
    }
}

/// Worker loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Retries on the same model for timeouts and 5xx-class failures.
    pub max_transient_retries: u32,
    /// Base delay for exponential backoff between transient retries.
    pub backoff_base_ms: u64,
    /// Upper bound for a single call to the transcription service.
    pub call_timeout_secs: u64,
    /// A PROCESSING job older than this is considered abandoned.
    pub stale_after_secs: u64,
    /// How often the running worker reclaims stale jobs.
    pub health_check_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_transient_retries: 3,
            backoff_base_ms: 500,
            call_timeout_secs: 300,
            stale_after_secs: 900,
            health_check_secs: 60,
        }
    }
}

impl WorkerSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_secs.max(1))
    }
}

/// Transcription service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionSettings {
    /// Model tried first for correction and translation.
    pub primary_model: String,
    /// Model used when the primary reports quota exhaustion. Empty disables the fallback.
    pub fallback_model: String,
    /// Speech-to-text model providing timestamps.
    pub timestamp_model: String,
    /// Language hint for the audio (ISO-639-1), if known.
    pub source_language: Option<String>,
    /// Language the translation column is written in.
    pub target_language: String,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            primary_model: "gpt-4.1".to_string(),
            fallback_model: "gpt-4.1-mini".to_string(),
            timestamp_model: "whisper-1".to_string(),
            source_language: None,
            target_language: "English".to_string(),
        }
    }
}

impl TranscriptionSettings {
    /// Check if a fallback model is configured.
    pub fn has_fallback(&self) -> bool {
        !self.fallback_model.trim().is_empty() && self.fallback_model != self.primary_model
    }
}

/// Live status stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierSettings {
    /// Idle interval after which a heartbeat event is pushed.
    pub heartbeat_secs: u64,
    /// Events buffered per subscriber before it is dropped.
    pub subscriber_buffer: usize,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: 15,
            subscriber_buffer: 32,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// Prompt customization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct PromptSettings {
    /// Directory for custom prompts (overrides defaults).
    pub custom_dir: Option<String>,
    /// Custom variables available in all prompts as {{variable_name}}.
    pub variables: std::collections::HashMap<String, String>,
}


impl Settings {
    /// Load settings from the default configuration file.
    pub fn load() -> crate::error::Result<Self> {
        Self::load_from(None)
    }

    /// Load settings from a specific path, or default location if None.
    pub fn load_from(path: Option<&PathBuf>) -> crate::error::Result<Self> {
        let config_path = match path {
            Some(p) => p.clone(),
            None => Self::default_config_path(),
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: Settings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            Ok(Settings::default())
        }
    }

    /// Save settings to the default configuration file.
    pub fn save(&self) -> crate::error::Result<()> {
        self.save_to(&Self::default_config_path())
    }

    /// Save settings to a specific path.
    pub fn save_to(&self, path: &PathBuf) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::RettelseError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rettelse")
            .join("config.toml")
    }

    /// Expand shell variables in paths (e.g., ~).
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).to_string())
    }

    /// Get the expanded data directory path.
    pub fn data_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.data_dir)
    }

    /// Get the expanded SQLite database path.
    pub fn sqlite_path(&self) -> PathBuf {
        Self::expand_path(&self.database.sqlite_path)
    }
}
