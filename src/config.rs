//! Repository configuration.
//!
//! Loaded through the `config` crate: serde defaults, then an optional
//! file source, then a `KOR`-prefixed environment overlay (highest
//! precedence), e.g. `KOR__AGENT_NAME=agent1` or
//! `KOR__LOCK__TIMEOUT_SECS=60`.

use crate::error::KorError;
use crate::logging::LoggingConfig;
use crate::storage::{MemoryBackend, SledBackend, StorageBackend};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration of one agent's repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KorConfig {
    /// Name of this agent; its subtree root is `/<agent_name>`.
    #[serde(default = "default_agent_name")]
    pub agent_name: String,

    /// Identity implicitly appended to reader/writer lists at creation.
    #[serde(default = "default_system_identity")]
    pub system_identity: String,

    /// Direct child of the agent root that stays out of hashing and sync.
    #[serde(default = "default_internal_subtree")]
    pub internal_subtree: String,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_agent_name() -> String {
    "ka".to_string()
}

fn default_system_identity() -> String {
    "system".to_string()
}

fn default_internal_subtree() -> String {
    "system".to_string()
}

impl Default for KorConfig {
    fn default() -> Self {
        KorConfig {
            agent_name: default_agent_name(),
            system_identity: default_system_identity(),
            internal_subtree: default_internal_subtree(),
            storage: StorageConfig::default(),
            lock: LockConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `memory` or `sled`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Database directory for the sled backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig { backend: default_storage_backend(), path: None }
    }
}

/// Subtree lock lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout_secs")]
    pub timeout_secs: u64,

    /// How long before expiry `lock_will_expire` fires.
    #[serde(default = "default_lock_warn_ahead_secs")]
    pub warn_ahead_secs: u64,
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_lock_warn_ahead_secs() -> u64 {
    2
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            timeout_secs: default_lock_timeout_secs(),
            warn_ahead_secs: default_lock_warn_ahead_secs(),
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn warn_ahead(&self) -> Duration {
        Duration::from_secs(self.warn_ahead_secs)
    }
}

impl KorConfig {
    /// Load configuration from an optional file with environment overlay.
    pub fn load(file: Option<&Path>) -> Result<KorConfig, KorError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            let path = path.to_str().ok_or_else(|| {
                KorError::Config(format!("config path is not valid UTF-8: {:?}", path))
            })?;
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("KOR")
                .separator("__")
                .try_parsing(true),
        );
        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Open the storage backend this configuration names.
    pub fn open_backend(&self) -> Result<Arc<dyn StorageBackend>, KorError> {
        match self.storage.backend.as_str() {
            "memory" => Ok(Arc::new(MemoryBackend::new())),
            "sled" => {
                let path = self.storage.path.as_deref().ok_or_else(|| {
                    KorError::Config("storage.path is required for the sled backend".to_string())
                })?;
                Ok(Arc::new(SledBackend::open(path)?))
            }
            other => Err(KorError::Config(format!(
                "unknown storage backend: {} (must be 'memory' or 'sled')",
                other
            ))),
        }
    }
}
