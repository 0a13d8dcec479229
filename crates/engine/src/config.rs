use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Engine configuration, loadable from TOML. Every field has a default.
///
/// ```toml
/// service_identifier = "billing"
///
/// [lock]
/// lease_millis = 60000
/// retry_frequency_millis = 1000
/// quit_trying_after_millis = 180000
///
/// [target_systems]
/// strict = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of the generated runner id. The hostname is used when unset.
    pub service_identifier: Option<String>,
    pub lock: LockConfig,
    pub target_systems: TargetSystemsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub key: String,
    pub lease_millis: u64,
    pub retry_frequency_millis: u64,
    pub quit_trying_after_millis: u64,
    /// When false, a lock that cannot be acquired yields a degraded summary
    /// instead of an error.
    pub throw_on_failure: bool,
    pub enable_refresh: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key: "runway-lock".to_string(),
            lease_millis: 60_000,
            retry_frequency_millis: 1_000,
            quit_trying_after_millis: 180_000,
            throw_on_failure: true,
            enable_refresh: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSystemsConfig {
    /// Fail on changes that name an unregistered target system instead of
    /// falling back to the default one.
    pub strict: bool,
}

impl Default for TargetSystemsConfig {
    fn default() -> Self {
        Self { strict: true }
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, EngineError> {
        let config: EngineConfig =
            toml::from_str(source).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let lock = &self.lock;
        if lock.key.trim().is_empty() {
            return Err(EngineError::Config("lock.key must not be empty".into()));
        }
        if lock.retry_frequency_millis == 0 {
            return Err(EngineError::Config(
                "lock.retry_frequency_millis must be greater than zero".into(),
            ));
        }
        if lock.lease_millis <= lock.retry_frequency_millis {
            return Err(EngineError::Config(format!(
                "lock.lease_millis ({}) must be greater than lock.retry_frequency_millis ({})",
                lock.lease_millis, lock.retry_frequency_millis
            )));
        }
        Ok(())
    }
}
