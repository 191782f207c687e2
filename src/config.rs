//! Engine configuration.
//!
//! Loaded in priority order:
//! 1. Environment variables prefixed with `AUTOMATION_` (highest)
//! 2. Built-in defaults (lowest)
//!
//! Nested keys are separated by a double underscore, e.g.
//! `AUTOMATION_DISPATCHER__MAX_ATTEMPTS=5` or `AUTOMATION_CACHE__TTL_MS=60000`.

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::dispatcher::DispatcherConfig;
use crate::error::ConfigError;

const ENV_PREFIX: &str = "AUTOMATION_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub cache: CacheConfig,

    /// Queue depth of each event stream subscription.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            cache: CacheConfig::default(),
            event_buffer: 1_024,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `AUTOMATION_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.max_concurrency must be at least 1".into(),
            ));
        }
        if self.dispatcher.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.max_attempts must be at least 1".into(),
            ));
        }
        if self.dispatcher.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.attempt_timeout_ms must be positive".into(),
            ));
        }
        if self.cache.max_size == 0 {
            return Err(ConfigError::Invalid("cache.max_size must be at least 1".into()));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be at least 1".into()));
        }
        Ok(())
    }
}
