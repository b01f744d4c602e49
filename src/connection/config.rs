use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::core::{Error, Result};

/// Session and mapping configuration.
///
/// Every field has a default, so a JSON document only needs the keys it
/// wants to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrmConfig {
    /// Reuse prepared statements through the per-connection cache
    pub cache_enabled: bool,

    /// Entries kept per connection and per statement kind
    pub max_cache_entries: usize,

    /// Entries older than this are evicted on the next insertion
    pub max_cache_age_ms: u64,

    /// Ask the driver for generated keys when preparing INSERTs
    pub supports_generated_keys: bool,

    /// Map rows that lack some of the entity's columns
    pub allow_missing_columns: bool,

    /// Keep caches of connections other than the active one
    pub retain_inactive_connections: bool,
}

impl OrmConfig {
    pub fn new() -> Self {
        Self {
            cache_enabled: true,
            max_cache_entries: 1000,
            max_cache_age_ms: 30 * 60 * 1000,
            supports_generated_keys: true,
            allow_missing_columns: false,
            retain_inactive_connections: false,
        }
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn max_cache_entries(mut self, max: usize) -> Self {
        self.max_cache_entries = max;
        self
    }

    pub fn max_cache_age(mut self, age: Duration) -> Self {
        self.max_cache_age_ms = age.as_millis() as u64;
        self
    }

    pub fn supports_generated_keys(mut self, supported: bool) -> Self {
        self.supports_generated_keys = supported;
        self
    }

    pub fn allow_missing_columns(mut self, allow: bool) -> Self {
        self.allow_missing_columns = allow;
        self
    }

    pub fn retain_inactive_connections(mut self, retain: bool) -> Self {
        self.retain_inactive_connections = retain;
        self
    }

    pub fn max_cache_age_duration(&self) -> Duration {
        Duration::from_millis(self.max_cache_age_ms)
    }

    /// Parse and validate a JSON document.
    ///
    /// ```
    /// use beanmap::OrmConfig;
    ///
    /// let config = OrmConfig::from_json(r#"{ "max_cache_entries": 50 }"#).unwrap();
    /// assert_eq!(config.max_cache_entries, 50);
    /// assert!(config.cache_enabled);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| Error::Configuration(format!("Invalid configuration: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_cache_entries == 0 {
            return Err(Error::Configuration("max_cache_entries must be > 0".into()));
        }

        if self.max_cache_age_ms == 0 {
            return Err(Error::Configuration("max_cache_age_ms must be > 0".into()));
        }

        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.max_cache_entries,
            max_age: self.max_cache_age_duration(),
            retain_inactive_connections: self.retain_inactive_connections,
        }
    }
}

impl Default for OrmConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrmConfig::default();
        assert!(config.cache_enabled);
        assert_eq!(config.max_cache_entries, 1000);
        assert_eq!(config.max_cache_age_duration(), Duration::from_secs(1800));
        assert!(config.supports_generated_keys);
        assert!(!config.allow_missing_columns);
    }

    #[test]
    fn test_builder_pattern() {
        let config = OrmConfig::new()
            .cache_enabled(false)
            .max_cache_entries(20)
            .max_cache_age(Duration::from_secs(5))
            .allow_missing_columns(true);

        assert!(!config.cache_enabled);
        assert_eq!(config.max_cache_entries, 20);
        assert_eq!(config.max_cache_age_ms, 5000);
        assert!(config.allow_missing_columns);

        let cache = config.cache_config();
        assert_eq!(cache.max_entries, 20);
        assert_eq!(cache.max_age, Duration::from_secs(5));
    }

    #[test]
    fn test_from_json_uses_defaults() {
        let config = OrmConfig::from_json(r#"{"cache_enabled": false}"#).unwrap();
        assert!(!config.cache_enabled);
        assert_eq!(config.max_cache_entries, 1000);
        assert!(config.supports_generated_keys);
    }

    #[test]
    fn test_from_json_rejects_bad_input() {
        assert!(matches!(
            OrmConfig::from_json("not json"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            OrmConfig::from_json(r#"{"max_cache_entries": 0}"#),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(OrmConfig::new().validate().is_ok());
        assert!(OrmConfig::new().max_cache_entries(0).validate().is_err());
        assert!(OrmConfig::new().max_cache_age(Duration::ZERO).validate().is_err());
    }
}
