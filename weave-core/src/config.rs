//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::{CachePolicy, ConfigError};

/// Connection pool sizing and validation settings for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept open even when idle.
    pub core_size: usize,
    /// Upper bound on open connections.
    pub max_size: usize,
    /// How long an acquire may wait for a free connection, in milliseconds.
    pub acquire_timeout_ms: u64,
    /// Ping each connection before handing it out.
    pub validate_before_use: bool,
    /// Ping timeout in milliseconds.
    pub ping_timeout_ms: u64,
    /// Acquire attempts before giving up when validation keeps failing.
    pub max_failed_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_size: 1,
            max_size: 10,
            acquire_timeout_ms: 10_000,
            validate_before_use: false,
            ping_timeout_ms: 100,
            max_failed_attempts: 10,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_core_size(mut self, core_size: usize) -> Self {
        self.core_size = core_size;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_validation(mut self, ping_timeout: Duration) -> Self {
        self.validate_before_use = true;
        self.ping_timeout_ms = ping_timeout.as_millis() as u64;
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn validate(&self, field_prefix: &str) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.max_size", field_prefix),
                value: self.max_size.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.core_size > self.max_size {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.core_size", field_prefix),
                value: self.core_size.to_string(),
                reason: format!("may not exceed max_size ({})", self.max_size),
            });
        }
        if self.max_failed_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.max_failed_attempts", field_prefix),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// A backing source and its defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Default time-to-live of this source's answers, in milliseconds.
    #[serde(default)]
    pub default_ttl_ms: Option<u64>,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl SourceConfig {
    pub fn default_cache_policy(&self) -> Option<CachePolicy> {
        self.default_ttl_ms.map(CachePolicy::from_millis)
    }
}

/// One source projection: a source name and its rule texts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionConfig {
    pub source: String,
    /// Workspace inside the source; the source's default workspace when unset.
    #[serde(default)]
    pub workspace: Option<String>,
    pub rules: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// The cache projection and the policy applied to merged results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub source: String,
    #[serde(default)]
    pub workspace: Option<String>,
    pub ttl_ms: u64,
    pub rules: Vec<String>,
}

impl CacheConfig {
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy::from_millis(self.ttl_ms)
    }
}

/// Master configuration of one federated repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationConfig {
    pub name: String,
    #[serde(default)]
    pub parallel_fan_out: bool,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub projections: Vec<ProjectionConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl FederationConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: FederationConfig = toml::from_str(text).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural constraints; rule texts are compiled later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "name".to_string(),
            });
        }
        if self.projections.is_empty() {
            return Err(ConfigError::NoSourceProjections);
        }

        let mut projected = HashSet::new();
        for (i, projection) in self.projections.iter().enumerate() {
            if projection.source.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: format!("projections[{}].source", i),
                });
            }
            if projection.rules.is_empty() {
                return Err(ConfigError::EmptyProjection {
                    source_name: projection.source.clone(),
                });
            }
            if projection
                .workspace
                .as_deref()
                .is_some_and(|w| w.trim().is_empty())
            {
                return Err(ConfigError::InvalidValue {
                    field: format!("projections[{}].workspace", i),
                    value: String::new(),
                    reason: "must not be blank".to_string(),
                });
            }
            if !projected.insert(projection.source.as_str()) {
                return Err(ConfigError::DuplicateProjection {
                    source_name: projection.source.clone(),
                });
            }
        }

        if let Some(cache) = &self.cache {
            if cache.source.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "cache.source".to_string(),
                });
            }
            if cache.rules.is_empty() {
                return Err(ConfigError::EmptyProjection {
                    source_name: cache.source.clone(),
                });
            }
            if cache.ttl_ms == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "cache.ttl_ms".to_string(),
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
            if projected.contains(cache.source.as_str()) {
                return Err(ConfigError::IncompatibleOptions {
                    option_a: "cache.source".to_string(),
                    option_b: format!("projection for '{}'", cache.source),
                });
            }
        }

        let mut declared = HashSet::new();
        for (i, source) in self.sources.iter().enumerate() {
            if source.name.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: format!("sources[{}].name", i),
                });
            }
            if !declared.insert(source.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: format!("sources[{}].name", i),
                    value: source.name.clone(),
                    reason: "declared more than once".to_string(),
                });
            }
            source.pool.validate(&format!("sources[{}].pool", i))?;
        }
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name = "Federated Source"

[cache]
source = "Cache"
ttl_ms = 10000
rules = ["/ => /cache/repo/A"]

[[projections]]
source = "Source 1"
rules = ["/a => /source/one/a", "/b => /source/one/b"]

[[projections]]
source = "Source 2"
workspace = "published"
rules = ["/a => /source/two/a"]
read_only = true

[[sources]]
name = "Source 1"
default_ttl_ms = 100000

[sources.pool]
core_size = 2
max_size = 4
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = FederationConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.name, "Federated Source");
        assert!(!config.parallel_fan_out);
        assert_eq!(config.projections.len(), 2);
        assert!(config.projections[1].read_only);
        assert_eq!(config.projections[0].workspace, None);
        assert_eq!(config.projections[1].workspace.as_deref(), Some("published"));
        let cache = config.cache.as_ref().unwrap();
        assert_eq!(cache.cache_policy(), CachePolicy::from_secs(10));
        let source = config.source("Source 1").unwrap();
        assert_eq!(source.default_cache_policy(), Some(CachePolicy::from_secs(100)));
        assert_eq!(source.pool.core_size, 2);
        assert_eq!(source.pool.max_size, 4);
        assert_eq!(source.pool.acquire_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_missing_projections() {
        let err = FederationConfig::from_toml_str("name = \"x\"").unwrap_err();
        assert_eq!(err, ConfigError::NoSourceProjections);
    }

    #[test]
    fn test_rejects_duplicate_projection() {
        let text = r#"
name = "x"
[[projections]]
source = "A"
rules = ["/ => /"]
[[projections]]
source = "A"
rules = ["/b => /b"]
"#;
        assert!(matches!(
            FederationConfig::from_toml_str(text),
            Err(ConfigError::DuplicateProjection { .. })
        ));
    }

    #[test]
    fn test_rejects_empty_rule_list() {
        let text = r#"
name = "x"
[[projections]]
source = "A"
rules = []
"#;
        assert!(matches!(
            FederationConfig::from_toml_str(text),
            Err(ConfigError::EmptyProjection { .. })
        ));
    }

    #[test]
    fn test_rejects_blank_workspace() {
        let text = r#"
name = "x"
[[projections]]
source = "A"
workspace = " "
rules = ["/ => /"]
"#;
        assert!(matches!(
            FederationConfig::from_toml_str(text),
            Err(ConfigError::InvalidValue { field, .. }) if field == "projections[0].workspace"
        ));
    }

    #[test]
    fn test_rejects_core_larger_than_max() {
        let pool = PoolConfig::new().with_core_size(5).with_max_size(2);
        assert!(matches!(
            pool.validate("pool"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rejects_unparseable_toml() {
        assert!(matches!(
            FederationConfig::from_toml_str("name = "),
            Err(ConfigError::Parse { .. })
        ));
    }
}
