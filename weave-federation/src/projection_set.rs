//! The complete projection configuration of one federated repository.

use std::collections::{HashMap, HashSet};

use weave_core::{CachePolicy, ConfigError, FederationConfig, Path};

use crate::merge::MergeStrategy;
use crate::parser::ProjectionParser;
use crate::projection::Projection;

/// Cache projection, cache policy, and the ordered source projections.
///
/// Validated at construction:
/// - a cache projection and a cache policy come together or not at all
/// - at least one source projection
/// - no source is projected twice, and the cache source is not also projected
#[derive(Debug, Clone)]
pub struct SourceProjectionSet {
    cache_projection: Option<Projection>,
    cache_policy: Option<CachePolicy>,
    source_projections: Vec<Projection>,
    configured_policies: HashMap<String, CachePolicy>,
}

impl SourceProjectionSet {
    pub fn new(
        cache_projection: Option<Projection>,
        cache_policy: Option<CachePolicy>,
        source_projections: Vec<Projection>,
    ) -> Result<Self, ConfigError> {
        match (&cache_projection, &cache_policy) {
            (Some(_), None) => {
                return Err(ConfigError::IncompatibleOptions {
                    option_a: "cache projection".to_string(),
                    option_b: "missing cache policy".to_string(),
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::IncompatibleOptions {
                    option_a: "cache policy".to_string(),
                    option_b: "missing cache projection".to_string(),
                })
            }
            _ => {}
        }
        if source_projections.is_empty() {
            return Err(ConfigError::NoSourceProjections);
        }

        let mut seen = HashSet::new();
        for projection in &source_projections {
            if !seen.insert(projection.source_name()) {
                return Err(ConfigError::DuplicateProjection {
                    source_name: projection.source_name().to_string(),
                });
            }
        }
        if let Some(cache) = &cache_projection {
            if seen.contains(cache.source_name()) {
                return Err(ConfigError::IncompatibleOptions {
                    option_a: "cache projection".to_string(),
                    option_b: format!("source projection for '{}'", cache.source_name()),
                });
            }
        }

        Ok(Self {
            cache_projection,
            cache_policy,
            source_projections,
            configured_policies: HashMap::new(),
        })
    }

    /// Compile a validated configuration with the default rule parser.
    pub fn from_config(config: &FederationConfig) -> Result<Self, ConfigError> {
        Self::from_config_with(config, &ProjectionParser::default())
    }

    pub fn from_config_with(
        config: &FederationConfig,
        parser: &ProjectionParser,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (cache_projection, cache_policy) = match &config.cache {
            Some(cache) => {
                let rules = parser
                    .parse_all(cache.rules.as_slice())
                    .map_err(|error| ConfigError::InvalidRule {
                        source_name: cache.source.clone(),
                        error,
                    })?;
                (
                    Some(
                        Projection::new(cache.source.clone(), rules)?
                            .with_workspace(cache.workspace.clone()),
                    ),
                    Some(cache.cache_policy()),
                )
            }
            None => (None, None),
        };
        let projections = config
            .projections
            .iter()
            .map(|p| Projection::from_config(p, parser))
            .collect::<Result<Vec<_>, _>>()?;

        let mut set = Self::new(cache_projection, cache_policy, projections)?;
        for source in &config.sources {
            if let Some(policy) = source.default_cache_policy() {
                set = set.with_configured_policy(&source.name, policy);
            }
        }
        Ok(set)
    }

    /// Policy used for a source whose connection declares none.
    pub fn with_configured_policy(mut self, source_name: &str, policy: CachePolicy) -> Self {
        self.configured_policies
            .insert(source_name.to_string(), policy);
        self
    }

    pub fn cache_projection(&self) -> Option<&Projection> {
        self.cache_projection.as_ref()
    }

    pub fn cache_policy(&self) -> Option<CachePolicy> {
        self.cache_policy
    }

    pub fn source_projections(&self) -> &[Projection] {
        &self.source_projections
    }

    pub fn len(&self) -> usize {
        self.source_projections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source_projections.is_empty()
    }

    pub fn projection(&self, source_name: &str) -> Option<&Projection> {
        self.source_projections
            .iter()
            .find(|p| p.source_name() == source_name)
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.source_projections
            .iter()
            .map(Projection::source_name)
            .collect()
    }

    pub fn configured_policies(&self) -> &HashMap<String, CachePolicy> {
        &self.configured_policies
    }

    /// The first projection (in order) whose rules translate `federated`, and
    /// that translation. Writes go to this projection only.
    pub fn authoritative(&self, federated: &Path) -> Option<(&Projection, Path)> {
        self.source_projections
            .iter()
            .find_map(|p| p.primary_path(federated).map(|path| (p, path)))
    }

    pub fn merge_strategy(&self) -> MergeStrategy {
        match self.source_projections.as_slice() {
            [only] if only.is_simple() => MergeStrategy::OneContribution,
            _ => MergeStrategy::Simple,
        }
    }
}
