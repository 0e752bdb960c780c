//! Effective cache policy per source.
//!
//! Precedence, highest first:
//! 1. a per-operation override for the source
//! 2. the policy attached to the source's answer
//! 3. the connection's default policy
//! 4. the policy configured for the source
//! 5. the projection set's cache policy
//!
//! With none of these the answer never expires.

use std::collections::HashMap;

use weave_core::{CachePolicy, Expiration, Timestamp};

use crate::projection_set::SourceProjectionSet;

#[derive(Debug, Clone, Default)]
pub struct PolicyResolver {
    overrides: HashMap<String, CachePolicy>,
    configured: HashMap<String, CachePolicy>,
    fallback: Option<CachePolicy>,
}

impl PolicyResolver {
    pub fn new(projections: &SourceProjectionSet, overrides: HashMap<String, CachePolicy>) -> Self {
        Self {
            overrides,
            configured: projections.configured_policies().clone(),
            fallback: projections.cache_policy(),
        }
    }

    pub fn resolve(
        &self,
        source_name: &str,
        response: Option<CachePolicy>,
        connection_default: Option<CachePolicy>,
    ) -> Option<CachePolicy> {
        self.overrides
            .get(source_name)
            .copied()
            .or(response)
            .or(connection_default)
            .or_else(|| self.configured.get(source_name).copied())
            .or(self.fallback)
    }

    /// Expiration of an answer obtained at `now`.
    pub fn expiration(
        &self,
        source_name: &str,
        response: Option<CachePolicy>,
        connection_default: Option<CachePolicy>,
        now: Timestamp,
    ) -> Expiration {
        Expiration::from_policy(
            self.resolve(source_name, response, connection_default).as_ref(),
            now,
        )
    }
}
