//! Merging contributions into one federated node.
//!
//! Precedence is positional: contributions arrive in projection order and the
//! first one to define a child name or a property name wins. Later values for
//! the same name are dropped without any attempt at semantic merging.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use weave_core::{
    compute_content_hash, content_hash_hex, node_id_for_path, ChildRef, Expiration,
    FederationError, Location, Path, Properties, PropertyValue, Timestamp,
};

use crate::contribution::Contribution;

/// Property under which a cached node stores its merge plan.
pub const MERGE_PLAN_PROPERTY: &str = "weave:mergePlan";

/// How contributions are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeStrategy {
    /// A single simple projection: its contribution is the node.
    OneContribution,
    /// First-wins union over all contributions.
    Simple,
}

/// A federated node assembled from its contributions.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedNode {
    pub location: Location,
    pub children: Vec<ChildRef>,
    pub properties: Properties,
    pub expires_at: Expiration,
    /// One per source projection, in projection order.
    pub contributions: Vec<Contribution>,
}

impl MergedNode {
    pub fn path(&self) -> &Path {
        self.location.path()
    }

    pub fn is_expired(&self, instant: Timestamp) -> bool {
        self.expires_at.is_expired(instant)
    }

    pub fn child_names(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.name.as_str()).collect()
    }

    /// Hex SHA-256 over the merged children and properties.
    pub fn fingerprint(&self) -> String {
        let mut content = Vec::new();
        for child in &self.children {
            content.extend_from_slice(child.name.as_bytes());
            content.push(0);
        }
        content.push(0xff);
        if let Ok(json) = serde_json::to_vec(&self.properties) {
            content.extend_from_slice(&json);
        }
        content_hash_hex(&compute_content_hash(&content))
    }
}

/// Merge contributions for `requested`.
///
/// Returns `None` when every contribution is empty.
pub fn merge_contributions(
    requested: &Location,
    contributions: Vec<Contribution>,
    strategy: MergeStrategy,
) -> Option<MergedNode> {
    let non_empty: Vec<&Contribution> = contributions.iter().filter(|c| !c.is_empty()).collect();
    if non_empty.is_empty() {
        return None;
    }

    let (children, properties) = match (strategy, non_empty.as_slice()) {
        (MergeStrategy::OneContribution, [only]) => {
            (only.children().to_vec(), only.properties().clone())
        }
        _ => merge_first_wins(&non_empty),
    };

    let expires_at = Expiration::earliest(non_empty.iter().map(|c| c.expires_at()));
    let id = non_empty
        .iter()
        .filter_map(|c| c.location_in_source().and_then(Location::id))
        .next()
        .or_else(|| requested.id())
        .unwrap_or_else(|| node_id_for_path(requested.path()));

    Some(MergedNode {
        location: Location::new(requested.path().clone()).with_id(id),
        children,
        properties,
        expires_at,
        contributions,
    })
}

fn merge_first_wins(contributions: &[&Contribution]) -> (Vec<ChildRef>, Properties) {
    let mut seen = HashSet::new();
    let mut children = Vec::new();
    let mut properties = Properties::new();
    for contribution in contributions {
        for child in contribution.children() {
            if seen.insert(child.name.as_str()) {
                children.push(child.clone());
            }
        }
        for (name, value) in contribution.properties() {
            properties
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }
    (children, properties)
}

// ============================================================================
// MERGE PLAN
// ============================================================================

/// The contributions behind a cached node, stored with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub cached_at: Timestamp,
    /// When the cached node stops being fresh.
    pub expires_at: Expiration,
    pub contributions: Vec<Contribution>,
}

impl MergePlan {
    pub fn new(cached_at: Timestamp, expires_at: Expiration, contributions: Vec<Contribution>) -> Self {
        Self {
            cached_at,
            expires_at,
            contributions,
        }
    }

    pub fn is_expired(&self, instant: Timestamp) -> bool {
        self.expires_at.is_expired(instant)
    }

    /// Source names in the order the plan recorded them.
    pub fn source_names(&self) -> Vec<&str> {
        self.contributions.iter().map(|c| c.source_name()).collect()
    }

    pub fn to_property_value(&self, path: &Path) -> Result<PropertyValue, FederationError> {
        serde_json::to_string(self)
            .map(PropertyValue::String)
            .map_err(|e| FederationError::CorruptMergePlan {
                path: path.clone(),
                reason: e.to_string(),
            })
    }

    /// Read the plan stored on a cached node, if there is one.
    pub fn from_properties(
        properties: &Properties,
        path: &Path,
    ) -> Result<Option<Self>, FederationError> {
        let Some(value) = properties.get(MERGE_PLAN_PROPERTY) else {
            return Ok(None);
        };
        let text = value.as_str().ok_or_else(|| FederationError::CorruptMergePlan {
            path: path.clone(),
            reason: "merge plan is not a string".to_string(),
        })?;
        serde_json::from_str(text)
            .map(Some)
            .map_err(|e| FederationError::CorruptMergePlan {
                path: path.clone(),
                reason: e.to_string(),
            })
    }
}
