//! What one source offers for one federated location.

use serde::{Deserialize, Serialize};
use weave_core::{ChildRef, Expiration, Location, Properties, Timestamp};

/// How a contribution came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContributionKind {
    /// The source has nothing here.
    Empty,
    /// Synthetic children leading toward subtrees the source mounts below
    /// the location.
    Placeholder,
    /// A node actually read from the source.
    Node,
}

/// The partial result one source supplies for one federated location.
///
/// Children are already in federated form. Contributions are immutable once
/// built; merging produces a new view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    source_name: String,
    location_in_source: Option<Location>,
    children: Vec<ChildRef>,
    properties: Properties,
    expires_at: Expiration,
    kind: ContributionKind,
}

impl Contribution {
    /// Nothing from `source_name`; never constrains expiration.
    pub fn empty(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            location_in_source: None,
            children: Vec::new(),
            properties: Properties::new(),
            expires_at: Expiration::Never,
            kind: ContributionKind::Empty,
        }
    }

    /// Synthetic children only. Placeholders derive from configuration, not
    /// source data, so they never expire.
    pub fn placeholder<I, S>(source_name: impl Into<String>, child_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source_name: source_name.into(),
            location_in_source: None,
            children: child_names.into_iter().map(ChildRef::named).collect(),
            properties: Properties::new(),
            expires_at: Expiration::Never,
            kind: ContributionKind::Placeholder,
        }
    }

    pub fn from_node(
        source_name: impl Into<String>,
        location_in_source: Location,
        children: Vec<ChildRef>,
        properties: Properties,
        expires_at: Expiration,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            location_in_source: Some(location_in_source),
            children,
            properties,
            expires_at,
            kind: ContributionKind::Node,
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn location_in_source(&self) -> Option<&Location> {
        self.location_in_source.as_ref()
    }

    pub fn children(&self) -> &[ChildRef] {
        &self.children
    }

    pub fn child_names(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn expires_at(&self) -> Expiration {
        self.expires_at
    }

    pub fn kind(&self) -> ContributionKind {
        self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.kind == ContributionKind::Empty
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind == ContributionKind::Placeholder
    }

    /// `instant >= expires_at`.
    pub fn is_expired(&self, instant: Timestamp) -> bool {
        self.expires_at.is_expired(instant)
    }
}
