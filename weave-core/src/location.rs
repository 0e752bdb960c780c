//! Locations of nodes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{NodeId, Path};

/// Identifies a node: always a path, optionally a stable identifier.
///
/// Two locations are equal only when both the path and the identifier match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    path: Path,
    id: Option<NodeId>,
}

impl Location {
    pub fn new(path: Path) -> Self {
        Self { path, id: None }
    }

    pub fn root() -> Self {
        Self::new(Path::root())
    }

    /// Copy of this location carrying the given identifier.
    pub fn with_id(&self, id: NodeId) -> Self {
        Self {
            path: self.path.clone(),
            id: Some(id),
        }
    }

    /// Copy of this location at another path, keeping the identifier.
    pub fn with_path(&self, path: Path) -> Self {
        Self { path, id: self.id }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> Option<NodeId> {
        self.id
    }

    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }
}

impl From<Path> for Location {
    fn from(path: Path) -> Self {
        Self::new(path)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{} [{}]", self.path, id),
            None => write!(f, "{}", self.path),
        }
    }
}
