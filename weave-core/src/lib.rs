//! WEAVE Core - Shared Types
//!
//! Paths, locations, property values, cache policies, configuration, and the
//! error taxonomy shared by every other crate in the workspace. This crate
//! contains data types only; connection handling and federation live in
//! `weave-connector` and `weave-federation`.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod cache_policy;
pub mod cancel;
pub mod config;
pub mod error;
pub mod location;
pub mod path;
pub mod value;

pub use cache_policy::{CachePolicy, Expiration};
pub use cancel::CancellationToken;
pub use config::{CacheConfig, FederationConfig, PoolConfig, ProjectionConfig, SourceConfig};
pub use error::{
    ConfigError, FederationError, PathError, RuleSide, RuleSyntaxError, SourceError,
    SourceResult, WeaveError, WeaveResult,
};
pub use location::Location;
pub use path::Path;
pub use value::{ChildRef, Properties, Property, PropertyValue};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Stable node identifier.
pub type NodeId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash.
pub type ContentHash = [u8; 32];

/// Generate a new UUIDv7 node id (timestamp-sortable).
pub fn new_node_id() -> NodeId {
    Uuid::now_v7()
}

/// Deterministic node id for a federated path that no source identified.
pub fn node_id_for_path(path: &Path) -> NodeId {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("weave:{}", path).as_bytes())
}

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Hex rendering of a content hash.
pub fn content_hash_hex(hash: &ContentHash) -> String {
    hex::encode(hash)
}
