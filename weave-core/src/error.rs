//! Error types for WEAVE operations

use crate::Path;
use thiserror::Error;

/// Malformed path text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Path is empty")]
    Empty,

    #[error("Path is not absolute: {text}")]
    NotAbsolute { text: String },

    #[error("Invalid path segment '{segment}': {reason}")]
    InvalidSegment { segment: String, reason: String },
}

/// Projection rule text that cannot be compiled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleSyntaxError {
    #[error("Rule is empty")]
    Empty,

    #[error("Rule '{text}' has no '=>' separator")]
    MissingSeparator { text: String },

    #[error("Rule '{text}' has an empty {side} side")]
    EmptySide { text: String, side: RuleSide },

    #[error("Rule '{text}' has an invalid {side} path: {reason}")]
    InvalidPath {
        text: String,
        side: RuleSide,
        reason: String,
    },

    #[error("Rule '{text}' has an absolute exception '{exception}'; exceptions are relative to the source path")]
    AbsoluteException { text: String, exception: String },

    #[error("Rule '{text}' uses '*' somewhere other than a trailing segment")]
    MisplacedWildcard { text: String },
}

/// Which side of a `=>` rule an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSide {
    Federated,
    Source,
}

impl std::fmt::Display for RuleSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleSide::Federated => write!(f, "federated"),
            RuleSide::Source => write!(f, "source"),
        }
    }
}

/// Configuration errors. Always raised at construction time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Projection for source '{source_name}' has no rules")]
    EmptyProjection { source_name: String },

    #[error("No source projections configured")]
    NoSourceProjections,

    #[error("Source '{source_name}' is projected more than once")]
    DuplicateProjection { source_name: String },

    #[error("Invalid rule for source '{source_name}': {error}")]
    InvalidRule {
        source_name: String,
        error: RuleSyntaxError,
    },

    #[error("Unable to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Errors reported by a single backing source.
///
/// `NotFound` is the only recoverable variant during reads: it means "this
/// source has nothing here". Everything else aborts the operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Node not found in source '{source_name}' at {path} (lowest existing ancestor: {lowest_existing:?})")]
    NotFound {
        source_name: String,
        path: Path,
        lowest_existing: Option<Path>,
    },

    #[error("Source '{source_name}' is unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },

    #[error("Source '{source_name}' does not support {operation}: {reason}")]
    Unsupported {
        source_name: String,
        operation: String,
        reason: String,
    },

    #[error("Node already exists in source '{source_name}' at {path}")]
    AlreadyExists { source_name: String, path: Path },

    #[error("Connection pool for source '{source_name}' is shut down")]
    PoolShutdown { source_name: String },

    #[error("Connection to source '{source_name}' is closed")]
    ConnectionClosed { source_name: String },

    #[error("Lock poisoned in source '{source_name}'")]
    LockPoisoned { source_name: String },

    #[error("Operation against source '{source_name}' was cancelled")]
    Cancelled { source_name: String },

    #[error("Source '{source_name}' has no workspace named '{workspace}'")]
    NoSuchWorkspace {
        source_name: String,
        workspace: String,
    },
}

impl SourceError {
    /// True for "this source has nothing at that path".
    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound { .. })
    }

    /// True for every error that must abort a federated operation.
    pub fn is_fatal(&self) -> bool {
        !self.is_not_found()
    }

    pub fn source_name(&self) -> &str {
        match self {
            SourceError::NotFound { source_name, .. }
            | SourceError::Unavailable { source_name, .. }
            | SourceError::Unsupported { source_name, .. }
            | SourceError::AlreadyExists { source_name, .. }
            | SourceError::PoolShutdown { source_name }
            | SourceError::ConnectionClosed { source_name }
            | SourceError::LockPoisoned { source_name }
            | SourceError::Cancelled { source_name }
            | SourceError::NoSuchWorkspace { source_name, .. } => source_name,
        }
    }
}

/// Errors raised by the federation layer itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FederationError {
    #[error("Path not found: {path}")]
    PathNotFound { path: Path },

    #[error("Unsupported {operation} at {path}: {reason}")]
    Unsupported {
        operation: String,
        path: Path,
        reason: String,
    },

    #[error("Source '{source_name}' failed at {path}: {error}")]
    SourceFailed {
        source_name: String,
        path: Path,
        error: SourceError,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cached merge plan at {path} is unreadable: {reason}")]
    CorruptMergePlan { path: Path, reason: String },
}

/// Master error type for all WEAVE errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WeaveError {
    #[error("Path error: {0}")]
    Path(#[from] PathError),

    #[error("Rule syntax error: {0}")]
    Rule(#[from] RuleSyntaxError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Federation error: {0}")]
    Federation(#[from] FederationError),
}

impl WeaveError {
    /// True when the error reports a missing path rather than a failure.
    pub fn is_path_not_found(&self) -> bool {
        matches!(
            self,
            WeaveError::Federation(FederationError::PathNotFound { .. })
        )
    }
}

/// Result type alias for WEAVE operations.
pub type WeaveResult<T> = Result<T, WeaveError>;

/// Result type alias for calls against a single source.
pub type SourceResult<T> = Result<T, SourceError>;

// =============================================================================
// TESTS
// =============================================================================
