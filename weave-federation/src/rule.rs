//! Projection rules: pure translations between federated and source paths.
//!
//! Both rule kinds mount a federated subtree onto a source subtree. The part
//! of a path below the federated root is carried over verbatim and only then
//! normalized, so `..` segments that would climb out of the source subtree
//! are caught and the translation is refused.
//!
//! - [`OffsetRule`]: `/a => /source/one/a`, a fixed subtree mount.
//! - [`PathRule`]: `/a/* => /source/one/a $ archive`, the wildcard form,
//!   optionally excluding source subtrees (relative to the source root).

use std::fmt;

use weave_core::Path;

/// Map `path` from below `from_root` to the same place below `to_root`.
fn rebase(path: &Path, from_root: &Path, to_root: &Path) -> Option<Path> {
    let remainder = path.relative_to(from_root)?;
    let translated = to_root.join(remainder).normalized()?;
    if to_root.is_at_or_above(&translated) {
        Some(translated)
    } else {
        None
    }
}

// ============================================================================
// OFFSET RULE
// ============================================================================

/// Mounts an entire federated subtree at a fixed source offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OffsetRule {
    federated_root: Path,
    source_root: Path,
}

impl OffsetRule {
    pub fn new(federated_root: Path, source_root: Path) -> Self {
        Self {
            federated_root,
            source_root,
        }
    }
}

// ============================================================================
// PATH RULE
// ============================================================================

/// Wildcard mount with optional exceptions.
///
/// Exceptions are stored already rooted at the source root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathRule {
    federated_root: Path,
    source_root: Path,
    exceptions: Vec<Path>,
    wildcard: bool,
}

impl PathRule {
    pub fn new(federated_root: Path, source_root: Path) -> Self {
        Self {
            federated_root,
            source_root,
            exceptions: Vec::new(),
            wildcard: true,
        }
    }

    /// Exclude `relative` (taken below the source root) and everything under it.
    pub fn with_exception(mut self, relative: &[String]) -> Self {
        self.exceptions.push(self.source_root.join(relative));
        self
    }

    pub(crate) fn without_wildcard(mut self) -> Self {
        self.wildcard = false;
        self
    }

    /// Excluded source paths, rooted at the source root.
    pub fn exceptions(&self) -> &[Path] {
        &self.exceptions
    }

    fn is_excluded(&self, source_path: &Path) -> bool {
        self.exceptions.iter().any(|e| e.is_at_or_above(source_path))
    }
}

// ============================================================================
// RULE
// ============================================================================

/// A compiled projection rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Rule {
    Path(PathRule),
    Offset(OffsetRule),
}

impl Rule {
    pub fn offset(federated_root: Path, source_root: Path) -> Self {
        Rule::Offset(OffsetRule::new(federated_root, source_root))
    }

    pub fn wildcard(federated_root: Path, source_root: Path) -> Self {
        Rule::Path(PathRule::new(federated_root, source_root))
    }

    /// Federated path at which the rule is mounted.
    pub fn federated_root(&self) -> &Path {
        match self {
            Rule::Path(rule) => &rule.federated_root,
            Rule::Offset(rule) => &rule.federated_root,
        }
    }

    pub fn source_root(&self) -> &Path {
        match self {
            Rule::Path(rule) => &rule.source_root,
            Rule::Offset(rule) => &rule.source_root,
        }
    }

    pub fn is_path_rule(&self) -> bool {
        matches!(self, Rule::Path(_))
    }

    /// Source path for a federated path, or `None` when the rule does not
    /// apply, the result would leave the source subtree, or it is excluded.
    pub fn translate_to_source(&self, federated: &Path) -> Option<Path> {
        match self {
            Rule::Offset(rule) => rebase(federated, &rule.federated_root, &rule.source_root),
            Rule::Path(rule) => rebase(federated, &rule.federated_root, &rule.source_root)
                .filter(|source| !rule.is_excluded(source)),
        }
    }

    /// Federated path for a source path; the inverse of
    /// [`translate_to_source`](Self::translate_to_source).
    pub fn translate_to_federated(&self, source: &Path) -> Option<Path> {
        let source = source.normalized()?;
        match self {
            Rule::Offset(rule) => rebase(&source, &rule.source_root, &rule.federated_root),
            Rule::Path(rule) if rule.is_excluded(&source) => None,
            Rule::Path(rule) => rebase(&source, &rule.source_root, &rule.federated_root),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Offset(rule) => write!(f, "{} => {}", rule.federated_root, rule.source_root),
            Rule::Path(rule) => {
                if rule.wildcard && rule.federated_root.is_root() {
                    write!(f, "/*")?;
                } else if rule.wildcard {
                    write!(f, "{}/*", rule.federated_root)?;
                } else {
                    write!(f, "{}", rule.federated_root)?;
                }
                write!(f, " => {}", rule.source_root)?;
                for exception in &rule.exceptions {
                    if let Some(relative) = exception.relative_to(&rule.source_root) {
                        write!(f, " $ {}", relative.join("/"))?;
                    }
                }
                Ok(())
            }
        }
    }
}
