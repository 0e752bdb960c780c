//! A source bound into the federated namespace by an ordered list of rules.

use std::fmt;

use weave_core::{ConfigError, Path, ProjectionConfig};

use crate::parser::ProjectionParser;
use crate::rule::Rule;

/// A named source, optionally one workspace inside it, plus its ordered
/// translation rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    source_name: String,
    workspace: Option<String>,
    rules: Vec<Rule>,
    read_only: bool,
    simple: bool,
}

impl Projection {
    /// Build a projection; at least one rule is required.
    pub fn new(source_name: impl Into<String>, rules: Vec<Rule>) -> Result<Self, ConfigError> {
        let source_name = source_name.into();
        if rules.is_empty() {
            return Err(ConfigError::EmptyProjection { source_name });
        }
        let simple = Self::compute_simple(&rules);
        Ok(Self {
            source_name,
            workspace: None,
            rules,
            read_only: false,
            simple,
        })
    }

    /// Compile a projection from its configuration entry.
    pub fn from_config(
        config: &ProjectionConfig,
        parser: &ProjectionParser,
    ) -> Result<Self, ConfigError> {
        let rules = parser
            .parse_all(config.rules.as_slice())
            .map_err(|error| ConfigError::InvalidRule {
                source_name: config.source.clone(),
                error,
            })?;
        Ok(Self::new(config.source.clone(), rules)?
            .with_workspace(config.workspace.clone())
            .with_read_only(config.read_only))
    }

    /// Bind the projection to a workspace; `None` is the source's default.
    pub fn with_workspace(mut self, workspace: Option<String>) -> Self {
        self.workspace = workspace;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn workspace(&self) -> Option<&str> {
        self.workspace.as_deref()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True when no two rules share or nest their federated roots, so each
    /// federated path is served by at most one rule.
    pub fn is_simple(&self) -> bool {
        self.simple
    }

    fn compute_simple(rules: &[Rule]) -> bool {
        rules.iter().enumerate().all(|(i, a)| {
            rules[i + 1..].iter().all(|b| {
                !a.federated_root().is_at_or_above(b.federated_root())
                    && !b.federated_root().is_at_or_above(a.federated_root())
            })
        })
    }

    /// Every source path the federated path maps to, distinct, in rule order.
    pub fn project(&self, federated: &Path) -> Vec<Path> {
        let mut paths: Vec<Path> = Vec::new();
        for rule in &self.rules {
            if let Some(path) = rule.translate_to_source(federated) {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths
    }

    /// Translation by the first matching rule.
    pub fn primary_path(&self, federated: &Path) -> Option<Path> {
        self.rules
            .iter()
            .find_map(|rule| rule.translate_to_source(federated))
    }

    /// True when some rule translates the federated path.
    pub fn covers(&self, federated: &Path) -> bool {
        self.primary_path(federated).is_some()
    }

    /// Federated path for a path found in the source, by the first rule that
    /// maps it back.
    pub fn translate_child_location(&self, source: &Path) -> Option<Path> {
        self.rules
            .iter()
            .find_map(|rule| rule.translate_to_federated(source))
    }

    /// Every federated path a source path maps back to, distinct, in rule
    /// order. Rules that mount one source root at several federated roots
    /// yield one path each.
    pub fn translate_child_locations(&self, source: &Path) -> Vec<Path> {
        let mut paths: Vec<Path> = Vec::new();
        for rule in &self.rules {
            if let Some(path) = rule.translate_to_federated(source) {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths
    }

    /// Federated roots of the rules, deduplicated, in rule order.
    pub fn top_level_paths(&self) -> Vec<Path> {
        let mut paths: Vec<Path> = Vec::new();
        for rule in &self.rules {
            if !paths.contains(rule.federated_root()) {
                paths.push(rule.federated_root().clone());
            }
        }
        paths
    }

    /// Names of the children of `federated` that lead toward a top-level path
    /// mounted strictly below it.
    ///
    /// A projection that does not translate `/` but mounts `/a` and `/b`
    /// yields `["a", "b"]` at `/`.
    pub fn placeholder_children(&self, federated: &Path) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for top in self.top_level_paths() {
            if !federated.is_ancestor_of(&top) {
                continue;
            }
            if let Some(name) = top.segments().get(federated.len()) {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source_name)?;
        if let Some(workspace) = &self.workspace {
            write!(f, "@{}", workspace)?;
        }
        write!(f, ":")?;
        for (i, rule) in self.rules.iter().enumerate() {
            let sep = if i == 0 { " " } else { "; " };
            write!(f, "{}{}", sep, rule)?;
        }
        if self.read_only {
            write!(f, " (read-only)")?;
        }
        Ok(())
    }
}
