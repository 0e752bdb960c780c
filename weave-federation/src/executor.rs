//! The federating executor.
//!
//! One executor serves one logical operation. It captures "now" once at
//! construction, opens at most one connection per source through its
//! [`ConnectionManager`], and closes them all when the operation ends.
//!
//! # Reads
//!
//! ```text
//! cache lookup ──fresh──────────────────────────────────────────> merged node
//!      │ missing / expired (unexpired contributions kept)
//!      v
//! fan-out: one contribution per source projection, in order
//!      │
//!      v
//! merge (first projection wins) ──all empty──> PathNotFound
//!      │
//!      v
//! write merged node and merge plan through the cache projection
//! ```
//!
//! # Writes
//!
//! A write goes to exactly one source: the first projection whose rules
//! translate the target. Afterwards the affected cache entries are dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use weave_connector::{
    Command, CommandOutcome, ConflictBehavior, Connection, ConnectionFactory, NodeData,
};
use weave_core::{
    CachePolicy, CancellationToken, ChildRef, Expiration, FederationError, Location, Path,
    Properties, Property, SourceError, SourceResult, Timestamp, WeaveError, WeaveResult,
};

use crate::connection_manager::ConnectionManager;
use crate::contribution::{Contribution, ContributionKind};
use crate::merge::{merge_contributions, MergePlan, MergedNode, MERGE_PLAN_PROPERTY};
use crate::policy::PolicyResolver;
use crate::projection::Projection;
use crate::projection_set::SourceProjectionSet;

// ============================================================================
// OPTIONS AND RESULTS
// ============================================================================

/// Per-operation executor settings.
#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    /// Read source projections on scoped worker threads.
    pub parallel_fan_out: bool,
    /// Checked before every source call.
    pub cancellation: CancellationToken,
    /// Policies that beat everything else for the named sources.
    pub policy_overrides: HashMap<String, CachePolicy>,
    /// Fixed "now" for the operation; the wall clock when unset.
    pub now: Option<Timestamp>,
}

impl ExecutorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parallel_fan_out(mut self, enabled: bool) -> Self {
        self.parallel_fan_out = enabled;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_policy_override(mut self, source_name: impl Into<String>, policy: CachePolicy) -> Self {
        self.policy_overrides.insert(source_name.into(), policy);
        self
    }

    pub fn with_now(mut self, now: Timestamp) -> Self {
        self.now = Some(now);
        self
    }
}

/// Outcome of one federated command.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub outcome: CommandOutcome,
    /// When the outcome stops being valid; `Never` for writes.
    pub expires_at: Expiration,
    /// True when every node in the outcome came from a fresh cache entry.
    pub from_cache: bool,
}

/// A merged node and whether the cache alone produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct FederatedRead {
    pub node: MergedNode,
    pub expires_at: Expiration,
    pub from_cache: bool,
}

fn source_failed(source_name: &str, path: &Path, error: SourceError) -> WeaveError {
    match error {
        SourceError::Cancelled { .. } => FederationError::Cancelled.into(),
        error => FederationError::SourceFailed {
            source_name: source_name.to_string(),
            path: path.clone(),
            error,
        }
        .into(),
    }
}

fn normalized_path(location: &Location) -> Result<Path, FederationError> {
    location
        .path()
        .normalized()
        .ok_or_else(|| FederationError::PathNotFound {
            path: location.path().clone(),
        })
}

fn to_node_data(node: &MergedNode) -> NodeData {
    NodeData {
        location: node.location.clone(),
        children: node.children.clone(),
        properties: node.properties.clone(),
        cache_policy: None,
    }
}

// ============================================================================
// CONTRIBUTION READER
// ============================================================================

/// Reads one projection's contribution through an already-open connection.
///
/// Shared by the sequential and the parallel fan-out.
struct ContributionReader<'a> {
    connections: &'a ConnectionManager,
    policies: &'a PolicyResolver,
    cancellation: &'a CancellationToken,
    now: Timestamp,
}

impl ContributionReader<'_> {
    fn read(
        &self,
        projection: &Projection,
        federated: &Path,
        source_paths: &[Path],
    ) -> WeaveResult<Contribution> {
        let name = projection.source_name();
        let connection = self
            .connections
            .connection(name, projection.workspace())
            .ok_or_else(|| {
            source_failed(
                name,
                federated,
                SourceError::ConnectionClosed {
                    source_name: name.to_string(),
                },
            )
        })?;

        let mut found: Option<(Location, Vec<ChildRef>, Properties, Expiration)> = None;
        for source_path in source_paths {
            if self.cancellation.is_cancelled() {
                return Err(FederationError::Cancelled.into());
            }
            let command = Command::ReadNode {
                at: Location::new(source_path.clone()),
            };
            let node = match connection.execute(&command) {
                Ok(CommandOutcome::Node(node)) => node,
                Ok(_) => {
                    return Err(source_failed(
                        name,
                        federated,
                        SourceError::Unsupported {
                            source_name: name.to_string(),
                            operation: command.name().to_string(),
                            reason: "source answered with something other than a node".to_string(),
                        },
                    ))
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(source_failed(name, federated, e)),
            };

            let expires_at = self.policies.expiration(
                name,
                node.cache_policy,
                connection.default_cache_policy(),
                self.now,
            );
            let children = federated_children(projection, federated, &node);
            if let Some((_, merged_children, merged_properties, merged_expiration)) = found.as_mut() {
                for child in children {
                    if !merged_children.iter().any(|c| c.name == child.name) {
                        merged_children.push(child);
                    }
                }
                for (key, value) in node.properties {
                    merged_properties.entry(key).or_insert(value);
                }
                *merged_expiration = (*merged_expiration).min(expires_at);
                continue;
            }
            found = Some((node.location, children, node.properties, expires_at));
        }

        tracing::trace!(
            source = %name,
            path = %federated,
            found = found.is_some(),
            "Loaded contribution"
        );
        Ok(match found {
            Some((location, children, properties, expires_at)) => {
                Contribution::from_node(name, location, children, properties, expires_at)
            }
            None => Contribution::empty(name),
        })
    }
}

/// Children of a source node, in federated form.
///
/// A source child may map back through several rules; the translation that
/// lands directly below `federated` is used. Children with no such
/// translation (for example ones excluded by a rule exception) are dropped.
fn federated_children(projection: &Projection, federated: &Path, node: &NodeData) -> Vec<ChildRef> {
    node.children
        .iter()
        .filter_map(|child| {
            let source_child = node.path().child(&child.name).ok()?;
            let federated_child = projection
                .translate_child_locations(&source_child)
                .into_iter()
                .find(|candidate| candidate.parent().as_ref() == Some(federated))?;
            Some(ChildRef {
                name: federated_child.last_segment()?.to_string(),
                id: child.id,
            })
        })
        .collect()
}

/// Create `path` and its missing ancestors in the cache source, in one batch.
fn ensure_cache_path(connection: &dyn Connection, path: &Path) -> SourceResult<()> {
    let commands: Vec<Command> = path
        .ancestors()
        .into_iter()
        .skip(1)
        .chain(std::iter::once(path.clone()))
        .filter_map(|ancestor| {
            let name = ancestor.last_segment()?.to_string();
            Some(Command::CreateNode {
                under: Location::new(ancestor.parent()?),
                name,
                properties: Vec::new(),
                conflict: ConflictBehavior::DoNotReplace,
            })
        })
        .collect();
    if !commands.is_empty() {
        connection.execute_batch(&commands)?;
    }
    Ok(())
}

/// The federated form of a path a write touched in the source.
///
/// When several rules map it back, the one at or below `anchor` wins.
fn written_location(projection: &Projection, written: &Location, anchor: &Path) -> Option<Location> {
    let candidates = projection.translate_child_locations(written.path());
    let path = candidates
        .iter()
        .find(|candidate| anchor.is_at_or_above(candidate))
        .or_else(|| candidates.first())?
        .clone();
    Some(match written.id() {
        Some(id) => Location::new(path).with_id(id),
        None => Location::new(path),
    })
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// Executes commands against the federated namespace for one operation.
///
/// Not shareable between operations: obtain a fresh executor per operation.
pub struct FederatingExecutor {
    projections: Arc<SourceProjectionSet>,
    connections: ConnectionManager,
    policies: PolicyResolver,
    options: ExecutorOptions,
    now: Timestamp,
}

impl std::fmt::Debug for FederatingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatingExecutor")
            .field("sources", &self.projections.source_names())
            .field("connections", &self.connections)
            .field("now", &self.now)
            .finish()
    }
}

impl FederatingExecutor {
    pub fn new(
        projections: Arc<SourceProjectionSet>,
        factory: Arc<dyn ConnectionFactory>,
        options: ExecutorOptions,
    ) -> Self {
        let now = options.now.unwrap_or_else(Utc::now);
        let policies = PolicyResolver::new(&projections, options.policy_overrides.clone());
        let connections =
            ConnectionManager::new(factory).with_cancellation(options.cancellation.clone());
        Self {
            projections,
            connections,
            policies,
            options,
            now,
        }
    }

    /// The instant every expiration in this operation is computed from.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn projections(&self) -> &SourceProjectionSet {
        &self.projections
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// End the operation: close every connection it opened.
    pub fn close(&mut self) {
        self.connections.close();
    }

    fn check_cancelled(&self) -> Result<(), FederationError> {
        if self.options.cancellation.is_cancelled() {
            return Err(FederationError::Cancelled);
        }
        Ok(())
    }

    /// Execute one command.
    pub fn execute(&mut self, command: &Command) -> WeaveResult<ExecutionResult> {
        self.check_cancelled()?;
        tracing::debug!(
            command = command.name(),
            path = %command.target().path(),
            "Executing federated command"
        );
        match command {
            Command::ReadNode { at } => {
                let read = self.read(at)?;
                Ok(ExecutionResult {
                    outcome: CommandOutcome::Node(to_node_data(&read.node)),
                    expires_at: read.expires_at,
                    from_cache: read.from_cache,
                })
            }
            Command::ReadChildren { of } => {
                let read = self.read(of)?;
                Ok(ExecutionResult {
                    outcome: CommandOutcome::Children {
                        location: read.node.location,
                        children: read.node.children,
                    },
                    expires_at: read.expires_at,
                    from_cache: read.from_cache,
                })
            }
            Command::ReadProperties { at } => {
                let read = self.read(at)?;
                Ok(ExecutionResult {
                    outcome: CommandOutcome::Properties {
                        location: read.node.location,
                        properties: read.node.properties,
                    },
                    expires_at: read.expires_at,
                    from_cache: read.from_cache,
                })
            }
            Command::ReadSubtree { at, max_depth } => self.read_subtree(at, *max_depth),
            _ => self.write(command),
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read the merged node at `location`, using and refreshing the cache.
    pub fn read(&mut self, location: &Location) -> WeaveResult<FederatedRead> {
        let path = normalized_path(location)?;
        let location = location.with_path(path.clone());
        let projections = Arc::clone(&self.projections);
        let strategy = projections.merge_strategy();
        let current_sources = projections.source_names();

        let mut reusable = HashMap::new();
        if let Some(plan) = self.read_cache(&path)? {
            let same_sources = plan.source_names() == current_sources;
            if same_sources && !plan.is_expired(self.now) {
                if let Some(node) =
                    merge_contributions(&location, plan.contributions.clone(), strategy)
                {
                    tracing::debug!(path = %path, "Served from cache");
                    return Ok(FederatedRead {
                        node,
                        expires_at: plan.expires_at,
                        from_cache: true,
                    });
                }
            }
            for contribution in plan.contributions {
                let keep = contribution.kind() == ContributionKind::Node
                    && !contribution.is_expired(self.now)
                    && current_sources.contains(&contribution.source_name());
                if keep {
                    reusable.insert(contribution.source_name().to_string(), contribution);
                }
            }
        }

        let contributions = self.load_contributions_reusing(&location, reusable)?;
        let node = merge_contributions(&location, contributions, strategy)
            .ok_or_else(|| FederationError::PathNotFound { path: path.clone() })?;
        self.write_cache(&node)?;
        Ok(FederatedRead {
            expires_at: node.expires_at,
            node,
            from_cache: false,
        })
    }

    /// One contribution per source projection, in projection order, without
    /// consulting the cache.
    pub fn load_contributions(&mut self, location: &Location) -> WeaveResult<Vec<Contribution>> {
        let path = normalized_path(location)?;
        self.load_contributions_reusing(&location.with_path(path), HashMap::new())
    }

    fn load_contributions_reusing(
        &mut self,
        location: &Location,
        mut reusable: HashMap<String, Contribution>,
    ) -> WeaveResult<Vec<Contribution>> {
        enum Slot {
            Ready(Contribution),
            Pending(Vec<Path>),
        }

        let path = location.path().clone();
        let projections = Arc::clone(&self.projections);

        let mut slots = Vec::with_capacity(projections.len());
        for projection in projections.source_projections() {
            let name = projection.source_name();
            if let Some(contribution) = reusable.remove(name) {
                tracing::trace!(source = %name, path = %path, "Reusing cached contribution");
                slots.push(Slot::Ready(contribution));
                continue;
            }
            let source_paths = projection.project(&path);
            if source_paths.is_empty() {
                let names = projection.placeholder_children(&path);
                let contribution = if names.is_empty() {
                    Contribution::empty(name)
                } else {
                    Contribution::placeholder(name, names)
                };
                slots.push(Slot::Ready(contribution));
                continue;
            }
            self.check_cancelled()?;
            self.connections
                .get_connection(name, projection.workspace())
                .map_err(|e| source_failed(name, &path, e))?;
            slots.push(Slot::Pending(source_paths));
        }

        let reader = ContributionReader {
            connections: &self.connections,
            policies: &self.policies,
            cancellation: &self.options.cancellation,
            now: self.now,
        };
        let pending = slots
            .iter()
            .filter(|s| matches!(s, Slot::Pending(_)))
            .count();
        let work = slots.into_iter().zip(projections.source_projections());

        if !self.options.parallel_fan_out || pending < 2 {
            return work
                .map(|(slot, projection)| match slot {
                    Slot::Ready(contribution) => Ok(contribution),
                    Slot::Pending(source_paths) => reader.read(projection, &path, &source_paths),
                })
                .collect();
        }

        tracing::debug!(path = %path, workers = pending, "Parallel fan-out");
        let results: Vec<WeaveResult<Contribution>> = thread::scope(|scope| {
            let reader = &reader;
            let path = &path;
            let handles: Vec<_> = work
                .map(|(slot, projection)| match slot {
                    Slot::Ready(contribution) => Err(contribution),
                    Slot::Pending(source_paths) => Ok(scope
                        .spawn(move || reader.read(projection, path, &source_paths))),
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle {
                    Err(contribution) => Ok(contribution),
                    Ok(worker) => worker
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic)),
                })
                .collect()
        });
        results.into_iter().collect()
    }

    fn read_subtree(&mut self, location: &Location, max_depth: usize) -> WeaveResult<ExecutionResult> {
        let root = self.read(location)?;
        let root_path = root.node.path().clone();
        let mut expires_at = root.expires_at;
        let mut from_cache = root.from_cache;

        let mut nodes: HashMap<Path, MergedNode> = HashMap::new();
        nodes.insert(root_path.clone(), root.node);
        let mut queue = VecDeque::from([(root_path.clone(), 0usize)]);
        while let Some((path, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let child_names: Vec<String> = nodes
                .get(&path)
                .map(|n| n.children.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default();
            for name in child_names {
                let child_path = path.child(&name)?;
                match self.read(&Location::new(child_path.clone())) {
                    Ok(read) => {
                        expires_at = expires_at.min(read.expires_at);
                        from_cache &= read.from_cache;
                        nodes.insert(child_path.clone(), read.node);
                        queue.push_back((child_path, depth + 1));
                    }
                    Err(e) if e.is_path_not_found() => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        let mut ordered = Vec::with_capacity(nodes.len());
        let mut stack = vec![root_path];
        while let Some(path) = stack.pop() {
            let Some(node) = nodes.remove(&path) else {
                continue;
            };
            for child in node.children.iter().rev() {
                if let Ok(child_path) = path.child(&child.name) {
                    stack.push(child_path);
                }
            }
            ordered.push(to_node_data(&node));
        }

        Ok(ExecutionResult {
            outcome: CommandOutcome::Subtree(ordered),
            expires_at,
            from_cache,
        })
    }

    // ========================================================================
    // CACHE
    // ========================================================================

    /// The merge plan stored for `path` in the cache, if any.
    fn read_cache(&mut self, path: &Path) -> WeaveResult<Option<MergePlan>> {
        let projections = Arc::clone(&self.projections);
        let Some(cache) = projections.cache_projection() else {
            return Ok(None);
        };
        let Some(cache_path) = cache.primary_path(path) else {
            return Ok(None);
        };
        let name = cache.source_name();
        self.check_cancelled()?;
        let connection = self
            .connections
            .get_connection(name, cache.workspace())
            .map_err(|e| source_failed(name, path, e))?;

        let command = Command::ReadProperties {
            at: Location::new(cache_path.clone()),
        };
        let properties = match connection.execute(&command) {
            Ok(CommandOutcome::Properties { properties, .. }) => properties,
            Ok(_) => return Ok(None),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(source_failed(name, path, e)),
        };
        match MergePlan::from_properties(&properties, &cache_path) {
            Ok(plan) => Ok(plan),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Ignoring unreadable merge plan");
                Ok(None)
            }
        }
    }

    /// Store the merged node, its merge plan, and a stub per child under the
    /// cache projection, as one batch.
    fn write_cache(&mut self, node: &MergedNode) -> WeaveResult<()> {
        let projections = Arc::clone(&self.projections);
        let (Some(cache), Some(policy)) = (projections.cache_projection(), projections.cache_policy())
        else {
            return Ok(());
        };
        let Some(cache_path) = cache.primary_path(node.path()) else {
            return Ok(());
        };
        let name = cache.source_name();

        let expires_at = Expiration::earliest([node.expires_at, policy.expires_at(self.now)]);
        let plan = MergePlan::new(self.now, expires_at, node.contributions.clone());
        let mut properties: Vec<Property> = node
            .properties
            .iter()
            .map(|(key, value)| Property::new(key.clone(), value.clone()))
            .collect();
        properties.push(Property::new(
            MERGE_PLAN_PROPERTY,
            plan.to_property_value(&cache_path)?,
        ));

        let mut commands = Vec::with_capacity(node.children.len() + 1);
        let parent = cache_path.parent();
        match (&parent, cache_path.last_segment()) {
            (Some(parent), Some(child_name)) => commands.push(Command::CreateNode {
                under: Location::new(parent.clone()),
                name: child_name.to_string(),
                properties,
                conflict: ConflictBehavior::Update,
            }),
            _ => commands.push(Command::SetProperties {
                on: Location::new(cache_path.clone()),
                properties,
            }),
        }
        commands.extend(node.children.iter().map(|child| Command::CreateNode {
            under: Location::new(cache_path.clone()),
            name: child.name.clone(),
            properties: Vec::new(),
            conflict: ConflictBehavior::DoNotReplace,
        }));

        self.check_cancelled()?;
        let connection = self
            .connections
            .get_connection(name, cache.workspace())
            .map_err(|e| source_failed(name, node.path(), e))?;
        let fail = |e: SourceError| source_failed(name, node.path(), e);
        match (connection.execute_batch(&commands), &parent) {
            (Ok(_), _) => {}
            (Err(e), Some(parent)) if e.is_not_found() => {
                ensure_cache_path(connection, parent).map_err(fail)?;
                connection.execute_batch(&commands).map_err(fail)?;
            }
            (Err(e), _) => return Err(fail(e)),
        }

        tracing::debug!(
            path = %node.path(),
            cache_path = %cache_path,
            children = node.children.len(),
            "Cached merged node"
        );
        Ok(())
    }

    /// Drop cached subtrees and merge plans. Missing cache entries are fine.
    fn invalidate_cache(&mut self, subtrees: &[Path], plans: &[Path]) -> WeaveResult<()> {
        let projections = Arc::clone(&self.projections);
        let Some(cache) = projections.cache_projection() else {
            return Ok(());
        };

        let mut commands = Vec::new();
        for path in subtrees {
            if let Some(cache_path) = cache.primary_path(path) {
                commands.push(Command::DeleteSubtree {
                    at: Location::new(cache_path),
                });
            }
        }
        for path in plans {
            if let Some(cache_path) = cache.primary_path(path) {
                commands.push(Command::RemoveProperties {
                    from: Location::new(cache_path),
                    names: vec![MERGE_PLAN_PROPERTY.to_string()],
                });
            }
        }
        if commands.is_empty() {
            return Ok(());
        }

        let name = cache.source_name();
        self.check_cancelled()?;
        let connection = self
            .connections
            .get_connection(name, cache.workspace())
            .map_err(|e| source_failed(name, &Path::root(), e))?;
        for command in &commands {
            match connection.execute(command) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(source_failed(name, command.target().path(), e)),
            }
        }
        tracing::trace!(invalidated = commands.len(), "Invalidated cache entries");
        Ok(())
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    fn write(&mut self, command: &Command) -> WeaveResult<ExecutionResult> {
        let projections = Arc::clone(&self.projections);
        let target = normalized_path(command.target())?;
        let Some((projection, source_path)) = projections.authoritative(&target) else {
            return Err(FederationError::PathNotFound { path: target }.into());
        };
        let name = projection.source_name();

        if projection.is_read_only() {
            return Err(FederationError::Unsupported {
                operation: command.name().to_string(),
                path: target,
                reason: format!("projection for source '{}' is read-only", name),
            }
            .into());
        }

        let mut anchor = target.parent().unwrap_or_else(Path::root);
        let source_command = match command {
            Command::MoveSubtree { into, .. } => {
                let into_path = normalized_path(into)?;
                let into_source = projections
                    .authoritative(&into_path)
                    .filter(|(p, _)| p.source_name() == name)
                    .map(|(_, path)| path);
                let Some(into_source) = into_source else {
                    return Err(FederationError::Unsupported {
                        operation: command.name().to_string(),
                        path: target,
                        reason: format!("{} is not in source '{}'", into_path, name),
                    }
                    .into());
                };
                anchor = into_path;
                Command::MoveSubtree {
                    from: Location::new(source_path),
                    into: Location::new(into_source),
                }
            }
            other => other.retarget(Location::new(source_path)),
        };

        self.check_cancelled()?;
        let connection = self
            .connections
            .get_connection(name, projection.workspace())
            .map_err(|e| source_failed(name, &target, e))?;
        let outcome = match connection.execute(&source_command) {
            Ok(outcome) => outcome,
            Err(e) if e.is_not_found() => {
                return Err(FederationError::PathNotFound { path: target }.into())
            }
            Err(e) => return Err(source_failed(name, &target, e)),
        };
        tracing::debug!(
            source = %name,
            command = command.name(),
            path = %target,
            "Forwarded write"
        );

        let written = outcome
            .location()
            .and_then(|location| written_location(projection, location, &anchor))
            .unwrap_or_else(|| Location::new(target.clone()));

        self.invalidate_after_write(command, &target)?;
        Ok(ExecutionResult {
            outcome: CommandOutcome::Written { location: written },
            expires_at: Expiration::Never,
            from_cache: false,
        })
    }

    fn invalidate_after_write(&mut self, command: &Command, target: &Path) -> WeaveResult<()> {
        let parent: Vec<Path> = target.parent().into_iter().collect();
        match command {
            Command::CreateNode { .. }
            | Command::SetProperties { .. }
            | Command::RemoveProperties { .. } => self.invalidate_cache(&[], &[target.clone()]),
            Command::DeleteSubtree { .. } | Command::RenameNode { .. } => {
                self.invalidate_cache(&[target.clone()], &parent)
            }
            Command::MoveSubtree { into, .. } => {
                let mut plans = parent;
                plans.push(normalized_path(into)?);
                self.invalidate_cache(&[target.clone()], &plans)
            }
            _ => Ok(()),
        }
    }
}
