//! In-memory repository source.
//!
//! One [`InMemoryRepository`] holds a node tree behind a single `RwLock`.
//! Read transactions share the lock; a write transaction holds it exclusively
//! from start to commit or rollback and works on its own copy of the tree, so
//! no reader ever observes a half-applied change. Committing swaps the copy in
//! and appends a record to the transaction log. Dropping an uncommitted write
//! transaction discards the copy and releases the lock.
//!
//! The transaction log keeps the most recent [`DEFAULT_LOG_CAPACITY`] records
//! unless configured otherwise; older records fall off the front.
//!
//! An [`InMemorySource`] owns a default repository plus any number of named
//! workspaces, each its own repository.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use weave_core::{
    new_node_id, CachePolicy, ChildRef, Location, NodeId, Path, Properties, Property,
    PropertyValue, SourceError, SourceResult, Timestamp,
};

use crate::command::{Command, CommandOutcome, ConflictBehavior, NodeData};
use crate::connection::{Connection, RepositorySource};

/// Transaction records kept per repository by default.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

// ============================================================================
// NODE TREE
// ============================================================================

/// One stored node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub properties: Properties,
    /// Child names in insertion order.
    pub children: Vec<String>,
}

impl NodeRecord {
    fn new() -> Self {
        Self {
            id: new_node_id(),
            properties: Properties::new(),
            children: Vec::new(),
        }
    }
}

/// Tree failures, converted to [`SourceError`] by the owning repository.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TreeError {
    Missing(Path),
    Exists(Path),
    Invalid { operation: &'static str, reason: String },
}

/// An immutable-once-committed snapshot of every node, keyed by path.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTree {
    nodes: HashMap<Path, NodeRecord>,
}

impl Default for NodeTree {
    fn default() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(Path::root(), NodeRecord::new());
        Self { nodes }
    }
}

impl NodeTree {
    pub fn get(&self, path: &Path) -> Option<&NodeRecord> {
        self.nodes.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Deepest existing node at or above `path`.
    pub fn lowest_existing(&self, path: &Path) -> Path {
        let mut current = path.clone();
        while !self.nodes.contains_key(&current) {
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    fn get_mut(&mut self, path: &Path) -> Result<&mut NodeRecord, TreeError> {
        self.nodes
            .get_mut(path)
            .ok_or_else(|| TreeError::Missing(path.clone()))
    }

    fn child_path(parent: &Path, name: &str, operation: &'static str) -> Result<Path, TreeError> {
        parent.child(name).map_err(|e| TreeError::Invalid {
            operation,
            reason: e.to_string(),
        })
    }

    fn node_data(&self, path: &Path) -> Result<NodeData, TreeError> {
        let record = self
            .nodes
            .get(path)
            .ok_or_else(|| TreeError::Missing(path.clone()))?;
        let children = record
            .children
            .iter()
            .map(|name| {
                let id = path
                    .child(name)
                    .ok()
                    .and_then(|child| self.nodes.get(&child))
                    .map(|child| child.id);
                ChildRef {
                    name: name.clone(),
                    id,
                }
            })
            .collect();
        Ok(NodeData {
            location: Location::new(path.clone()).with_id(record.id),
            children,
            properties: record.properties.clone(),
            cache_policy: None,
        })
    }

    /// The node and its descendants to `max_depth`, in pre-order.
    fn subtree(&self, path: &Path, max_depth: usize) -> Result<Vec<NodeData>, TreeError> {
        let mut nodes = Vec::new();
        let mut stack = vec![(path.clone(), 0usize)];
        while let Some((current, depth)) = stack.pop() {
            let data = self.node_data(&current)?;
            if depth < max_depth {
                for child in data.children.iter().rev() {
                    stack.push((Self::child_path(&current, &child.name, "read-subtree")?, depth + 1));
                }
            }
            nodes.push(data);
        }
        Ok(nodes)
    }

    /// Create every missing node along `path`.
    fn ensure_path(&mut self, path: &Path) -> NodeId {
        for ancestor in path.ancestors().into_iter().skip(1).chain(std::iter::once(path.clone())) {
            if self.nodes.contains_key(&ancestor) {
                continue;
            }
            if let (Some(parent), Some(name)) = (ancestor.parent(), ancestor.last_segment()) {
                let name = name.to_string();
                if let Some(parent_record) = self.nodes.get_mut(&parent) {
                    parent_record.children.push(name);
                }
            }
            self.nodes.insert(ancestor, NodeRecord::new());
        }
        self.nodes.get(path).map(|r| r.id).unwrap_or_else(new_node_id)
    }

    fn create(
        &mut self,
        parent: &Path,
        name: &str,
        properties: &[Property],
        conflict: ConflictBehavior,
    ) -> Result<Path, TreeError> {
        if !self.nodes.contains_key(parent) {
            return Err(TreeError::Missing(parent.clone()));
        }
        let path = Self::child_path(parent, name, "create-node")?;

        if self.nodes.contains_key(&path) {
            match conflict {
                ConflictBehavior::DoNotReplace => return Ok(path),
                ConflictBehavior::Update => {
                    let record = self.get_mut(&path)?;
                    for property in properties {
                        record
                            .properties
                            .insert(property.name.clone(), property.value.clone());
                    }
                    return Ok(path);
                }
                ConflictBehavior::Replace => {
                    self.remove_below(&path);
                    let mut record = NodeRecord::new();
                    record.properties = to_properties(properties);
                    self.nodes.insert(path.clone(), record);
                    return Ok(path);
                }
            }
        }

        let mut record = NodeRecord::new();
        record.properties = to_properties(properties);
        self.nodes.insert(path.clone(), record);
        self.get_mut(parent)?.children.push(name.to_string());
        Ok(path)
    }

    /// Remove every node strictly below `path`.
    fn remove_below(&mut self, path: &Path) {
        self.nodes.retain(|p, _| !path.is_ancestor_of(p));
    }

    fn delete(&mut self, path: &Path) -> Result<(), TreeError> {
        if !self.nodes.contains_key(path) {
            return Err(TreeError::Missing(path.clone()));
        }
        self.remove_below(path);
        match (path.parent(), path.last_segment()) {
            (Some(parent), Some(name)) => {
                self.nodes.remove(path);
                let name = name.to_string();
                self.get_mut(&parent)?.children.retain(|c| *c != name);
            }
            _ => {
                // Deleting the root empties it.
                let root = self.get_mut(path)?;
                root.children.clear();
                root.properties.clear();
            }
        }
        Ok(())
    }

    /// Re-key `from` and its descendants under `to`.
    fn rekey(&mut self, from: &Path, to: &Path) {
        let moved: Vec<Path> = self
            .nodes
            .keys()
            .filter(|p| from.is_at_or_above(p))
            .cloned()
            .collect();
        for old in moved {
            if let (Some(record), Some(rest)) = (self.nodes.remove(&old), old.relative_to(from)) {
                self.nodes.insert(to.join(rest), record);
            }
        }
    }

    fn move_into(&mut self, from: &Path, into: &Path) -> Result<Path, TreeError> {
        if !self.nodes.contains_key(from) {
            return Err(TreeError::Missing(from.clone()));
        }
        if !self.nodes.contains_key(into) {
            return Err(TreeError::Missing(into.clone()));
        }
        let (Some(old_parent), Some(name)) = (from.parent(), from.last_segment()) else {
            return Err(TreeError::Invalid {
                operation: "move-subtree",
                reason: "the root cannot be moved".to_string(),
            });
        };
        if from.is_at_or_above(into) {
            return Err(TreeError::Invalid {
                operation: "move-subtree",
                reason: format!("{} cannot be moved below itself", from),
            });
        }
        let name = name.to_string();
        let target = Self::child_path(into, &name, "move-subtree")?;
        if self.nodes.contains_key(&target) {
            return Err(TreeError::Exists(target));
        }
        self.rekey(from, &target);
        self.get_mut(&old_parent)?.children.retain(|c| *c != name);
        self.get_mut(into)?.children.push(name);
        Ok(target)
    }

    fn rename(&mut self, path: &Path, new_name: &str) -> Result<Path, TreeError> {
        if !self.nodes.contains_key(path) {
            return Err(TreeError::Missing(path.clone()));
        }
        let (Some(parent), Some(old_name)) = (path.parent(), path.last_segment()) else {
            return Err(TreeError::Invalid {
                operation: "rename-node",
                reason: "the root cannot be renamed".to_string(),
            });
        };
        let old_name = old_name.to_string();
        let target = Self::child_path(&parent, new_name, "rename-node")?;
        if target == *path {
            return Ok(target);
        }
        if self.nodes.contains_key(&target) {
            return Err(TreeError::Exists(target));
        }
        self.rekey(path, &target);
        for child in self.get_mut(&parent)?.children.iter_mut() {
            if *child == old_name {
                *child = new_name.to_string();
            }
        }
        Ok(target)
    }
}

fn to_properties(properties: &[Property]) -> Properties {
    properties
        .iter()
        .map(|p| (p.name.clone(), p.value.clone()))
        .collect()
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// Committed write, as recorded in the transaction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub sequence: u64,
    pub committed_at: Timestamp,
    /// One entry per applied change, e.g. `create-node /a/b`.
    pub changes: Vec<String>,
}

#[derive(Debug)]
struct RepositoryState {
    tree: Arc<NodeTree>,
    log: VecDeque<TransactionRecord>,
    log_capacity: usize,
    next_sequence: u64,
}

impl RepositoryState {
    fn append_log(&mut self, record: TransactionRecord) {
        self.log.push_back(record);
        while self.log.len() > self.log_capacity {
            self.log.pop_front();
        }
    }
}

/// Shared read access for the lifetime of the transaction.
pub struct ReadTransaction<'a> {
    guard: RwLockReadGuard<'a, RepositoryState>,
}

impl ReadTransaction<'_> {
    pub fn tree(&self) -> &NodeTree {
        &self.guard.tree
    }

    pub fn node(&self, path: &Path) -> Option<&NodeRecord> {
        self.guard.tree.get(path)
    }
}

/// Exclusive write access; changes apply to a private copy until commit.
pub struct WriteTransaction<'a> {
    source_name: &'a str,
    guard: RwLockWriteGuard<'a, RepositoryState>,
    working: NodeTree,
    changes: Vec<String>,
    committed: bool,
}

impl WriteTransaction<'_> {
    pub fn tree(&self) -> &NodeTree {
        &self.working
    }

    fn record(&mut self, operation: &str, path: &Path) {
        self.changes.push(format!("{} {}", operation, path));
    }

    fn fail(&self, error: TreeError) -> SourceError {
        match error {
            TreeError::Missing(path) => SourceError::NotFound {
                source_name: self.source_name.to_string(),
                lowest_existing: Some(self.working.lowest_existing(&path)),
                path,
            },
            TreeError::Exists(path) => SourceError::AlreadyExists {
                source_name: self.source_name.to_string(),
                path,
            },
            TreeError::Invalid { operation, reason } => SourceError::Unsupported {
                source_name: self.source_name.to_string(),
                operation: operation.to_string(),
                reason,
            },
        }
    }

    pub fn create_node(
        &mut self,
        parent: &Path,
        name: &str,
        properties: &[Property],
        conflict: ConflictBehavior,
    ) -> SourceResult<Path> {
        let path = self
            .working
            .create(parent, name, properties, conflict)
            .map_err(|e| self.fail(e))?;
        self.record("create-node", &path);
        Ok(path)
    }

    /// Create `path` and any missing ancestors.
    pub fn create_path(&mut self, path: &Path) -> NodeId {
        let id = self.working.ensure_path(path);
        self.record("create-path", path);
        id
    }

    /// Set one property, creating the node and its ancestors when missing.
    pub fn set_property(&mut self, path: &Path, name: &str, value: PropertyValue) {
        self.working.ensure_path(path);
        if let Ok(record) = self.working.get_mut(path) {
            record.properties.insert(name.to_string(), value);
        }
        self.record("set-property", path);
    }

    pub fn set_properties(&mut self, path: &Path, properties: &[Property]) -> SourceResult<()> {
        let record = match self.working.get_mut(path) {
            Ok(record) => record,
            Err(e) => return Err(self.fail(e)),
        };
        for property in properties {
            record
                .properties
                .insert(property.name.clone(), property.value.clone());
        }
        self.record("set-properties", path);
        Ok(())
    }

    pub fn remove_properties(&mut self, path: &Path, names: &[String]) -> SourceResult<()> {
        let record = match self.working.get_mut(path) {
            Ok(record) => record,
            Err(e) => return Err(self.fail(e)),
        };
        for name in names {
            record.properties.remove(name);
        }
        self.record("remove-properties", path);
        Ok(())
    }

    pub fn delete_subtree(&mut self, path: &Path) -> SourceResult<()> {
        self.working.delete(path).map_err(|e| self.fail(e))?;
        self.record("delete-subtree", path);
        Ok(())
    }

    pub fn move_subtree(&mut self, from: &Path, into: &Path) -> SourceResult<Path> {
        let target = self.working.move_into(from, into).map_err(|e| self.fail(e))?;
        self.record("move-subtree", &target);
        Ok(target)
    }

    pub fn rename_node(&mut self, path: &Path, new_name: &str) -> SourceResult<Path> {
        let target = self
            .working
            .rename(path, new_name)
            .map_err(|e| self.fail(e))?;
        self.record("rename-node", &target);
        Ok(target)
    }

    /// Publish the working tree and log the transaction.
    pub fn commit(mut self) -> u64 {
        let working = std::mem::take(&mut self.working);
        let changes = std::mem::take(&mut self.changes);
        let sequence = self.guard.next_sequence;
        self.guard.next_sequence += 1;
        self.guard.tree = Arc::new(working);
        self.guard.append_log(TransactionRecord {
            sequence,
            committed_at: Utc::now(),
            changes,
        });
        self.committed = true;
        tracing::debug!(source = %self.source_name, sequence, "Committed transaction");
        sequence
    }

    /// Discard every change. Equivalent to dropping the transaction.
    pub fn rollback(self) {}
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.changes.is_empty() {
            tracing::debug!(
                source = %self.source_name,
                discarded = self.changes.len(),
                "Rolled back transaction"
            );
        }
    }
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// A named in-memory node tree.
#[derive(Debug)]
pub struct InMemoryRepository {
    name: String,
    state: RwLock<RepositoryState>,
}

impl InMemoryRepository {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_log_capacity(name, DEFAULT_LOG_CAPACITY)
    }

    /// A repository that keeps at most `log_capacity` transaction records.
    pub fn with_log_capacity(name: impl Into<String>, log_capacity: usize) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(RepositoryState {
                tree: Arc::new(NodeTree::default()),
                log: VecDeque::new(),
                log_capacity,
                next_sequence: 1,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn poisoned(&self) -> SourceError {
        SourceError::LockPoisoned {
            source_name: self.name.clone(),
        }
    }

    pub fn read(&self) -> SourceResult<ReadTransaction<'_>> {
        let guard = self.state.read().map_err(|_| self.poisoned())?;
        Ok(ReadTransaction { guard })
    }

    pub fn write(&self) -> SourceResult<WriteTransaction<'_>> {
        let guard = self.state.write().map_err(|_| self.poisoned())?;
        let working = (*guard.tree).clone();
        Ok(WriteTransaction {
            source_name: &self.name,
            guard,
            working,
            changes: Vec::new(),
            committed: false,
        })
    }

    /// The latest committed tree. Later commits do not affect it.
    pub fn snapshot(&self) -> SourceResult<Arc<NodeTree>> {
        Ok(Arc::clone(&self.read()?.guard.tree))
    }

    /// The retained transaction records, oldest first.
    pub fn transaction_log(&self) -> SourceResult<Vec<TransactionRecord>> {
        Ok(self.read()?.guard.log.iter().cloned().collect())
    }

    /// Forget every record older than `sequence`. Returns how many were dropped.
    pub fn truncate_log_before(&self, sequence: u64) -> SourceResult<usize> {
        let mut state = self.state.write().map_err(|_| self.poisoned())?;
        let before = state.log.len();
        state.log.retain(|record| record.sequence >= sequence);
        Ok(before - state.log.len())
    }

    /// Sequence number the next commit will get.
    pub fn next_sequence(&self) -> SourceResult<u64> {
        Ok(self.read()?.guard.next_sequence)
    }

    /// Create `path` and its missing ancestors in one transaction.
    pub fn create_path(&self, path: &Path) -> SourceResult<NodeId> {
        let mut tx = self.write()?;
        let id = tx.create_path(path);
        tx.commit();
        Ok(id)
    }

    /// Set one property in its own transaction, creating the node if needed.
    pub fn set_property(
        &self,
        path: &Path,
        name: &str,
        value: impl Into<PropertyValue>,
    ) -> SourceResult<()> {
        let mut tx = self.write()?;
        tx.set_property(path, name, value.into());
        tx.commit();
        Ok(())
    }

    fn missing(&self, tree: &NodeTree, path: &Path) -> SourceError {
        SourceError::NotFound {
            source_name: self.name.clone(),
            path: path.clone(),
            lowest_existing: Some(tree.lowest_existing(path)),
        }
    }

    fn read_command(&self, command: &Command) -> SourceResult<CommandOutcome> {
        let tx = self.read()?;
        self.read_in(tx.tree(), command)
    }

    fn read_in(&self, tree: &NodeTree, command: &Command) -> SourceResult<CommandOutcome> {
        let path = command.target().path();
        let map_err = |e: TreeError| match e {
            TreeError::Missing(p) => self.missing(tree, &p),
            TreeError::Exists(p) => SourceError::AlreadyExists {
                source_name: self.name.clone(),
                path: p,
            },
            TreeError::Invalid { operation, reason } => SourceError::Unsupported {
                source_name: self.name.clone(),
                operation: operation.to_string(),
                reason,
            },
        };
        let outcome = match command {
            Command::ReadChildren { .. } => {
                let node = tree.node_data(path).map_err(map_err)?;
                CommandOutcome::Children {
                    location: node.location,
                    children: node.children,
                }
            }
            Command::ReadProperties { .. } => {
                let node = tree.node_data(path).map_err(map_err)?;
                CommandOutcome::Properties {
                    location: node.location,
                    properties: node.properties,
                }
            }
            Command::ReadNode { .. } => CommandOutcome::Node(tree.node_data(path).map_err(map_err)?),
            Command::ReadSubtree { max_depth, .. } => {
                CommandOutcome::Subtree(tree.subtree(path, *max_depth).map_err(map_err)?)
            }
            _ => {
                return Err(SourceError::Unsupported {
                    source_name: self.name.clone(),
                    operation: command.name().to_string(),
                    reason: "not a read command".to_string(),
                })
            }
        };
        Ok(outcome)
    }

    fn write_command(&self, command: &Command) -> SourceResult<CommandOutcome> {
        let mut tx = self.write()?;
        let outcome = self.apply_write(&mut tx, command)?;
        tx.commit();
        Ok(outcome)
    }

    fn apply_write(&self, tx: &mut WriteTransaction<'_>, command: &Command) -> SourceResult<CommandOutcome> {
        let affected = match command {
            Command::CreateNode {
                under,
                name,
                properties,
                conflict,
            } => tx.create_node(under.path(), name, properties, *conflict)?,
            Command::DeleteSubtree { at } => {
                tx.delete_subtree(at.path())?;
                at.path().clone()
            }
            Command::MoveSubtree { from, into } => tx.move_subtree(from.path(), into.path())?,
            Command::SetProperties { on, properties } => {
                tx.set_properties(on.path(), properties)?;
                on.path().clone()
            }
            Command::RemoveProperties { from, names } => {
                tx.remove_properties(from.path(), names)?;
                from.path().clone()
            }
            Command::RenameNode { at, new_name } => tx.rename_node(at.path(), new_name)?,
            _ => {
                return Err(SourceError::Unsupported {
                    source_name: self.name.clone(),
                    operation: command.name().to_string(),
                    reason: "not a write command".to_string(),
                })
            }
        };
        let location = match tx.tree().get(&affected) {
            Some(record) => Location::new(affected.clone()).with_id(record.id),
            None => Location::new(affected.clone()),
        };
        Ok(CommandOutcome::Written { location })
    }

    /// Execute a command directly against this repository.
    pub fn execute(&self, command: &Command) -> SourceResult<CommandOutcome> {
        if command.is_read() {
            self.read_command(command)
        } else {
            self.write_command(command)
        }
    }

    /// Execute `commands` in one transaction.
    ///
    /// Reads see the writes made earlier in the batch. The first failure
    /// rolls back the whole batch. A batch of reads only takes the shared lock.
    pub fn execute_batch(&self, commands: &[Command]) -> SourceResult<Vec<CommandOutcome>> {
        if commands.iter().all(Command::is_read) {
            let tx = self.read()?;
            return commands
                .iter()
                .map(|command| self.read_in(tx.tree(), command))
                .collect();
        }
        let mut tx = self.write()?;
        let mut outcomes = Vec::with_capacity(commands.len());
        for command in commands {
            let outcome = if command.is_read() {
                self.read_in(tx.tree(), command)?
            } else {
                self.apply_write(&mut tx, command)?
            };
            outcomes.push(outcome);
        }
        tx.commit();
        Ok(outcomes)
    }
}

// ============================================================================
// SOURCE AND CONNECTION
// ============================================================================

type Workspaces = Arc<BTreeMap<String, Arc<InMemoryRepository>>>;

/// [`RepositorySource`] backed by an [`InMemoryRepository`] per workspace.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    repository: Arc<InMemoryRepository>,
    workspaces: Workspaces,
    default_cache_policy: Option<CachePolicy>,
    read_only: bool,
}

impl InMemorySource {
    /// A source over a new, empty repository.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_repository(Arc::new(InMemoryRepository::new(name)))
    }

    pub fn from_repository(repository: Arc<InMemoryRepository>) -> Self {
        Self {
            repository,
            workspaces: Arc::default(),
            default_cache_policy: None,
            read_only: false,
        }
    }

    pub fn with_default_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.default_cache_policy = Some(policy);
        self
    }

    /// Add an empty named workspace next to the default one.
    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        let repository = Arc::new(InMemoryRepository::new(self.repository.name()));
        Arc::make_mut(&mut self.workspaces).insert(workspace.into(), repository);
        self
    }

    /// Reject every write command with `SourceError::Unsupported`.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// The default workspace.
    pub fn repository(&self) -> &Arc<InMemoryRepository> {
        &self.repository
    }

    pub fn workspace(&self, workspace: &str) -> Option<&Arc<InMemoryRepository>> {
        self.workspaces.get(workspace)
    }

    pub fn workspace_names(&self) -> Vec<&str> {
        self.workspaces.keys().map(String::as_str).collect()
    }
}

impl RepositorySource for InMemorySource {
    fn name(&self) -> &str {
        self.repository.name()
    }

    fn get_connection(&self) -> SourceResult<Box<dyn Connection>> {
        Ok(Box::new(InMemoryConnection {
            repository: Arc::clone(&self.repository),
            workspaces: Arc::clone(&self.workspaces),
            active: None,
            default_cache_policy: self.default_cache_policy,
            read_only: self.read_only,
            closed: false,
        }))
    }

    fn default_cache_policy(&self) -> Option<CachePolicy> {
        self.default_cache_policy
    }
}

/// Connection to an [`InMemorySource`].
#[derive(Debug)]
pub struct InMemoryConnection {
    repository: Arc<InMemoryRepository>,
    workspaces: Workspaces,
    /// Selected named workspace; the default repository when `None`.
    active: Option<(String, Arc<InMemoryRepository>)>,
    default_cache_policy: Option<CachePolicy>,
    read_only: bool,
    closed: bool,
}

impl InMemoryConnection {
    fn target(&self) -> &Arc<InMemoryRepository> {
        match &self.active {
            Some((_, repository)) => repository,
            None => &self.repository,
        }
    }

    fn check(&self, command: &Command) -> SourceResult<()> {
        if self.closed {
            return Err(SourceError::ConnectionClosed {
                source_name: self.repository.name().to_string(),
            });
        }
        if self.read_only && !command.is_read() {
            return Err(SourceError::Unsupported {
                source_name: self.repository.name().to_string(),
                operation: command.name().to_string(),
                reason: "source is read-only".to_string(),
            });
        }
        Ok(())
    }
}

impl Connection for InMemoryConnection {
    fn source_name(&self) -> &str {
        self.repository.name()
    }

    fn default_cache_policy(&self) -> Option<CachePolicy> {
        self.default_cache_policy
    }

    fn execute(&self, command: &Command) -> SourceResult<CommandOutcome> {
        self.check(command)?;
        tracing::trace!(
            source = %self.repository.name(),
            workspace = ?self.workspace(),
            command = command.name(),
            path = %command.target().path(),
            "Executing command"
        );
        self.target().execute(command)
    }

    fn execute_batch(&self, commands: &[Command]) -> SourceResult<Vec<CommandOutcome>> {
        for command in commands {
            self.check(command)?;
        }
        tracing::trace!(
            source = %self.repository.name(),
            workspace = ?self.workspace(),
            commands = commands.len(),
            "Executing batch"
        );
        self.target().execute_batch(commands)
    }

    fn workspace(&self) -> Option<&str> {
        self.active.as_ref().map(|(name, _)| name.as_str())
    }

    fn set_workspace(&mut self, workspace: Option<&str>) -> SourceResult<()> {
        self.active = match workspace {
            None => None,
            Some(name) => {
                let repository =
                    self.workspaces
                        .get(name)
                        .ok_or_else(|| SourceError::NoSuchWorkspace {
                            source_name: self.repository.name().to_string(),
                            workspace: name.to_string(),
                        })?;
                Some((name.to_string(), Arc::clone(repository)))
            }
        };
        Ok(())
    }

    fn ping(&self, _timeout: Duration) -> bool {
        !self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(text: &str) -> Path {
        Path::parse(text).unwrap()
    }

    fn loc(text: &str) -> Location {
        Location::new(p(text))
    }

    fn read_node(repo: &InMemoryRepository, path: &str) -> SourceResult<NodeData> {
        repo.execute(&Command::ReadNode { at: loc(path) })
            .map(|o| o.into_node().unwrap())
    }

    fn child_names(node: &NodeData) -> Vec<String> {
        node.children.iter().map(|c| c.name.clone()).collect()
    }

    #[test]
    fn test_set_property_creates_intermediate_nodes() {
        let repo = InMemoryRepository::new("mem");
        repo.set_property(&p("/a/b/c"), "k", "v").unwrap();

        let a = read_node(&repo, "/a").unwrap();
        assert_eq!(child_names(&a), vec!["b"]);
        let c = read_node(&repo, "/a/b/c").unwrap();
        assert_eq!(c.properties.get("k"), Some(&PropertyValue::from("v")));
        assert!(c.location.has_id());
    }

    #[test]
    fn test_missing_node_reports_lowest_existing() {
        let repo = InMemoryRepository::new("mem");
        repo.create_path(&p("/a")).unwrap();
        let err = read_node(&repo, "/a/x/y").unwrap_err();
        assert_eq!(
            err,
            SourceError::NotFound {
                source_name: "mem".to_string(),
                path: p("/a/x/y"),
                lowest_existing: Some(p("/a")),
            }
        );
    }

    #[test]
    fn test_create_conflict_behaviors() {
        let repo = InMemoryRepository::new("mem");
        repo.set_property(&p("/n/child"), "x", 1i64).unwrap();
        repo.set_property(&p("/n"), "keep", "old").unwrap();

        let create = |conflict: ConflictBehavior| Command::CreateNode {
            under: loc("/"),
            name: "n".to_string(),
            properties: vec![Property::new("new", "value")],
            conflict,
        };

        repo.execute(&create(ConflictBehavior::DoNotReplace)).unwrap();
        let n = read_node(&repo, "/n").unwrap();
        assert!(n.properties.get("new").is_none());

        repo.execute(&create(ConflictBehavior::Update)).unwrap();
        let n = read_node(&repo, "/n").unwrap();
        assert!(n.properties.contains_key("new"));
        assert!(n.properties.contains_key("keep"));
        assert_eq!(child_names(&n), vec!["child"]);

        repo.execute(&create(ConflictBehavior::Replace)).unwrap();
        let n = read_node(&repo, "/n").unwrap();
        assert!(n.properties.contains_key("new"));
        assert!(!n.properties.contains_key("keep"));
        assert!(n.children.is_empty());
        assert!(read_node(&repo, "/n/child").is_err());

        let root = read_node(&repo, "/").unwrap();
        assert_eq!(child_names(&root), vec!["n"]);
    }

    #[test]
    fn test_move_and_rename() {
        let repo = InMemoryRepository::new("mem");
        repo.set_property(&p("/a/x/deep"), "k", "v").unwrap();
        repo.create_path(&p("/b")).unwrap();

        repo.execute(&Command::MoveSubtree {
            from: loc("/a/x"),
            into: loc("/b"),
        })
        .unwrap();
        assert!(read_node(&repo, "/a/x").is_err());
        assert!(read_node(&repo, "/b/x/deep").is_ok());

        let outcome = repo
            .execute(&Command::RenameNode {
                at: loc("/b/x"),
                new_name: "y".to_string(),
            })
            .unwrap();
        assert_eq!(outcome.location().unwrap().path(), &p("/b/y"));
        assert_eq!(child_names(&read_node(&repo, "/b").unwrap()), vec!["y"]);
        assert!(read_node(&repo, "/b/y/deep").is_ok());
    }

    #[test]
    fn test_move_below_itself_is_unsupported() {
        let repo = InMemoryRepository::new("mem");
        repo.create_path(&p("/a/b")).unwrap();
        let err = repo
            .execute(&Command::MoveSubtree {
                from: loc("/a"),
                into: loc("/a/b"),
            })
            .unwrap_err();
        assert!(matches!(err, SourceError::Unsupported { .. }));
    }

    #[test]
    fn test_delete_subtree() {
        let repo = InMemoryRepository::new("mem");
        repo.create_path(&p("/a/b/c")).unwrap();
        repo.create_path(&p("/d")).unwrap();
        repo.execute(&Command::DeleteSubtree { at: loc("/a") }).unwrap();
        assert!(read_node(&repo, "/a/b/c").is_err());
        assert_eq!(child_names(&read_node(&repo, "/").unwrap()), vec!["d"]);
    }

    #[test]
    fn test_subtree_is_preorder_and_depth_limited() {
        let repo = InMemoryRepository::new("mem");
        repo.create_path(&p("/r/a/a1")).unwrap();
        repo.create_path(&p("/r/b")).unwrap();

        let outcome = repo
            .execute(&Command::ReadSubtree {
                at: loc("/r"),
                max_depth: 1,
            })
            .unwrap();
        let CommandOutcome::Subtree(nodes) = outcome else {
            panic!("expected subtree");
        };
        let paths: Vec<String> = nodes.iter().map(|n| n.path().to_string()).collect();
        assert_eq!(paths, vec!["/r", "/r/a", "/r/b"]);
    }

    #[test]
    fn test_dropped_write_transaction_rolls_back() {
        let repo = InMemoryRepository::new("mem");
        {
            let mut tx = repo.write().unwrap();
            tx.create_path(&p("/temp"));
            assert!(tx.tree().contains(&p("/temp")));
        }
        assert!(!repo.snapshot().unwrap().contains(&p("/temp")));
        assert!(repo.transaction_log().unwrap().is_empty());
        // The lock was released.
        repo.create_path(&p("/kept")).unwrap();
    }

    #[test]
    fn test_failed_command_leaves_tree_unchanged() {
        let repo = InMemoryRepository::new("mem");
        let before = repo.snapshot().unwrap();
        let err = repo
            .execute(&Command::SetProperties {
                on: loc("/missing"),
                properties: vec![Property::new("k", "v")],
            })
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(*repo.snapshot().unwrap(), *before);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_commits() {
        let repo = InMemoryRepository::new("mem");
        let before = repo.snapshot().unwrap();
        repo.create_path(&p("/new")).unwrap();
        assert!(!before.contains(&p("/new")));
        assert!(repo.snapshot().unwrap().contains(&p("/new")));
    }

    #[test]
    fn test_transaction_log_sequences() {
        let repo = InMemoryRepository::new("mem");
        repo.create_path(&p("/a")).unwrap();
        repo.set_property(&p("/a"), "k", "v").unwrap();
        let log = repo.transaction_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].sequence, 1);
        assert_eq!(log[1].sequence, 2);
        assert_eq!(log[1].changes, vec!["set-property /a".to_string()]);
    }

    #[test]
    fn test_transaction_log_is_bounded() {
        let repo = InMemoryRepository::with_log_capacity("mem", 3);
        for i in 0..10 {
            repo.create_path(&p(&format!("/n{}", i))).unwrap();
        }
        let log = repo.transaction_log().unwrap();
        let sequences: Vec<u64> = log.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![8, 9, 10]);
        assert_eq!(repo.next_sequence().unwrap(), 11);
        assert_eq!(repo.snapshot().unwrap().len(), 11);
    }

    #[test]
    fn test_truncate_log_before() {
        let repo = InMemoryRepository::new("mem");
        for i in 0..5 {
            repo.create_path(&p(&format!("/n{}", i))).unwrap();
        }
        assert_eq!(repo.truncate_log_before(4).unwrap(), 3);
        let sequences: Vec<u64> = repo
            .transaction_log()
            .unwrap()
            .iter()
            .map(|r| r.sequence)
            .collect();
        assert_eq!(sequences, vec![4, 5]);
        assert_eq!(repo.truncate_log_before(4).unwrap(), 0);
    }

    #[test]
    fn test_batch_commits_once() {
        let repo = InMemoryRepository::new("mem");
        let create = |under: &str, name: &str| Command::CreateNode {
            under: loc(under),
            name: name.to_string(),
            properties: vec![],
            conflict: ConflictBehavior::DoNotReplace,
        };
        let outcomes = repo
            .execute_batch(&[
                create("/", "a"),
                create("/a", "b"),
                create("/a", "c"),
                Command::ReadChildren { of: loc("/a") },
            ])
            .unwrap();

        assert_eq!(outcomes.len(), 4);
        match &outcomes[3] {
            CommandOutcome::Children { children, .. } => {
                let names: Vec<&str> = children.iter().map(|c| c.name.as_str()).collect();
                assert_eq!(names, vec!["b", "c"]);
            }
            other => panic!("Expected children, got: {:?}", other),
        }
        let log = repo.transaction_log().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].changes.len(), 3);
    }

    #[test]
    fn test_failed_batch_rolls_back_everything() {
        let repo = InMemoryRepository::new("mem");
        let before = repo.snapshot().unwrap();
        let err = repo
            .execute_batch(&[
                Command::CreateNode {
                    under: loc("/"),
                    name: "a".to_string(),
                    properties: vec![],
                    conflict: ConflictBehavior::DoNotReplace,
                },
                Command::SetProperties {
                    on: loc("/missing"),
                    properties: vec![Property::new("k", "v")],
                },
            ])
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(*repo.snapshot().unwrap(), *before);
        assert!(repo.transaction_log().unwrap().is_empty());
    }

    #[test]
    fn test_workspaces_are_separate_trees() {
        let source = InMemorySource::new("mem").with_workspace("drafts");
        source.repository().create_path(&p("/main")).unwrap();
        source.workspace("drafts").unwrap().create_path(&p("/draft")).unwrap();
        assert_eq!(source.workspace_names(), vec!["drafts"]);

        let mut conn = source.get_connection().unwrap();
        assert_eq!(conn.workspace(), None);
        assert!(conn.execute(&Command::ReadNode { at: loc("/main") }).is_ok());

        conn.set_workspace(Some("drafts")).unwrap();
        assert_eq!(conn.workspace(), Some("drafts"));
        assert!(conn.execute(&Command::ReadNode { at: loc("/draft") }).is_ok());
        assert!(conn
            .execute(&Command::ReadNode { at: loc("/main") })
            .unwrap_err()
            .is_not_found());

        let err = conn.set_workspace(Some("nope")).unwrap_err();
        assert!(matches!(err, SourceError::NoSuchWorkspace { .. }));
        assert_eq!(conn.workspace(), Some("drafts"));

        conn.set_workspace(None).unwrap();
        assert!(conn.execute(&Command::ReadNode { at: loc("/main") }).is_ok());
    }

    #[test]
    fn test_concurrent_readers() {
        let repo = InMemoryRepository::new("mem");
        let first = repo.read().unwrap();
        let second = repo.read().unwrap();
        assert!(first.node(&Path::root()).is_some());
        assert!(second.node(&Path::root()).is_some());
    }

    #[test]
    fn test_read_only_source_rejects_writes() {
        let source = InMemorySource::new("ro").read_only();
        let conn = source.get_connection().unwrap();
        let err = conn
            .execute(&Command::DeleteSubtree { at: loc("/") })
            .unwrap_err();
        assert!(matches!(err, SourceError::Unsupported { .. }));
        assert!(conn.execute(&Command::ReadNode { at: loc("/") }).is_ok());
    }

    #[test]
    fn test_closed_connection() {
        let source = InMemorySource::new("mem");
        let mut conn = source.get_connection().unwrap();
        assert!(conn.ping(Duration::from_millis(1)));
        conn.close();
        assert!(!conn.ping(Duration::from_millis(1)));
        assert!(matches!(
            conn.execute(&Command::ReadNode { at: loc("/") }),
            Err(SourceError::ConnectionClosed { .. })
        ));
    }
}
