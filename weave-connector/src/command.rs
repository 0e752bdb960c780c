//! Commands accepted by connections, and their outcomes.
//!
//! Commands form a closed set. Connections and the federating executor both
//! dispatch on them with a single `match`.

use serde::{Deserialize, Serialize};
use weave_core::{CachePolicy, ChildRef, Location, Path, Properties, Property};

// ============================================================================
// COMMANDS
// ============================================================================

/// What to do when a created node already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConflictBehavior {
    /// Replace the existing node and its subtree.
    Replace,
    /// Keep the node and its children, replace the given properties.
    #[default]
    Update,
    /// Leave the existing node untouched.
    DoNotReplace,
}

/// A read or write against one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    ReadChildren {
        of: Location,
    },
    ReadProperties {
        at: Location,
    },
    /// Children and properties together.
    ReadNode {
        at: Location,
    },
    /// The node and its descendants down to `max_depth` (0 = the node only).
    ReadSubtree {
        at: Location,
        max_depth: usize,
    },
    CreateNode {
        under: Location,
        name: String,
        properties: Vec<Property>,
        conflict: ConflictBehavior,
    },
    DeleteSubtree {
        at: Location,
    },
    MoveSubtree {
        from: Location,
        into: Location,
    },
    SetProperties {
        on: Location,
        properties: Vec<Property>,
    },
    RemoveProperties {
        from: Location,
        names: Vec<String>,
    },
    RenameNode {
        at: Location,
        new_name: String,
    },
}

impl Command {
    /// The location the command is addressed to.
    pub fn target(&self) -> &Location {
        match self {
            Command::ReadChildren { of } => of,
            Command::ReadProperties { at }
            | Command::ReadNode { at }
            | Command::ReadSubtree { at, .. }
            | Command::DeleteSubtree { at }
            | Command::RenameNode { at, .. } => at,
            Command::CreateNode { under, .. } => under,
            Command::MoveSubtree { from, .. } => from,
            Command::SetProperties { on, .. } => on,
            Command::RemoveProperties { from, .. } => from,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Command::ReadChildren { .. }
                | Command::ReadProperties { .. }
                | Command::ReadNode { .. }
                | Command::ReadSubtree { .. }
        )
    }

    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ReadChildren { .. } => "read-children",
            Command::ReadProperties { .. } => "read-properties",
            Command::ReadNode { .. } => "read-node",
            Command::ReadSubtree { .. } => "read-subtree",
            Command::CreateNode { .. } => "create-node",
            Command::DeleteSubtree { .. } => "delete-subtree",
            Command::MoveSubtree { .. } => "move-subtree",
            Command::SetProperties { .. } => "set-properties",
            Command::RemoveProperties { .. } => "remove-properties",
            Command::RenameNode { .. } => "rename-node",
        }
    }

    /// Same command addressed to another location.
    ///
    /// For `MoveSubtree` only the source location is replaced.
    pub fn retarget(&self, location: Location) -> Command {
        let mut command = self.clone();
        match &mut command {
            Command::ReadChildren { of } => *of = location,
            Command::ReadProperties { at }
            | Command::ReadNode { at }
            | Command::ReadSubtree { at, .. }
            | Command::DeleteSubtree { at }
            | Command::RenameNode { at, .. } => *at = location,
            Command::CreateNode { under, .. } => *under = location,
            Command::MoveSubtree { from, .. } => *from = location,
            Command::SetProperties { on, .. } => *on = location,
            Command::RemoveProperties { from, .. } => *from = location,
        }
        command
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// A node as read from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub location: Location,
    pub children: Vec<ChildRef>,
    pub properties: Properties,
    /// Policy the source attached to this answer, if any.
    pub cache_policy: Option<CachePolicy>,
}

impl NodeData {
    pub fn new(location: Location) -> Self {
        Self {
            location,
            children: Vec::new(),
            properties: Properties::new(),
            cache_policy: None,
        }
    }

    pub fn path(&self) -> &Path {
        self.location.path()
    }
}

/// Result of a successful command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Children {
        location: Location,
        children: Vec<ChildRef>,
    },
    Properties {
        location: Location,
        properties: Properties,
    },
    Node(NodeData),
    /// Nodes in pre-order, the requested node first.
    Subtree(Vec<NodeData>),
    /// A write completed; `location` is the affected node after the write.
    Written {
        location: Location,
    },
}

impl CommandOutcome {
    pub fn location(&self) -> Option<&Location> {
        match self {
            CommandOutcome::Children { location, .. }
            | CommandOutcome::Properties { location, .. }
            | CommandOutcome::Written { location } => Some(location),
            CommandOutcome::Node(node) => Some(&node.location),
            CommandOutcome::Subtree(nodes) => nodes.first().map(|n| &n.location),
        }
    }

    pub fn into_node(self) -> Option<NodeData> {
        match self {
            CommandOutcome::Node(node) => Some(node),
            _ => None,
        }
    }
}
