//! Per-operation cache of open source connections.

use std::fmt;
use std::sync::Arc;

use weave_connector::{Connection, ConnectionFactory, ConnectionRequest};
use weave_core::{CancellationToken, SourceResult};

/// A source plus the workspace inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub source_name: String,
    pub workspace: Option<String>,
}

impl ConnectionKey {
    pub fn new(source_name: &str, workspace: Option<&str>) -> Self {
        Self {
            source_name: source_name.to_string(),
            workspace: workspace.map(str::to_string),
        }
    }

    fn matches(&self, source_name: &str, workspace: Option<&str>) -> bool {
        self.source_name == source_name && self.workspace.as_deref() == workspace
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.workspace {
            Some(workspace) => write!(f, "{}@{}", self.source_name, workspace),
            None => write!(f, "{}", self.source_name),
        }
    }
}

/// Opens at most one connection per source workspace for the lifetime of one
/// operation, and closes them all together.
///
/// Dropping the manager closes whatever is still open.
pub struct ConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
    cancellation: CancellationToken,
    /// Open connections in the order they were opened.
    connections: Vec<(ConnectionKey, Box<dyn Connection>)>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("open", &self.open_connections())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            cancellation: CancellationToken::new(),
            connections: Vec::new(),
        }
    }

    /// Stop waiting for connections once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// The connection for a source workspace, opening it on first use.
    pub fn get_connection(
        &mut self,
        source_name: &str,
        workspace: Option<&str>,
    ) -> SourceResult<&dyn Connection> {
        let index = match self.position(source_name, workspace) {
            Some(index) => index,
            None => {
                let request = ConnectionRequest::new(source_name)
                    .with_workspace(workspace)
                    .with_cancellation(&self.cancellation);
                let connection = self.factory.open_connection(&request)?;
                let key = ConnectionKey::new(source_name, workspace);
                tracing::debug!(connection = %key, "Opened connection");
                self.connections.push((key, connection));
                self.connections.len() - 1
            }
        };
        Ok(self.connections[index].1.as_ref())
    }

    /// An already-open connection.
    pub fn connection(&self, source_name: &str, workspace: Option<&str>) -> Option<&dyn Connection> {
        self.position(source_name, workspace)
            .map(|index| self.connections[index].1.as_ref())
    }

    fn position(&self, source_name: &str, workspace: Option<&str>) -> Option<usize> {
        self.connections
            .iter()
            .position(|(key, _)| key.matches(source_name, workspace))
    }

    /// Keys of the open connections, in opening order.
    pub fn open_connections(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|(key, _)| key.to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every open connection once and forget them.
    pub fn close(&mut self) {
        if self.connections.is_empty() {
            return;
        }
        tracing::debug!(count = self.connections.len(), "Closing connections");
        for (_, mut connection) in self.connections.drain(..) {
            connection.close();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}
