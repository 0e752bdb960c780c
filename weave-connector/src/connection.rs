//! The contract every backing source must satisfy to be federated.

use std::time::Duration;

use weave_core::{CachePolicy, CancellationToken, SourceError, SourceResult};

use crate::command::{Command, CommandOutcome};

/// An open connection to one backing source.
///
/// Connections execute commands synchronously. A connection handed out by a
/// pool returns to that pool on `close`.
///
/// # Error Contract
///
/// - `SourceError::NotFound` when the addressed node does not exist. During
///   reads the federation layer treats this as "no contribution".
/// - Any other `SourceError` is fatal for the federated operation.
pub trait Connection: Send + Sync {
    /// Name of the source this connection talks to.
    fn source_name(&self) -> &str;

    /// Policy applied to answers that do not carry their own.
    fn default_cache_policy(&self) -> Option<CachePolicy>;

    /// Execute one command.
    fn execute(&self, command: &Command) -> SourceResult<CommandOutcome>;

    /// Execute several commands in order, stopping at the first failure.
    ///
    /// Sources with transactions apply the whole batch atomically.
    fn execute_batch(&self, commands: &[Command]) -> SourceResult<Vec<CommandOutcome>> {
        commands.iter().map(|command| self.execute(command)).collect()
    }

    /// The workspace commands run against; `None` is the source's default.
    fn workspace(&self) -> Option<&str> {
        None
    }

    /// Switch workspaces. `None` selects the source's default workspace.
    fn set_workspace(&mut self, workspace: Option<&str>) -> SourceResult<()> {
        match workspace {
            None => Ok(()),
            Some(workspace) => Err(SourceError::NoSuchWorkspace {
                source_name: self.source_name().to_string(),
                workspace: workspace.to_string(),
            }),
        }
    }

    /// Check that the connection is still usable, waiting at most `timeout`.
    fn ping(&self, timeout: Duration) -> bool;

    /// Release the connection. Calling this more than once has no effect.
    fn close(&mut self);
}

/// A named backing source that can open connections.
pub trait RepositorySource: Send + Sync {
    fn name(&self) -> &str;

    fn get_connection(&self) -> SourceResult<Box<dyn Connection>>;

    fn default_cache_policy(&self) -> Option<CachePolicy>;
}

/// What a caller asks a [`ConnectionFactory`] for.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionRequest<'a> {
    pub source_name: &'a str,
    pub workspace: Option<&'a str>,
    /// Gives up waiting for a connection once cancelled.
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> ConnectionRequest<'a> {
    pub fn new(source_name: &'a str) -> Self {
        Self {
            source_name,
            workspace: None,
            cancellation: None,
        }
    }

    pub fn with_workspace(mut self, workspace: Option<&'a str>) -> Self {
        self.workspace = workspace;
        self
    }

    pub fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_some_and(|t| t.is_cancelled())
    }
}

/// Point a fresh connection at the requested workspace, closing it on failure.
pub fn select_workspace(
    mut connection: Box<dyn Connection>,
    workspace: Option<&str>,
) -> SourceResult<Box<dyn Connection>> {
    if workspace.is_none() {
        return Ok(connection);
    }
    match connection.set_workspace(workspace) {
        Ok(()) => Ok(connection),
        Err(e) => {
            connection.close();
            Err(e)
        }
    }
}

/// Creates connections by source name.
///
/// The federation layer only ever sees this trait; a
/// [`RepositoryRegistry`](crate::RepositoryRegistry) is the usual
/// implementation.
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection to the named source.
    ///
    /// Returns `SourceError::Unavailable` when the source is unknown or cannot
    /// be reached.
    fn create_connection(&self, source_name: &str) -> SourceResult<Box<dyn Connection>>;

    /// Open a connection for `request`: its workspace selected, and
    /// `SourceError::Cancelled` once its token is cancelled.
    ///
    /// The default checks the token once and then delegates to
    /// [`create_connection`](Self::create_connection). Factories that can
    /// block should watch the token while they wait.
    fn open_connection(&self, request: &ConnectionRequest<'_>) -> SourceResult<Box<dyn Connection>> {
        if request.is_cancelled() {
            return Err(SourceError::Cancelled {
                source_name: request.source_name.to_string(),
            });
        }
        let connection = self.create_connection(request.source_name)?;
        select_workspace(connection, request.workspace)
    }
}
