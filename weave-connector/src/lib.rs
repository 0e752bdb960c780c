//! WEAVE Connector
//!
//! The boundary between the federation layer and backing sources:
//!
//! - [`Command`] / [`CommandOutcome`]: the closed set of operations a source executes
//! - [`Connection`], [`RepositorySource`], [`ConnectionFactory`]: the source contract
//! - [`ConnectionPool`]: bounded per-source pooling with shutdown
//! - [`RepositoryRegistry`]: name to pool lookup, passed around explicitly
//! - [`InMemorySource`]: a lock-guarded, copy-on-write in-memory source with
//!   named workspaces

pub mod command;
pub mod connection;
pub mod inmemory;
pub mod pool;
pub mod registry;

pub use command::{Command, CommandOutcome, ConflictBehavior, NodeData};
pub use connection::{
    select_workspace, Connection, ConnectionFactory, ConnectionRequest, RepositorySource,
};
pub use inmemory::{
    InMemoryConnection, InMemoryRepository, InMemorySource, NodeRecord, NodeTree, ReadTransaction,
    TransactionRecord, WriteTransaction, DEFAULT_LOG_CAPACITY,
};
pub use pool::{ConnectionPool, PooledConnection, RunState};
pub use registry::RepositoryRegistry;
