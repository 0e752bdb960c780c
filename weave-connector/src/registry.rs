//! Explicit registry of named sources and their pools.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use weave_core::{ConfigError, FederationConfig, PoolConfig, SourceError, SourceResult};

use crate::connection::{
    select_workspace, Connection, ConnectionFactory, ConnectionRequest, RepositorySource,
};
use crate::pool::ConnectionPool;

/// Maps source names to connection pools.
///
/// The registry is passed to whatever needs connections; there is no
/// process-wide lookup by name.
#[derive(Debug, Default)]
pub struct RepositoryRegistry {
    pools: RwLock<HashMap<String, ConnectionPool>>,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source with its own pool.
    pub fn register(
        &self,
        source: Arc<dyn RepositorySource>,
        config: PoolConfig,
    ) -> Result<ConnectionPool, ConfigError> {
        let name = source.name().to_string();
        config.validate(&format!("sources.{}.pool", name))?;
        let mut pools = self.pools.write().map_err(|_| ConfigError::InvalidValue {
            field: "registry".to_string(),
            value: name.clone(),
            reason: "registry lock poisoned".to_string(),
        })?;
        if pools.contains_key(&name) {
            return Err(ConfigError::InvalidValue {
                field: "source.name".to_string(),
                value: name,
                reason: "a source with this name is already registered".to_string(),
            });
        }
        let pool = ConnectionPool::new(source, config);
        tracing::debug!(source = %name, "Registered source");
        pools.insert(name, pool.clone());
        Ok(pool)
    }

    /// Register a source using the pool settings declared for it in `config`.
    pub fn register_configured(
        &self,
        source: Arc<dyn RepositorySource>,
        config: &FederationConfig,
    ) -> Result<ConnectionPool, ConfigError> {
        let pool_config = config
            .source(source.name())
            .map(|s| s.pool.clone())
            .unwrap_or_default();
        self.register(source, pool_config)
    }

    pub fn pool(&self, source_name: &str) -> Option<ConnectionPool> {
        self.pools
            .read()
            .ok()
            .and_then(|pools| pools.get(source_name).cloned())
    }

    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pools
            .read()
            .map(|pools| pools.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Shut down every pool.
    pub fn shutdown_all(&self) {
        let pools: Vec<ConnectionPool> = self
            .pools
            .read()
            .map(|pools| pools.values().cloned().collect())
            .unwrap_or_default();
        for pool in pools {
            pool.shutdown();
        }
    }
}

impl RepositoryRegistry {
    fn registered_pool(&self, source_name: &str) -> SourceResult<ConnectionPool> {
        self.pool(source_name)
            .ok_or_else(|| SourceError::Unavailable {
                source_name: source_name.to_string(),
                reason: "no source registered under this name".to_string(),
            })
    }
}

impl ConnectionFactory for RepositoryRegistry {
    fn create_connection(&self, source_name: &str) -> SourceResult<Box<dyn Connection>> {
        let connection = self.registered_pool(source_name)?.acquire()?;
        Ok(Box::new(connection))
    }

    /// Waits on the pool only until the request's token is cancelled.
    fn open_connection(&self, request: &ConnectionRequest<'_>) -> SourceResult<Box<dyn Connection>> {
        let pool = self.registered_pool(request.source_name)?;
        let connection = match request.cancellation {
            Some(token) => pool.acquire_cancellable(token)?,
            None => pool.acquire()?,
        };
        select_workspace(Box::new(connection), request.workspace)
    }
}
