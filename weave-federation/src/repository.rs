//! The federated repository: a named projection set plus the factory that
//! opens source connections. It hands out one executor per operation.

use std::sync::Arc;

use weave_connector::{Command, ConnectionFactory};
use weave_core::{ConfigError, FederationConfig, WeaveResult};

use crate::executor::{ExecutionResult, ExecutorOptions, FederatingExecutor};
use crate::parser::ProjectionParser;
use crate::projection_set::SourceProjectionSet;

#[derive(Clone)]
pub struct FederatedRepository {
    name: String,
    projections: Arc<SourceProjectionSet>,
    factory: Arc<dyn ConnectionFactory>,
    parallel_fan_out: bool,
}

impl std::fmt::Debug for FederatedRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatedRepository")
            .field("name", &self.name)
            .field("sources", &self.projections.source_names())
            .field("parallel_fan_out", &self.parallel_fan_out)
            .finish()
    }
}

impl FederatedRepository {
    pub fn new(
        name: impl Into<String>,
        projections: SourceProjectionSet,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            projections: Arc::new(projections),
            factory,
            parallel_fan_out: false,
        }
    }

    /// Build from validated configuration using the default rule parser.
    pub fn from_config(
        config: &FederationConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, ConfigError> {
        Self::from_config_with(config, &ProjectionParser::new(), factory)
    }

    pub fn from_config_with(
        config: &FederationConfig,
        parser: &ProjectionParser,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, ConfigError> {
        let projections = SourceProjectionSet::from_config_with(config, parser)?;
        tracing::info!(
            name = %config.name,
            sources = projections.len(),
            cached = projections.cache_projection().is_some(),
            "Federated repository configured"
        );
        Ok(Self::new(config.name.clone(), projections, factory)
            .with_parallel_fan_out(config.parallel_fan_out))
    }

    pub fn with_parallel_fan_out(mut self, enabled: bool) -> Self {
        self.parallel_fan_out = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn projections(&self) -> &SourceProjectionSet {
        &self.projections
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel_fan_out
    }

    /// A fresh executor with the repository's default options.
    pub fn executor(&self) -> FederatingExecutor {
        self.executor_with(ExecutorOptions::new().with_parallel_fan_out(self.parallel_fan_out))
    }

    pub fn executor_with(&self, options: ExecutorOptions) -> FederatingExecutor {
        FederatingExecutor::new(
            Arc::clone(&self.projections),
            Arc::clone(&self.factory),
            options,
        )
    }

    /// Run one command as its own operation.
    pub fn execute(&self, command: &Command) -> WeaveResult<ExecutionResult> {
        let mut executor = self.executor();
        let result = executor.execute(command);
        executor.close();
        result
    }
}
