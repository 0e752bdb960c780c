//! WEAVE Test Utilities
//!
//! Shared test infrastructure for the WEAVE workspace:
//! - Proptest generators for paths and rule texts
//! - A connection factory that records what the federation layer does
//! - The three-source fixture with a cache most federation tests run against
//! - Assertions for WEAVE-specific results

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use weave_connector::{
    Command, CommandOutcome, Connection, ConnectionFactory, ConnectionRequest, InMemoryRepository,
    InMemorySource, RepositoryRegistry,
};
pub use weave_core::{
    CachePolicy, Expiration, FederationConfig, FederationError, Location, Path, SourceError,
    SourceResult, Timestamp, WeaveError, WeaveResult,
};
pub use weave_federation::{
    ExecutionResult, ExecutorOptions, FederatingExecutor, SourceProjectionSet,
};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for WEAVE values.

    use super::*;
    use proptest::prelude::*;

    /// A single valid path segment.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,6}"
    }

    /// An absolute, normalized path up to four segments deep.
    pub fn arb_path() -> impl Strategy<Value = Path> {
        prop::collection::vec(arb_segment(), 0..4).prop_map(|segments| {
            Path::from_segments(segments).unwrap_or_else(|_| Path::root())
        })
    }

    /// A non-root path.
    pub fn arb_non_root_path() -> impl Strategy<Value = Path> {
        prop::collection::vec(arb_segment(), 1..4).prop_map(|segments| {
            Path::from_segments(segments).unwrap_or_else(|_| Path::root())
        })
    }

    /// Text of a well-formed rule: offset, wildcard, or with exceptions.
    pub fn arb_rule_text() -> impl Strategy<Value = String> {
        (arb_path(), arb_path(), any::<bool>(), prop::option::of(arb_segment())).prop_map(
            |(federated, source, wildcard, exception)| {
                let mut text = if wildcard {
                    let base = if federated.is_root() {
                        String::new()
                    } else {
                        federated.to_string()
                    };
                    format!("{}/* => {}", base, source)
                } else {
                    format!("{} => {}", federated, source)
                };
                if let Some(exception) = exception {
                    text.push_str(" $ ");
                    text.push_str(&exception);
                }
                text
            },
        )
    }

    /// Arbitrary text, mostly rule-shaped.
    pub fn arb_rule_noise() -> impl Strategy<Value = String> {
        prop_oneof![
            arb_rule_text(),
            "[ /a-z=>$*.]{0,24}",
        ]
    }

    pub fn arb_ttl_secs() -> impl Strategy<Value = u64> {
        1u64..1_000
    }
}

// ============================================================================
// RECORDING FACTORY
// ============================================================================

#[derive(Debug, Default, Clone)]
struct SourceActivity {
    created: usize,
    closed: usize,
    commands: Vec<Command>,
}

type ActivityLog = Arc<Mutex<HashMap<String, SourceActivity>>>;
type FailingSources = Arc<Mutex<HashSet<String>>>;

/// Wraps another factory and records per-source activity.
///
/// Sources marked with [`fail_source`](Self::fail_source) answer every
/// command with `SourceError::Unavailable`.
pub struct CountingConnectionFactory {
    inner: Arc<dyn ConnectionFactory>,
    activity: ActivityLog,
    failing: FailingSources,
}

impl std::fmt::Debug for CountingConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingConnectionFactory").finish_non_exhaustive()
    }
}

impl CountingConnectionFactory {
    pub fn new(inner: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            inner,
            activity: Arc::default(),
            failing: Arc::default(),
        }
    }

    /// Make every command sent to `source_name` fail as unavailable.
    pub fn fail_source(&self, source_name: &str) {
        self.failing.lock().unwrap().insert(source_name.to_string());
    }

    fn record(&self, source_name: &str, inner: Box<dyn Connection>) -> Box<dyn Connection> {
        self.activity
            .lock()
            .unwrap()
            .entry(source_name.to_string())
            .or_default()
            .created += 1;
        Box::new(RecordingConnection {
            inner,
            activity: Arc::clone(&self.activity),
            failing: Arc::clone(&self.failing),
            closed: false,
        })
    }

    fn with_activity<T>(&self, source_name: &str, f: impl FnOnce(&SourceActivity) -> T) -> T {
        let activity = self.activity.lock().unwrap();
        f(&activity.get(source_name).cloned().unwrap_or_default())
    }

    /// Connections created for `source_name`.
    pub fn created(&self, source_name: &str) -> usize {
        self.with_activity(source_name, |a| a.created)
    }

    /// Connections to `source_name` that were closed.
    pub fn close_count(&self, source_name: &str) -> usize {
        self.with_activity(source_name, |a| a.closed)
    }

    /// Commands sent to `source_name`, in order.
    pub fn executed_against(&self, source_name: &str) -> Vec<Command> {
        self.with_activity(source_name, |a| a.commands.clone())
    }

    /// Read commands sent to `source_name`.
    pub fn reads_against(&self, source_name: &str) -> usize {
        self.executed_against(source_name)
            .iter()
            .filter(|c| c.is_read())
            .count()
    }

    /// Write commands sent to `source_name`.
    pub fn writes_against(&self, source_name: &str) -> usize {
        self.executed_against(source_name)
            .iter()
            .filter(|c| !c.is_read())
            .count()
    }

    pub fn reset(&self) {
        self.activity.lock().unwrap().clear();
    }
}

impl ConnectionFactory for CountingConnectionFactory {
    fn create_connection(&self, source_name: &str) -> SourceResult<Box<dyn Connection>> {
        let inner = self.inner.create_connection(source_name)?;
        Ok(self.record(source_name, inner))
    }

    fn open_connection(&self, request: &ConnectionRequest<'_>) -> SourceResult<Box<dyn Connection>> {
        let inner = self.inner.open_connection(request)?;
        Ok(self.record(request.source_name, inner))
    }
}

struct RecordingConnection {
    inner: Box<dyn Connection>,
    activity: ActivityLog,
    failing: FailingSources,
    closed: bool,
}

impl RecordingConnection {
    fn record(&self, commands: &[Command]) -> SourceResult<()> {
        let name = self.inner.source_name();
        self.activity
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .commands
            .extend(commands.iter().cloned());
        if self.failing.lock().unwrap().contains(name) {
            return Err(SourceError::Unavailable {
                source_name: name.to_string(),
                reason: "marked as failing".to_string(),
            });
        }
        Ok(())
    }
}

impl Connection for RecordingConnection {
    fn source_name(&self) -> &str {
        self.inner.source_name()
    }

    fn default_cache_policy(&self) -> Option<CachePolicy> {
        self.inner.default_cache_policy()
    }

    fn execute(&self, command: &Command) -> SourceResult<CommandOutcome> {
        self.record(std::slice::from_ref(command))?;
        self.inner.execute(command)
    }

    fn execute_batch(&self, commands: &[Command]) -> SourceResult<Vec<CommandOutcome>> {
        self.record(commands)?;
        self.inner.execute_batch(commands)
    }

    fn workspace(&self) -> Option<&str> {
        self.inner.workspace()
    }

    fn set_workspace(&mut self, workspace: Option<&str>) -> SourceResult<()> {
        self.inner.set_workspace(workspace)
    }

    fn ping(&self, timeout: Duration) -> bool {
        self.inner.ping(timeout)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.activity
                .lock()
                .unwrap()
                .entry(self.inner.source_name().to_string())
                .or_default()
                .closed += 1;
        }
        self.inner.close();
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! The three-source federation with a cache.
    //!
    //! ```text
    //! Cache     /         => /cache/repo/A     10s
    //! Source 1  /a        => /source/one/a    100s
    //!           /b        => /source/one/b
    //! Source 2  /a        => /source/two/a    200s
    //! Source 3  /         => /                300s
    //! ```

    use super::*;

    pub const CACHE: &str = "Cache";
    pub const SOURCE_1: &str = "Source 1";
    pub const SOURCE_2: &str = "Source 2";
    pub const SOURCE_3: &str = "Source 3";

    pub const THREE_SOURCE_CONFIG: &str = r#"
name = "Federated Source"

[cache]
source = "Cache"
ttl_ms = 10000
rules = ["/ => /cache/repo/A"]

[[projections]]
source = "Source 1"
rules = ["/a => /source/one/a", "/b => /source/one/b"]

[[projections]]
source = "Source 2"
rules = ["/a => /source/two/a"]

[[projections]]
source = "Source 3"
rules = ["/ => /"]
"#;

    pub fn path(text: &str) -> Path {
        Path::parse(text).unwrap()
    }

    pub struct ThreeSourceFixture {
        pub config: FederationConfig,
        pub registry: Arc<RepositoryRegistry>,
        pub factory: Arc<CountingConnectionFactory>,
        pub projections: Arc<SourceProjectionSet>,
        sources: Vec<InMemorySource>,
    }

    impl ThreeSourceFixture {
        /// Empty sources with the mount points of sources 1 and 2 created.
        pub fn new() -> Self {
            let config = FederationConfig::from_toml_str(THREE_SOURCE_CONFIG).unwrap();
            let sources = vec![
                InMemorySource::new(CACHE),
                InMemorySource::new(SOURCE_1).with_default_cache_policy(CachePolicy::from_secs(100)),
                InMemorySource::new(SOURCE_2).with_default_cache_policy(CachePolicy::from_secs(200)),
                InMemorySource::new(SOURCE_3).with_default_cache_policy(CachePolicy::from_secs(300)),
            ];
            let registry = Arc::new(RepositoryRegistry::new());
            for source in &sources {
                registry
                    .register_configured(Arc::new(source.clone()), &config)
                    .unwrap();
            }
            let factory = Arc::new(CountingConnectionFactory::new(registry.clone()));
            let projections = Arc::new(SourceProjectionSet::from_config(&config).unwrap());

            let fixture = Self {
                config,
                registry,
                factory,
                projections,
                sources,
            };
            for mount in ["/source/one/a", "/source/one/b"] {
                fixture.repository(SOURCE_1).create_path(&path(mount)).unwrap();
            }
            fixture
                .repository(SOURCE_2)
                .create_path(&path("/source/two/a"))
                .unwrap();
            fixture
        }

        /// Rebuild the projections with the named sources marked read-only.
        pub fn with_read_only(mut self, source_names: &[&str]) -> Self {
            for projection in &mut self.config.projections {
                if source_names.contains(&projection.source.as_str()) {
                    projection.read_only = true;
                }
            }
            self.projections = Arc::new(SourceProjectionSet::from_config(&self.config).unwrap());
            self
        }

        pub fn repository(&self, source_name: &str) -> &Arc<InMemoryRepository> {
            self.sources
                .iter()
                .find(|s| s.repository().name() == source_name)
                .map(|s| s.repository())
                .unwrap()
        }

        /// An executor whose "now" is `now`.
        pub fn executor_at(&self, now: Timestamp) -> FederatingExecutor {
            self.executor_with(ExecutorOptions::new().with_now(now))
        }

        pub fn executor_with(&self, options: ExecutorOptions) -> FederatingExecutor {
            let factory: Arc<dyn ConnectionFactory> = self.factory.clone();
            FederatingExecutor::new(Arc::clone(&self.projections), factory, options)
        }

        /// Run `command` as one operation at `now`.
        pub fn execute_at(&self, now: Timestamp, command: &Command) -> WeaveResult<ExecutionResult> {
            let mut executor = self.executor_at(now);
            let result = executor.execute(command);
            executor.close();
            result
        }
    }

    impl Default for ThreeSourceFixture {
        fn default() -> Self {
            Self::new()
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! WEAVE-specific assertions.

    use super::*;

    pub fn assert_path_not_found<T: std::fmt::Debug>(result: &WeaveResult<T>) {
        match result {
            Err(e) if e.is_path_not_found() => {}
            other => panic!("Expected PathNotFound, got: {:?}", other),
        }
    }

    pub fn assert_unsupported<T: std::fmt::Debug>(result: &WeaveResult<T>) {
        assert!(
            matches!(
                result,
                Err(WeaveError::Federation(FederationError::Unsupported { .. }))
            ),
            "Expected Unsupported, got: {:?}",
            result
        );
    }

    pub fn assert_cancelled<T: std::fmt::Debug>(result: &WeaveResult<T>) {
        assert!(
            matches!(result, Err(WeaveError::Federation(FederationError::Cancelled))),
            "Expected Cancelled, got: {:?}",
            result
        );
    }

    /// The children named in an outcome, in order.
    pub fn child_names(outcome: &CommandOutcome) -> Vec<String> {
        match outcome {
            CommandOutcome::Children { children, .. } => {
                children.iter().map(|c| c.name.clone()).collect()
            }
            CommandOutcome::Node(node) => node.children.iter().map(|c| c.name.clone()).collect(),
            other => panic!("Expected children in outcome, got: {:?}", other),
        }
    }
}
