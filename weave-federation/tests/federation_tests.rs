use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::{Duration, Utc};
use weave_connector::{
    Command, CommandOutcome, ConflictBehavior, ConnectionFactory, InMemorySource,
    RepositoryRegistry,
};
use weave_core::{
    CachePolicy, CancellationToken, Expiration, FederationConfig, FederationError, Location, Path,
    PoolConfig, Property, PropertyValue, SourceError, Timestamp, WeaveError,
};
use weave_federation::{
    ContributionKind, ExecutorOptions, FederatedRepository, Projection, ProjectionParser,
    SourceProjectionSet,
};
use weave_test_utils::assertions::*;
use weave_test_utils::fixtures::*;

fn at(text: &str) -> Location {
    Location::new(path(text))
}

fn read_node(at_path: &str) -> Command {
    Command::ReadNode { at: at(at_path) }
}

fn secs(now: Timestamp, seconds: i64) -> Timestamp {
    now + Duration::seconds(seconds)
}

/// Three sources that all have something at `/a`, plus a few extras.
fn populated() -> ThreeSourceFixture {
    let fixture = ThreeSourceFixture::new();

    let one = fixture.repository(SOURCE_1);
    one.create_path(&path("/source/one/a/x")).unwrap();
    one.set_property(&path("/source/one/a"), "p1", "one").unwrap();

    let two = fixture.repository(SOURCE_2);
    two.create_path(&path("/source/two/a/x")).unwrap();
    two.create_path(&path("/source/two/a/y")).unwrap();
    two.set_property(&path("/source/two/a"), "p1", "two").unwrap();
    two.set_property(&path("/source/two/a"), "p2", "two").unwrap();

    let three = fixture.repository(SOURCE_3);
    three.create_path(&path("/a/z")).unwrap();
    three.create_path(&path("/c")).unwrap();
    three.set_property(&path("/a"), "p3", "three").unwrap();

    fixture
}

// ============================================================================
// CONTRIBUTIONS AND MERGING
// ============================================================================

#[test]
fn contributions_follow_projection_order() {
    let fixture = populated();
    let mut executor = fixture.executor_at(Utc::now());
    for target in ["/", "/a", "/a/x", "/b", "/c", "/missing/deep"] {
        let contributions = executor.load_contributions(&at(target)).unwrap();
        let names: Vec<&str> = contributions.iter().map(|c| c.source_name()).collect();
        assert_eq!(names, vec![SOURCE_1, SOURCE_2, SOURCE_3], "at {}", target);
    }
}

#[test]
fn three_sources_merge_at_a() {
    let fixture = populated();
    let now = Utc::now();
    let mut executor = fixture.executor_at(now);
    let read = executor.read(&at("/a")).unwrap();

    assert_eq!(read.node.child_names(), vec!["x", "y", "z"]);
    assert_eq!(read.node.properties.get("p1"), Some(&PropertyValue::from("one")));
    assert_eq!(read.node.properties.get("p2"), Some(&PropertyValue::from("two")));
    assert_eq!(read.node.properties.get("p3"), Some(&PropertyValue::from("three")));
    assert!(!read.from_cache);

    let expirations: Vec<Expiration> = read
        .node
        .contributions
        .iter()
        .map(|c| c.expires_at())
        .collect();
    assert_eq!(
        expirations,
        vec![
            CachePolicy::from_secs(100).expires_at(now),
            CachePolicy::from_secs(200).expires_at(now),
            CachePolicy::from_secs(300).expires_at(now),
        ]
    );
}

#[test]
fn merged_node_expires_with_shortest_contribution() {
    let fixture = populated();
    let now = Utc::now();
    let result = fixture.execute_at(now, &read_node("/a")).unwrap();
    assert!(!result.expires_at.is_expired(secs(now, 99)));
    assert!(result.expires_at.is_expired(secs(now, 101)));
}

#[test]
fn placeholders_at_root() {
    let fixture = ThreeSourceFixture::new();
    let mut executor = fixture.executor_at(Utc::now());
    let read = executor.read(&Location::root()).unwrap();

    assert_eq!(read.node.child_names(), vec!["a", "b"]);
    let kinds: Vec<ContributionKind> = read.node.contributions.iter().map(|c| c.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            ContributionKind::Placeholder,
            ContributionKind::Placeholder,
            ContributionKind::Node,
        ]
    );
    assert_eq!(read.node.contributions[0].child_names(), vec!["a", "b"]);
    assert_eq!(read.node.contributions[1].child_names(), vec!["a"]);
    assert!(read.node.contributions[2].children().is_empty());
}

#[test]
fn repeated_reads_are_identical() {
    let fixture = populated();
    let now = Utc::now();
    let first = fixture.executor_at(now).read(&at("/a")).unwrap();
    let second = fixture.executor_at(secs(now, 1)).read(&at("/a")).unwrap();

    assert!(second.from_cache);
    assert_eq!(first.node.fingerprint(), second.node.fingerprint());
    assert_eq!(first.node.location, second.node.location);
    assert_eq!(first.node.children, second.node.children);
}

#[test]
fn missing_everywhere_is_path_not_found() {
    let fixture = populated();
    let result = fixture.execute_at(Utc::now(), &read_node("/nothing/here"));
    assert_path_not_found(&result);
}

#[test]
fn paths_are_normalized_before_reading() {
    let fixture = populated();
    let now = Utc::now();
    let result = fixture
        .execute_at(
            now,
            &Command::ReadChildren {
                of: at("/c/../a"),
            },
        )
        .unwrap();
    assert_eq!(child_names(&result.outcome), vec!["x", "y", "z"]);

    let above_root = fixture.execute_at(now, &read_node("/.."));
    assert_path_not_found(&above_root);
}

#[test]
fn subtree_is_assembled_in_pre_order() {
    let fixture = populated();
    let result = fixture
        .execute_at(
            Utc::now(),
            &Command::ReadSubtree {
                at: Location::root(),
                max_depth: 1,
            },
        )
        .unwrap();
    let CommandOutcome::Subtree(nodes) = result.outcome else {
        panic!("expected a subtree");
    };
    let paths: Vec<String> = nodes.iter().map(|n| n.path().to_string()).collect();
    assert_eq!(paths, vec!["/", "/a", "/b", "/c"]);
    assert!(!result.from_cache);
}

// ============================================================================
// EXCEPTIONS
// ============================================================================

#[test]
fn rule_exceptions_hide_source_subtrees() {
    let source = InMemorySource::new("Docs");
    source.repository().create_path(&Path::parse("/data/public").unwrap()).unwrap();
    source.repository().create_path(&Path::parse("/data/private/key").unwrap()).unwrap();
    let registry = Arc::new(RepositoryRegistry::new());
    registry.register(Arc::new(source), PoolConfig::default()).unwrap();

    let rules = ProjectionParser::new().parse_all(&["/docs => /data $ private"]).unwrap();
    let set = SourceProjectionSet::new(None, None, vec![Projection::new("Docs", rules).unwrap()])
        .unwrap();
    let repository = FederatedRepository::new("docs", set, registry);

    let children = repository
        .execute(&Command::ReadChildren { of: at("/docs") })
        .unwrap();
    assert_eq!(child_names(&children.outcome), vec!["public"]);

    let hidden = repository.execute(&read_node("/docs/private"));
    assert_path_not_found(&hidden);
    let below_hidden = repository.execute(&read_node("/docs/private/key"));
    assert_path_not_found(&below_hidden);
}

// ============================================================================
// CONNECTIONS
// ============================================================================

#[test]
fn rules_sharing_a_source_root_each_list_its_children() {
    let source = InMemorySource::new("Shared");
    source.repository().create_path(&path("/x/c")).unwrap();
    let registry = Arc::new(RepositoryRegistry::new());
    registry.register(Arc::new(source), PoolConfig::default()).unwrap();
    let rules = ProjectionParser::new()
        .parse_all(&["/a => /x", "/b => /x"])
        .unwrap();
    let set = SourceProjectionSet::new(None, None, vec![Projection::new("Shared", rules).unwrap()])
        .unwrap();
    let repository = FederatedRepository::new("shared", set, registry);

    for parent in ["/a", "/b"] {
        let result = repository
            .execute(&Command::ReadChildren { of: at(parent) })
            .unwrap();
        assert_eq!(child_names(&result.outcome), vec!["c"], "children of {}", parent);
        assert!(repository.execute(&read_node(&format!("{}/c", parent))).is_ok());
    }
}

#[test]
fn one_connection_per_source_per_operation() {
    let fixture = populated();
    let mut executor = fixture.executor_at(Utc::now());
    for target in ["/a", "/b", "/", "/c"] {
        executor.execute(&read_node(target)).unwrap();
    }
    for source in [CACHE, SOURCE_1, SOURCE_2, SOURCE_3] {
        assert_eq!(fixture.factory.created(source), 1, "{}", source);
        assert_eq!(fixture.factory.close_count(source), 0, "{}", source);
    }

    executor.close();
    executor.close();
    for source in [CACHE, SOURCE_1, SOURCE_2, SOURCE_3] {
        assert_eq!(fixture.factory.close_count(source), 1, "{}", source);
    }
}

#[test]
fn closing_an_unused_executor_does_nothing() {
    let fixture = ThreeSourceFixture::new();
    let mut executor = fixture.executor_at(Utc::now());
    executor.close();
    drop(executor);
    for source in [CACHE, SOURCE_1, SOURCE_2, SOURCE_3] {
        assert_eq!(fixture.factory.created(source), 0);
        assert_eq!(fixture.factory.close_count(source), 0);
    }
}

#[test]
fn dropping_an_executor_closes_its_connections() {
    let fixture = populated();
    {
        let mut executor = fixture.executor_at(Utc::now());
        executor.execute(&read_node("/a")).unwrap();
    }
    assert_eq!(fixture.factory.close_count(SOURCE_1), 1);
    assert_eq!(fixture.factory.close_count(CACHE), 1);
}

// ============================================================================
// CACHE
// ============================================================================

#[test]
fn fresh_cache_entry_short_circuits_sources() {
    let fixture = populated();
    let now = Utc::now();
    fixture.execute_at(now, &read_node("/a")).unwrap();
    let reads_before = fixture.factory.reads_against(SOURCE_1);

    let cached = fixture.execute_at(secs(now, 5), &read_node("/a")).unwrap();
    assert!(cached.from_cache);
    assert_eq!(child_names(&cached.outcome), vec!["x", "y", "z"]);
    assert_eq!(fixture.factory.reads_against(SOURCE_1), reads_before);
    assert_eq!(fixture.factory.created(SOURCE_1), 1);
    assert_eq!(fixture.factory.created(CACHE), 2);
}

#[test]
fn expired_cache_entry_reloads_only_expired_contributions() {
    let fixture = populated();
    let now = Utc::now();
    fixture.execute_at(now, &read_node("/a")).unwrap();
    fixture.factory.reset();

    // The cache entry expires after 10s; every contribution is still fresh.
    let reloaded = fixture.execute_at(secs(now, 10), &read_node("/a")).unwrap();
    assert!(!reloaded.from_cache);
    for source in [SOURCE_1, SOURCE_2, SOURCE_3] {
        assert_eq!(fixture.factory.reads_against(source), 0, "{}", source);
    }

    // Source 1's contribution expires at 100s, the others later.
    fixture.factory.reset();
    let reloaded = fixture.execute_at(secs(now, 110), &read_node("/a")).unwrap();
    assert!(!reloaded.from_cache);
    assert_eq!(fixture.factory.reads_against(SOURCE_1), 1);
    assert_eq!(fixture.factory.reads_against(SOURCE_2), 0);
    assert_eq!(fixture.factory.reads_against(SOURCE_3), 0);

    fixture.factory.reset();
    fixture.execute_at(secs(now, 310), &read_node("/a")).unwrap();
    for source in [SOURCE_1, SOURCE_2, SOURCE_3] {
        assert_eq!(fixture.factory.reads_against(source), 1, "{}", source);
    }
}

#[test]
fn cache_is_written_under_the_cache_projection() {
    let fixture = populated();
    fixture.execute_at(Utc::now(), &read_node("/a")).unwrap();
    let cached = fixture
        .repository(CACHE)
        .execute(&read_node("/cache/repo/A/a"))
        .unwrap();
    let node = cached.into_node().unwrap();
    assert!(node.properties.contains_key(weave_federation::MERGE_PLAN_PROPERTY));
    let names: Vec<&str> = node.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["x", "y", "z"]);
}

#[test]
fn writes_invalidate_the_cache() {
    let fixture = populated();
    let now = Utc::now();
    fixture.execute_at(now, &read_node("/a")).unwrap();

    fixture
        .execute_at(
            secs(now, 1),
            &Command::SetProperties {
                on: at("/a"),
                properties: vec![Property::new("p1", "changed")],
            },
        )
        .unwrap();

    let result = fixture.execute_at(secs(now, 2), &read_node("/a")).unwrap();
    assert!(!result.from_cache);
    let CommandOutcome::Node(node) = result.outcome else {
        panic!("expected a node");
    };
    assert_eq!(node.properties.get("p1"), Some(&PropertyValue::from("changed")));
}

#[test]
fn cache_population_is_one_commit_per_read() {
    let fixture = populated();
    let cache = fixture.repository(CACHE);
    let now = Utc::now();

    fixture.execute_at(now, &read_node("/a")).unwrap();
    // Missing cache ancestors, then the node with its child stubs.
    assert_eq!(cache.transaction_log().unwrap().len(), 2);

    let result = fixture.execute_at(secs(now, 20), &read_node("/a")).unwrap();
    assert!(!result.from_cache);
    let log = cache.transaction_log().unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(log[2].changes.len(), 4);
}

#[test]
fn unavailable_source_aborts_the_merge() {
    for parallel in [false, true] {
        let fixture = populated();
        fixture.factory.fail_source(SOURCE_2);
        let mut executor = fixture.executor_with(
            ExecutorOptions::new()
                .with_now(Utc::now())
                .with_parallel_fan_out(parallel),
        );
        let result = executor.execute(&read_node("/a"));

        match result {
            Err(WeaveError::Federation(FederationError::SourceFailed {
                source_name,
                path: failed_at,
                error: SourceError::Unavailable { .. },
            })) => {
                assert_eq!(source_name, SOURCE_2);
                assert_eq!(failed_at, path("/a"));
            }
            other => panic!("Expected SourceFailed from Source 2, got: {:?}", other),
        }
        if !parallel {
            assert_eq!(fixture.factory.reads_against(SOURCE_1), 1);
        }
        assert_eq!(fixture.factory.writes_against(CACHE), 0);
        let cached = fixture.repository(CACHE).snapshot().unwrap();
        assert!(!cached.contains(&path("/cache/repo/A/a")));
    }
}

// ============================================================================
// WRITES
// ============================================================================

#[test]
fn writes_go_to_the_single_owning_source() {
    let fixture = populated();
    let result = fixture
        .execute_at(
            Utc::now(),
            &Command::CreateNode {
                under: at("/a"),
                name: "new".to_string(),
                properties: vec![Property::new("k", "v")],
                conflict: ConflictBehavior::Update,
            },
        )
        .unwrap();

    let CommandOutcome::Written { location } = result.outcome else {
        panic!("expected a write outcome");
    };
    assert_eq!(location.path(), &path("/a/new"));
    assert_eq!(fixture.factory.writes_against(SOURCE_1), 1);
    assert_eq!(fixture.factory.writes_against(SOURCE_2), 0);
    assert_eq!(fixture.factory.writes_against(SOURCE_3), 0);
    assert!(fixture
        .repository(SOURCE_1)
        .execute(&read_node("/source/one/a/new"))
        .is_ok());
}

#[test]
fn writes_outside_mounted_regions_go_to_the_root_source() {
    let fixture = populated();
    fixture
        .execute_at(
            Utc::now(),
            &Command::CreateNode {
                under: Location::root(),
                name: "d".to_string(),
                properties: Vec::new(),
                conflict: ConflictBehavior::DoNotReplace,
            },
        )
        .unwrap();
    assert_eq!(fixture.factory.writes_against(SOURCE_1), 0);
    assert_eq!(fixture.factory.writes_against(SOURCE_3), 1);
    assert!(fixture.repository(SOURCE_3).execute(&read_node("/d")).is_ok());
}

#[test]
fn write_without_any_projection_is_path_not_found() {
    let source = InMemorySource::new("Only");
    let registry = Arc::new(RepositoryRegistry::new());
    registry.register(Arc::new(source), PoolConfig::default()).unwrap();
    let rules = ProjectionParser::new().parse_all(&["/a => /only/a"]).unwrap();
    let set = SourceProjectionSet::new(None, None, vec![Projection::new("Only", rules).unwrap()])
        .unwrap();
    let repository = FederatedRepository::new("only", set, registry);

    let result = repository.execute(&Command::CreateNode {
        under: at("/elsewhere"),
        name: "x".to_string(),
        properties: Vec::new(),
        conflict: ConflictBehavior::Update,
    });
    assert_path_not_found(&result);
}

#[test]
fn read_only_projection_rejects_writes() {
    let fixture = populated().with_read_only(&[SOURCE_1]);
    let result = fixture.execute_at(
        Utc::now(),
        &Command::DeleteSubtree {
            at: at("/a/x"),
        },
    );
    assert_unsupported(&result);
    assert_eq!(fixture.factory.writes_against(SOURCE_1), 0);
    assert_eq!(fixture.factory.writes_against(SOURCE_2), 0);

    // Reads through a read-only projection still work.
    let read = fixture.execute_at(Utc::now(), &read_node("/a/x")).unwrap();
    assert!(!read.from_cache);
}

#[test]
fn moves_stay_within_one_source() {
    let fixture = populated();
    let now = Utc::now();

    let across = fixture.execute_at(
        now,
        &Command::MoveSubtree {
            from: at("/a/x"),
            into: at("/c"),
        },
    );
    assert_unsupported(&across);

    fixture
        .execute_at(
            now,
            &Command::MoveSubtree {
                from: at("/a/x"),
                into: at("/b"),
            },
        )
        .unwrap();
    let b = fixture
        .execute_at(secs(now, 1), &Command::ReadChildren { of: at("/b") })
        .unwrap();
    assert_eq!(child_names(&b.outcome), vec!["x"]);
}

// ============================================================================
// CANCELLATION AND FAN-OUT
// ============================================================================

#[test]
fn cancellation_stops_before_any_source_call() {
    let fixture = populated();
    let token = CancellationToken::new();
    token.cancel();
    let mut executor = fixture.executor_with(ExecutorOptions::new().with_cancellation(token));
    let result = executor.execute(&read_node("/a"));
    assert_cancelled(&result);
    for source in [CACHE, SOURCE_1, SOURCE_2, SOURCE_3] {
        assert_eq!(fixture.factory.created(source), 0);
    }
}

#[test]
fn cancellation_between_commands() {
    let fixture = populated();
    let token = CancellationToken::new();
    let mut executor =
        fixture.executor_with(ExecutorOptions::new().with_cancellation(token.clone()));
    executor.execute(&read_node("/a")).unwrap();
    token.cancel();
    assert_cancelled(&executor.execute(&read_node("/b")));
}

#[test]
fn cancellation_interrupts_waiting_for_an_exhausted_pool() {
    let fixture = populated();
    let pool = fixture.registry.pool(SOURCE_2).unwrap();
    pool.set_maximum_size(1).unwrap();
    let _held = fixture.registry.create_connection(SOURCE_2).unwrap();

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(50));
            token.cancel();
        })
    };
    let mut executor = fixture.executor_with(ExecutorOptions::new().with_cancellation(token));
    let started = Instant::now();
    let result = executor.execute(&read_node("/a"));
    canceller.join().unwrap();

    assert_cancelled(&result);
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert_eq!(fixture.factory.created(SOURCE_2), 0);
}

#[test]
fn parallel_fan_out_matches_sequential() {
    let fixture = populated();
    let now = Utc::now();
    let mut sequential = fixture.executor_at(now);
    let mut parallel =
        fixture.executor_with(ExecutorOptions::new().with_now(now).with_parallel_fan_out(true));

    for target in ["/", "/a", "/a/x", "/c"] {
        let expected = sequential.load_contributions(&at(target)).unwrap();
        let actual = parallel.load_contributions(&at(target)).unwrap();
        assert_eq!(actual, expected, "at {}", target);
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[test]
fn repository_from_configuration() {
    let fixture = ThreeSourceFixture::new();
    let repository = FederatedRepository::from_config(&fixture.config, fixture.factory.clone())
        .unwrap();
    assert_eq!(repository.name(), "Federated Source");
    assert_eq!(repository.projections().len(), 3);
    assert!(repository.projections().cache_projection().is_some());

    let root = repository
        .execute(&Command::ReadChildren {
            of: Location::root(),
        })
        .unwrap();
    assert_eq!(child_names(&root.outcome), vec!["a", "b"]);
}

#[test]
fn configured_source_policy_applies_without_connection_default() {
    let source = InMemorySource::new("Plain");
    source.repository().create_path(&Path::parse("/n").unwrap()).unwrap();
    let registry = Arc::new(RepositoryRegistry::new());
    registry.register(Arc::new(source), PoolConfig::default()).unwrap();
    let rules = ProjectionParser::new().parse_all(&["/ => /"]).unwrap();
    let set = SourceProjectionSet::new(None, None, vec![Projection::new("Plain", rules).unwrap()])
        .unwrap()
        .with_configured_policy("Plain", CachePolicy::from_secs(42));
    let repository = FederatedRepository::new("plain", set, registry);

    let now = Utc::now();
    let mut executor = repository.executor_with(ExecutorOptions::new().with_now(now));
    let result = executor.execute(&read_node("/n")).unwrap();
    assert_eq!(result.expires_at, CachePolicy::from_secs(42).expires_at(now));
}

#[test]
fn projections_read_and_write_their_configured_workspace() {
    let config = FederationConfig::from_toml_str(
        r#"
name = "Workspaces"

[[projections]]
source = "Versioned"
workspace = "published"
rules = ["/ => /"]
"#,
    )
    .unwrap();
    let source = InMemorySource::new("Versioned").with_workspace("published");
    source.repository().create_path(&path("/doc/draft")).unwrap();
    let published = Arc::clone(source.workspace("published").unwrap());
    published.create_path(&path("/doc/live")).unwrap();
    let registry = Arc::new(RepositoryRegistry::new());
    registry
        .register_configured(Arc::new(source.clone()), &config)
        .unwrap();
    let repository = FederatedRepository::from_config(&config, registry).unwrap();

    let children = repository
        .execute(&Command::ReadChildren { of: at("/doc") })
        .unwrap();
    assert_eq!(child_names(&children.outcome), vec!["live"]);

    repository
        .execute(&Command::CreateNode {
            under: at("/doc"),
            name: "new".to_string(),
            properties: vec![],
            conflict: ConflictBehavior::DoNotReplace,
        })
        .unwrap();
    assert!(published.snapshot().unwrap().contains(&path("/doc/new")));
    assert!(!source.repository().snapshot().unwrap().contains(&path("/doc/new")));
}
