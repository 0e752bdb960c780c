//! WEAVE Federation
//!
//! Presents several sources as one repository:
//!
//! - [`Rule`] / [`ProjectionParser`]: path translation rules and their text form
//! - [`Projection`] / [`SourceProjectionSet`]: which source serves which region
//! - [`Contribution`] / [`merge_contributions`]: first-wins merging with expiration
//! - [`FederatingExecutor`]: cache-first reads, single-source writes
//! - [`FederatedRepository`]: hands out one executor per operation

pub mod connection_manager;
pub mod contribution;
pub mod executor;
pub mod merge;
pub mod parser;
pub mod policy;
pub mod projection;
pub mod projection_set;
pub mod repository;
pub mod rule;

pub use connection_manager::{ConnectionKey, ConnectionManager};
pub use contribution::{Contribution, ContributionKind};
pub use executor::{ExecutionResult, ExecutorOptions, FederatedRead, FederatingExecutor};
pub use merge::{merge_contributions, MergePlan, MergeStrategy, MergedNode, MERGE_PLAN_PROPERTY};
pub use parser::{parse_path_rule, ProjectionParser, RuleParserFn};
pub use policy::PolicyResolver;
pub use projection::Projection;
pub use projection_set::SourceProjectionSet;
pub use repository::FederatedRepository;
pub use rule::{OffsetRule, PathRule, Rule};
