//! Zone-aware relationship-based authorization engine
//!
//! This crate implements a Zanzibar-style authorization graph providing:
//! - Relationship tuples partitioned by zone (tenant), with a narrow set of
//!   sharing relations allowed to cross zones
//! - Namespace definitions expanding permissions into unions of relations and
//!   tuple-to-userset hops
//! - Breadth-first check, expand and explain over cyclic graphs with depth,
//!   node and time budgets
//! - A two-level check cache with a circuit breaker on the shared level
//! - Per-zone revisions and zookies for read-after-write consistency
//!
//! # Core Concepts
//!
//! - **Entity**: a `type:id` pair naming a user, group, file, ...
//! - **Subject**: an entity, or a userset such as `group:eng#member`
//! - **Tuple**: "subject has relation on object" stored in a zone
//! - **Zookie**: opaque token naming a zone revision a read must observe
//!
//! # Example
//!
//! ```rust,no_run
//! use auth_rebac::{CheckRequest, Entity, InMemoryTupleRepository, RebacEngine, Subject, TupleWrite};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = RebacEngine::with_defaults(Arc::new(InMemoryTupleRepository::new()))?;
//!
//!     engine
//!         .rebac_create(TupleWrite::new(Entity::user("alice"), "member-of", Entity::group("eng")))
//!         .await?;
//!     let written = engine
//!         .rebac_create(TupleWrite::new(
//!             Subject::userset("group", "eng", "member"),
//!             "direct_owner",
//!             Entity::file("/readme"),
//!         ))
//!         .await?;
//!
//!     let allowed = engine
//!         .rebac_check(
//!             CheckRequest::new(Entity::user("alice"), "read", Entity::file("/readme"))
//!                 .with_min_zookie(&written.zookie),
//!         )
//!         .await?;
//!     assert!(allowed);
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod check;
pub mod config;
pub mod consistency;
pub mod engine;
pub mod error;
pub mod graph;
pub mod logging;
pub mod models;
pub mod repository;
pub mod revision;
pub mod schema;
pub mod telemetry;
pub mod zone;
pub mod zookie;

pub use cache::{CacheLayer, CacheLookup, CacheRead, CacheStore, CircuitBreaker};
pub use check::{BfsTraversal, TraversalEngine, TraversalLimits};
pub use config::EngineConfig;
pub use consistency::{
    resolve_action, ConsistencyAction, ConsistencyController, ConsistencyLevel, ConsistencyOutcome,
    StorageConsistency,
};
pub use engine::*;
pub use error::*;
pub use models::*;
pub use repository::{postgres::PostgresTupleRepository, InMemoryTupleRepository, TupleRepository};
pub use revision::RevisionTracker;
pub use schema::*;
pub use zone::{ZoneIsolationGuard, CROSS_ZONE_ALLOWED_RELATIONS};
pub use zookie::Zookie;
