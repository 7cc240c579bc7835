use crate::{
    cache::{CacheLayer, CacheStore, CheckKey},
    check::{BfsTraversal, TraversalEngine},
    config::EngineConfig,
    consistency::{ConsistencyController, ConsistencyLevel},
    error::RebacError,
    graph::TupleGraph,
    models::*,
    repository::TupleRepository,
    revision::RevisionTracker,
    schema::{NamespaceConfig, NamespaceRegistry},
    telemetry::{Stage, TraceHooks},
    zone::ZoneIsolationGuard,
    zookie::Zookie,
};
use ahash::AHashMap;
use dashmap::DashMap;
use petgraph::{algo::has_path_connecting, graph::DiGraph};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, Instrument};

/// A single permission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub subject: Entity,
    pub permission: String,
    pub object: Entity,
    /// Falls back to the engine's default zone.
    pub zone_id: Option<String>,
    /// Falls back to the configured default level.
    pub consistency: Option<ConsistencyLevel>,
    /// Zookie from an earlier write the read must observe.
    pub min_zookie: Option<String>,
}

impl CheckRequest {
    pub fn new(subject: Entity, permission: &str, object: Entity) -> Self {
        Self {
            subject,
            permission: permission.to_string(),
            object,
            zone_id: None,
            consistency: None,
            min_zookie: None,
        }
    }

    pub fn in_zone(mut self, zone_id: &str) -> Self {
        self.zone_id = Some(zone_id.to_string());
        self
    }

    pub fn with_consistency(mut self, level: ConsistencyLevel) -> Self {
        self.consistency = Some(level);
        self
    }

    pub fn with_min_zookie(mut self, zookie: &str) -> Self {
        self.min_zookie = Some(zookie.to_string());
        self
    }
}

/// Zone-aware relationship-based authorization engine
pub struct RebacEngine {
    /// Storage for relationship tuples
    repository: Arc<dyn TupleRepository>,

    /// Namespace definitions keyed by object type
    registry: Arc<NamespaceRegistry>,

    traversal: Arc<dyn TraversalEngine>,

    cache: CacheLayer,

    tracker: Arc<RevisionTracker>,

    consistency: Arc<ConsistencyController>,

    hooks: TraceHooks,

    /// Serializes writes within a zone
    write_locks: DashMap<String, Arc<Mutex<()>>>,

    config: EngineConfig,
}

impl RebacEngine {
    /// Create an engine over `repository` with the given namespaces.
    pub fn new(
        repository: Arc<dyn TupleRepository>,
        registry: Arc<NamespaceRegistry>,
        config: EngineConfig,
    ) -> Result<Self, RebacError> {
        config.validate()?;

        let tracker = Arc::new(RevisionTracker::new());
        let storage = config
            .consistency
            .storage_mode
            .unwrap_or_else(|| repository.consistency_mode());
        let consistency = Arc::new(ConsistencyController::new(tracker.clone(), storage));
        let traversal: Arc<dyn TraversalEngine> = Arc::new(BfsTraversal::new(config.traversal.limits()));

        info!(
            default_zone = %config.default_zone,
            storage = ?storage,
            cache_enabled = config.cache.enabled,
            "ReBAC engine initialized"
        );

        Ok(Self {
            repository,
            registry,
            traversal,
            cache: CacheLayer::new(config.cache.clone()),
            tracker,
            consistency,
            hooks: TraceHooks::new(config.tracing_enabled),
            write_locks: DashMap::new(),
            config,
        })
    }

    /// Engine with the default `file` and `group` namespaces and default config.
    pub fn with_defaults(repository: Arc<dyn TupleRepository>) -> Result<Self, RebacError> {
        Self::new(
            repository,
            Arc::new(NamespaceRegistry::with_defaults()),
            EngineConfig::default(),
        )
    }

    /// Attach a shared L2 cache store.
    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = CacheLayer::new(self.config.cache.clone()).with_store(store);
        self
    }

    pub fn with_traversal(mut self, traversal: Arc<dyn TraversalEngine>) -> Self {
        self.traversal = traversal;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NamespaceRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<RevisionTracker> {
        &self.tracker
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    pub fn current_revision(&self, zone_id: &str) -> u64 {
        self.tracker.current(zone_id)
    }

    /// Install or replace a namespace. Cached results are dropped since they
    /// were computed under the old definition.
    pub fn register_namespace(&self, object_type: &str, config: NamespaceConfig) -> Result<(), RebacError> {
        self.registry.register(object_type, config)?;
        self.cache.invalidate_all();
        Ok(())
    }

    fn zone_or_default<'a>(&'a self, zone_id: Option<&'a str>) -> &'a str {
        zone_id.unwrap_or(&self.config.default_zone)
    }

    fn zone_lock(&self, zone_id: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(zone_id.to_string())
            .or_default()
            .clone()
    }

    // =============================================================================
    // Tuple Management
    // =============================================================================

    /// Write a relationship tuple.
    ///
    /// Rejected with `ZoneIsolation` for cross-zone writes outside the sharing
    /// relations and with `CycleDetected` when a hierarchical relation would
    /// loop. On success the zone's cache is invalidated and its revision
    /// advanced before the zookie is returned.
    pub async fn rebac_create(&self, write: TupleWrite) -> Result<WriteOutcome, RebacError> {
        validate_write_shape(&write)?;

        let subject_zone = write.subject_zone().to_string();
        let tuple = write.into_tuple();
        let zone_id = tuple.zone_id.clone();

        let lock = self.zone_lock(&zone_id);
        let _guard = lock.lock().await;

        ZoneIsolationGuard::validate_tuple(&tuple)?;
        if !tuple.subject.is_userset() && self.registry.is_hierarchical(&tuple.object.entity_type, &tuple.relation)
        {
            self.check_cycle(&tuple).await?;
        }

        let tuple_id = tuple.tuple_id;
        info!("Writing tuple: {}", tuple);
        self.repository.insert(tuple).await?;

        // Both zones are invalidated and the subject zone advanced before the
        // zookie's zone, whose increment wakes readers holding the zookie.
        self.cache.invalidate_zone(&zone_id).await;
        if subject_zone != zone_id {
            self.cache.invalidate_zone(&subject_zone).await;
            self.tracker.increment_and_get(&subject_zone);
        }
        let revision = self.tracker.increment_and_get(&zone_id);

        Ok(WriteOutcome {
            tuple_id,
            revision,
            zookie: Zookie::encode(&zone_id, revision).into_string(),
        })
    }

    /// Delete a tuple by id. Returns `false` if it does not exist.
    pub async fn rebac_delete(&self, tuple_id: TupleId) -> Result<bool, RebacError> {
        let lock = self
            .repository
            .get(tuple_id)
            .await?
            .map(|tuple| self.zone_lock(&tuple.zone_id));
        let _guard = match lock {
            Some(ref lock) => Some(lock.lock().await),
            None => None,
        };

        let Some(tuple) = self.repository.delete(tuple_id).await? else {
            debug!(%tuple_id, "delete of unknown tuple");
            return Ok(false);
        };
        info!("Deleted tuple: {}", tuple);

        self.cache.invalidate_object(&tuple.zone_id, &tuple.object).await;
        if tuple.subject_zone_id != tuple.zone_id {
            self.cache.invalidate_zone(&tuple.subject_zone_id).await;
            self.tracker.increment_and_get(&tuple.subject_zone_id);
        }
        self.tracker.increment_and_get(&tuple.zone_id);
        Ok(true)
    }

    /// Read tuples matching the filter; `None` fields match anything.
    pub async fn rebac_list_tuples(&self, filter: TupleFilter) -> Result<Vec<RelationshipTuple>, RebacError> {
        self.repository.list_tuples(&filter).await
    }

    /// Would `tuple` close a loop among the zone's hierarchical edges?
    async fn check_cycle(&self, tuple: &RelationshipTuple) -> Result<(), RebacError> {
        let cycle = || RebacError::CycleDetected {
            relation: tuple.relation.clone(),
            subject: tuple.subject.entity.to_string(),
            object: tuple.object.to_string(),
        };
        if tuple.subject.entity == tuple.object {
            return Err(cycle());
        }

        let edges = self
            .repository
            .list_tuples(&TupleFilter::new().relation(&tuple.relation).zone(&tuple.zone_id))
            .await?;

        let mut graph = DiGraph::<Entity, ()>::new();
        let mut nodes = HashMap::new();
        let mut node = |graph: &mut DiGraph<Entity, ()>, entity: &Entity| {
            *nodes
                .entry(entity.clone())
                .or_insert_with(|| graph.add_node(entity.clone()))
        };
        for edge in edges.iter().filter(|edge| !edge.subject.is_userset()) {
            let from = node(&mut graph, &edge.subject.entity);
            let to = node(&mut graph, &edge.object);
            graph.add_edge(from, to, ());
        }
        let object = node(&mut graph, &tuple.object);
        let subject = node(&mut graph, &tuple.subject.entity);

        if has_path_connecting(&graph, object, subject, None) {
            info!(
                relation = %tuple.relation,
                subject = %tuple.subject.entity,
                object = %tuple.object,
                "rejected write that would create a cycle"
            );
            return Err(cycle());
        }
        Ok(())
    }

    // =============================================================================
    // Core Authorization Operations
    // =============================================================================

    /// Check whether `request.subject` holds `request.permission` on `request.object`.
    pub async fn rebac_check(&self, request: CheckRequest) -> Result<bool, RebacError> {
        validate_check_shape(&request.subject, &request.permission, &request.object)?;

        let zone_id = self.zone_or_default(request.zone_id.as_deref()).to_string();
        let level = request
            .consistency
            .unwrap_or(self.config.consistency.default_level);

        let span = self
            .hooks
            .stage_span(Stage::Consistency, &zone_id, &request.permission, &request.object);
        let outcome = self
            .consistency
            .enforce_async(level, request.min_zookie.as_deref(), self.config.consistency.wait_timeout())
            .instrument(span)
            .await?;
        self.hooks.on_consistency(&outcome);

        let mut graphs = AHashMap::new();
        self.decide(&zone_id, &request.subject, &request.permission, &request.object, &mut graphs)
            .await
    }

    /// Check many triples in one zone. Results keep the input order.
    pub async fn rebac_check_batch(
        &self,
        items: Vec<CheckItem>,
        zone_id: Option<&str>,
    ) -> Result<Vec<bool>, RebacError> {
        for item in &items {
            validate_check_shape(&item.subject, &item.permission, &item.object)?;
        }
        let zone_id = self.zone_or_default(zone_id).to_string();

        // One fetch per distinct subject.
        let mut graphs = AHashMap::new();
        let mut results = Vec::with_capacity(items.len());
        for item in &items {
            results.push(
                self.decide(&zone_id, &item.subject, &item.permission, &item.object, &mut graphs)
                    .await?,
            );
        }
        Ok(results)
    }

    /// All subjects holding `permission` on `object`.
    pub async fn rebac_expand(
        &self,
        permission: &str,
        object: &Entity,
        zone_id: Option<&str>,
    ) -> Result<Vec<Entity>, RebacError> {
        validate_permission(permission)?;
        object.validate().map_err(invalid_object)?;
        let zone_id = self.zone_or_default(zone_id);

        let tuples = self.repository.fetch_tuples_for_traversal(zone_id, None).await?;
        let graph = TupleGraph::from_tuples(tuples);
        let span = self.hooks.stage_span(Stage::Traversal, zone_id, permission, object);
        let _entered = span.enter();
        self.traversal
            .expand(&graph, &self.registry, permission, object)
            .map_err(|e| {
                if let RebacError::GraphLimitExceeded(limit) = e {
                    self.hooks.on_limit_exceeded(&span, limit);
                }
                e
            })
    }

    /// Like `rebac_check` but returns the path found. "No path" and limit
    /// exhaustion are reported in the explanation, not as errors.
    pub async fn rebac_explain(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: Option<&str>,
    ) -> Result<Explanation, RebacError> {
        validate_check_shape(subject, permission, object)?;
        let zone_id = self.zone_or_default(zone_id);

        let tuples = self
            .repository
            .fetch_tuples_for_traversal(zone_id, Some(subject))
            .await?;
        let graph = TupleGraph::from_tuples(tuples);
        let result = self
            .traversal
            .search(&graph, &self.registry, subject, permission, object);
        debug!(%subject, permission, %object, outcome = ?result.outcome, "explained permission");

        Ok(Explanation {
            subject: subject.clone(),
            permission: permission.to_string(),
            object: object.clone(),
            zone_id: zone_id.to_string(),
            outcome: result.outcome,
            path: result.path,
            visited_nodes: result.visited_nodes,
        })
    }

    /// Objects of `object_type` on which `subject` holds `permission`, sorted.
    pub async fn rebac_list_objects(
        &self,
        subject: &Entity,
        permission: &str,
        object_type: &str,
        zone_id: Option<&str>,
    ) -> Result<Vec<Entity>, RebacError> {
        subject.validate().map_err(invalid_subject)?;
        validate_permission(permission)?;
        if object_type.is_empty() {
            return Err(RebacError::InvalidObject("object type must be non-empty".to_string()));
        }
        let zone_id = self.zone_or_default(zone_id);

        let tuples = self
            .repository
            .fetch_tuples_for_traversal(zone_id, Some(subject))
            .await?;
        let graph = TupleGraph::from_tuples(tuples);

        let mut objects = Vec::new();
        for candidate in graph.entities_of_type(object_type) {
            let decision = self
                .traversal
                .check(&graph, &self.registry, subject, permission, &candidate)?;
            if decision.allowed {
                objects.push(candidate);
            }
        }
        debug!(%subject, permission, object_type, count = objects.len(), "listed objects");
        Ok(objects)
    }

    /// Cache, then traversal. `graphs` memoizes fetched tuples per subject.
    async fn decide(
        &self,
        zone_id: &str,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        graphs: &mut AHashMap<Entity, TupleGraph>,
    ) -> Result<bool, RebacError> {
        let revision = self.tracker.current(zone_id);
        let key = CheckKey::new(zone_id, subject, permission, object);

        let lookup_span = self.hooks.stage_span(Stage::CacheLookup, zone_id, permission, object);
        let read = self.cache.get(&key, revision).instrument(lookup_span).await;
        self.hooks.on_cache_lookup(read.lookup);

        let decision_span = self.hooks.stage_span(Stage::Decision, zone_id, permission, object);
        if let Some(allowed) = read.lookup.value() {
            debug!(%subject, permission, %object, allowed, "cache hit");
            self.hooks.record_decision(&decision_span, allowed);
            return Ok(allowed);
        }

        if !graphs.contains_key(subject) {
            let tuples = self
                .repository
                .fetch_tuples_for_traversal(zone_id, Some(subject))
                .await?;
            graphs.insert(subject.clone(), TupleGraph::from_tuples(tuples));
        }
        let graph = graphs
            .get(subject)
            .ok_or_else(|| RebacError::InternalError(anyhow::anyhow!("tuple graph missing for {}", subject)))?;

        let traversal_span = self.hooks.stage_span(Stage::Traversal, zone_id, permission, object);
        let decision = {
            let _entered = traversal_span.enter();
            self.traversal.check(graph, &self.registry, subject, permission, object)
        };
        let decision = match decision {
            Ok(decision) => decision,
            Err(RebacError::GraphLimitExceeded(limit)) => {
                self.hooks.on_limit_exceeded(&decision_span, limit);
                return Err(RebacError::GraphLimitExceeded(limit));
            }
            Err(e) => return Err(e),
        };
        self.hooks.on_traversal(decision.visited_nodes);

        self.cache
            .set(&key, revision, decision.allowed, read.l2_key())
            .await;
        self.hooks.record_decision(&decision_span, decision.allowed);
        debug!(%subject, permission, %object, allowed = decision.allowed, "permission checked");
        Ok(decision.allowed)
    }
}

fn invalid_subject(e: RebacError) -> RebacError {
    RebacError::InvalidSubject(e.to_string())
}

fn invalid_object(e: RebacError) -> RebacError {
    RebacError::InvalidObject(e.to_string())
}

fn validate_permission(permission: &str) -> Result<(), RebacError> {
    if permission.is_empty() || permission.contains([':', '#']) {
        return Err(RebacError::InvalidRelation(format!(
            "'{}' is not a valid relation name",
            permission
        )));
    }
    Ok(())
}

fn validate_check_shape(subject: &Entity, permission: &str, object: &Entity) -> Result<(), RebacError> {
    subject.validate().map_err(invalid_subject)?;
    validate_permission(permission)?;
    object.validate().map_err(invalid_object)
}

fn validate_write_shape(write: &TupleWrite) -> Result<(), RebacError> {
    write.subject.validate()?;
    validate_permission(&write.relation)?;
    write.object.validate().map_err(invalid_object)?;
    if write.object.is_wildcard() {
        return Err(RebacError::InvalidObject("the wildcard cannot be an object".to_string()));
    }
    for zone in [write.zone_id.as_str(), write.subject_zone(), write.object_zone()] {
        if zone.is_empty() {
            return Err(RebacError::ValidationError("zone ids must be non-empty".to_string()));
        }
    }
    Ok(())
}
