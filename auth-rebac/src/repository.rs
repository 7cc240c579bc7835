use crate::{
    consistency::StorageConsistency,
    error::RebacError,
    models::*,
    zone::ZoneIsolationGuard,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

pub mod postgres;

/// Storage contract the engine depends on. Implementations own durability;
/// the engine owns validation, zone rules and cache/revision bookkeeping.
#[async_trait]
pub trait TupleRepository: Send + Sync {
    /// Persist a validated tuple.
    async fn insert(&self, tuple: RelationshipTuple) -> Result<(), RebacError>;

    /// Hard-delete by id, returning the removed tuple if it existed.
    async fn delete(&self, tuple_id: TupleId) -> Result<Option<RelationshipTuple>, RebacError>;

    async fn get(&self, tuple_id: TupleId) -> Result<Option<RelationshipTuple>, RebacError>;

    /// Unexpired tuples a traversal in `zone_id` may use: everything stored in
    /// the zone, plus, when `subject` is given, shares naming that subject
    /// whose subject zone is `zone_id`.
    async fn fetch_tuples_for_traversal(
        &self,
        zone_id: &str,
        subject: Option<&Entity>,
    ) -> Result<Vec<RelationshipTuple>, RebacError>;

    /// Unexpired tuples matching the filter; `None` fields are wildcards.
    async fn list_tuples(&self, filter: &TupleFilter) -> Result<Vec<RelationshipTuple>, RebacError>;

    /// Whether a committed write is visible to every subsequent read.
    fn consistency_mode(&self) -> StorageConsistency;
}

/// In-memory tuple repository for testing and embedded use.
pub struct InMemoryTupleRepository {
    tuples: Arc<DashMap<TupleId, RelationshipTuple>>,
    consistency: StorageConsistency,
}

impl InMemoryTupleRepository {
    pub fn new() -> Self {
        Self {
            tuples: Arc::new(DashMap::new()),
            consistency: StorageConsistency::StronglyConsistent,
        }
    }

    /// Report a different consistency mode, e.g. to stand in for a replicated store.
    pub fn with_consistency(mut self, consistency: StorageConsistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}

impl Default for InMemoryTupleRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn subject_is(tuple: &RelationshipTuple, subject: &Entity) -> bool {
    tuple.subject.relation.is_none() && tuple.subject.entity == *subject
}

#[async_trait]
impl TupleRepository for InMemoryTupleRepository {
    async fn insert(&self, tuple: RelationshipTuple) -> Result<(), RebacError> {
        self.tuples.insert(tuple.tuple_id, tuple);
        Ok(())
    }

    async fn delete(&self, tuple_id: TupleId) -> Result<Option<RelationshipTuple>, RebacError> {
        Ok(self.tuples.remove(&tuple_id).map(|(_, tuple)| tuple))
    }

    async fn get(&self, tuple_id: TupleId) -> Result<Option<RelationshipTuple>, RebacError> {
        let now = Utc::now();
        Ok(self
            .tuples
            .get(&tuple_id)
            .map(|entry| entry.value().clone())
            .filter(|tuple| !tuple.is_expired(now)))
    }

    async fn fetch_tuples_for_traversal(
        &self,
        zone_id: &str,
        subject: Option<&Entity>,
    ) -> Result<Vec<RelationshipTuple>, RebacError> {
        let now = Utc::now();
        let tuples = self
            .tuples
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|tuple| !tuple.is_expired(now))
            .filter(|tuple| {
                if tuple.zone_id == zone_id {
                    return true;
                }
                match subject {
                    Some(subject) => {
                        ZoneIsolationGuard::tuple_visible_in_zone(tuple, zone_id, true)
                            && subject_is(tuple, subject)
                    }
                    None => false,
                }
            })
            .collect();
        Ok(tuples)
    }

    async fn list_tuples(&self, filter: &TupleFilter) -> Result<Vec<RelationshipTuple>, RebacError> {
        let now = Utc::now();
        let mut tuples: Vec<RelationshipTuple> = self
            .tuples
            .iter()
            .filter(|entry| !entry.value().is_expired(now) && filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        tuples.sort_by_key(|tuple| tuple.created_at);
        Ok(tuples)
    }

    fn consistency_mode(&self) -> StorageConsistency {
        self.consistency
    }
}
