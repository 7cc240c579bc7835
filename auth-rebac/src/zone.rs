use crate::{error::RebacError, models::RelationshipTuple};
use tracing::warn;

/// Relations allowed to link a subject in one zone to an object in another.
pub const CROSS_ZONE_ALLOWED_RELATIONS: [&str; 3] = ["shared-viewer", "shared-editor", "shared-owner"];

/// Enforces tenant isolation on writes and decides cross-zone visibility on reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZoneIsolationGuard;

impl ZoneIsolationGuard {
    pub fn is_cross_zone_relation(relation: &str) -> bool {
        CROSS_ZONE_ALLOWED_RELATIONS.contains(&relation)
    }

    /// Reject writes whose subject and object live in different zones unless the
    /// relation is one of the sharing relations.
    pub fn validate_write(
        subject_zone: &str,
        object_zone: &str,
        relation: &str,
    ) -> Result<(), RebacError> {
        if subject_zone == object_zone || Self::is_cross_zone_relation(relation) {
            return Ok(());
        }
        warn!(
            relation,
            subject_zone, object_zone, "rejected cross-zone write"
        );
        Err(RebacError::ZoneIsolation {
            relation: relation.to_string(),
            subject_zone: subject_zone.to_string(),
            object_zone: object_zone.to_string(),
        })
    }

    /// Full write-time check: the tuple's own zone must be the object's zone, and
    /// the subject may only differ through a sharing relation.
    pub fn validate_tuple(tuple: &RelationshipTuple) -> Result<(), RebacError> {
        if tuple.object_zone_id != tuple.zone_id {
            return Err(RebacError::ZoneIsolation {
                relation: tuple.relation.clone(),
                subject_zone: tuple.zone_id.clone(),
                object_zone: tuple.object_zone_id.clone(),
            });
        }
        Self::validate_write(&tuple.subject_zone_id, &tuple.object_zone_id, &tuple.relation)
    }

    /// Whether `tuple` takes part in a traversal running in `query_zone`.
    ///
    /// Tuples stored in the zone are always visible. A tuple stored elsewhere is
    /// visible only when it is a share whose subject lives in `query_zone`, and
    /// only when the fetch is on behalf of a specific subject.
    pub fn tuple_visible_in_zone(
        tuple: &RelationshipTuple,
        query_zone: &str,
        include_subject_side: bool,
    ) -> bool {
        if tuple.zone_id == query_zone {
            return true;
        }
        include_subject_side
            && Self::is_cross_zone_relation(&tuple.relation)
            && tuple.subject_zone_id == query_zone
    }
}
