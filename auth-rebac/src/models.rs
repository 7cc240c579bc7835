use crate::error::RebacError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Zone used when a caller does not name one.
pub const DEFAULT_ZONE: &str = "default";

/// Entity type and id that together match every subject.
pub const WILDCARD: &str = "*";

/// Opaque identifier assigned to a tuple when it is written.
pub type TupleId = Uuid;

/// A typed reference to something in the authorization graph, e.g. `user:alice`
/// or `file:/doc.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub entity_id: String,
}

impl Entity {
    pub fn new(entity_type: &str, entity_id: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self::new("user", user_id)
    }

    pub fn group(group_id: &str) -> Self {
        Self::new("group", group_id)
    }

    pub fn file(path: &str) -> Self {
        Self::new("file", path)
    }

    /// The `*:*` entity granting a relation to every subject.
    pub fn wildcard() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    pub fn is_wildcard(&self) -> bool {
        self.entity_type == WILDCARD && self.entity_id == WILDCARD
    }

    /// Parse the `type:id` form. The id may itself contain `:`.
    pub fn parse(value: &str) -> Result<Self, RebacError> {
        let (entity_type, entity_id) = value
            .split_once(':')
            .ok_or_else(|| RebacError::ValidationError(format!("expected type:id, got '{}'", value)))?;
        let entity = Self::new(entity_type, entity_id);
        entity.validate()?;
        Ok(entity)
    }

    /// Reject shapes the graph cannot index: empty parts or separators in the type.
    pub fn validate(&self) -> Result<(), RebacError> {
        if self.entity_type.is_empty() || self.entity_id.is_empty() {
            return Err(RebacError::ValidationError(format!(
                "entity type and id must be non-empty (got '{}')",
                self
            )));
        }
        if self.entity_type.contains([':', '#']) {
            return Err(RebacError::ValidationError(format!(
                "entity type '{}' must not contain ':' or '#'",
                self.entity_type
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Subject side of a tuple: a plain entity, or a userset meaning
/// "anyone holding `relation` on `entity`".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub entity: Entity,
    pub relation: Option<String>,
}

impl Subject {
    pub fn entity(entity: Entity) -> Self {
        Self {
            entity,
            relation: None,
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self::entity(Entity::user(user_id))
    }

    pub fn group(group_id: &str) -> Self {
        Self::entity(Entity::group(group_id))
    }

    pub fn userset(entity_type: &str, entity_id: &str, relation: &str) -> Self {
        Self {
            entity: Entity::new(entity_type, entity_id),
            relation: Some(relation.to_string()),
        }
    }

    pub fn wildcard() -> Self {
        Self::entity(Entity::wildcard())
    }

    pub fn is_userset(&self) -> bool {
        self.relation.is_some()
    }

    pub fn validate(&self) -> Result<(), RebacError> {
        self.entity
            .validate()
            .map_err(|e| RebacError::InvalidSubject(e.to_string()))?;
        if matches!(self.relation.as_deref(), Some("")) {
            return Err(RebacError::InvalidSubject(format!(
                "userset relation on '{}' must be non-empty",
                self.entity
            )));
        }
        Ok(())
    }
}

impl From<Entity> for Subject {
    fn from(entity: Entity) -> Self {
        Self::entity(entity)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation {
            Some(ref relation) => write!(f, "{}#{}", self.entity, relation),
            None => write!(f, "{}", self.entity),
        }
    }
}

/// A stored relationship: `subject` has `relation` on `object` inside `zone_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipTuple {
    pub tuple_id: TupleId,
    pub subject: Subject,
    pub relation: String,
    pub object: Entity,
    pub zone_id: String,
    pub subject_zone_id: String,
    pub object_zone_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RelationshipTuple {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn is_cross_zone(&self) -> bool {
        self.subject_zone_id != self.object_zone_id
    }
}

impl fmt::Display for RelationshipTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @{}",
            self.subject, self.relation, self.object, self.zone_id
        )
    }
}

/// Input to `rebac_create`. Zones default to `zone_id` when not given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TupleWrite {
    pub subject: Subject,
    pub relation: String,
    pub object: Entity,
    pub zone_id: String,
    pub subject_zone_id: Option<String>,
    pub object_zone_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TupleWrite {
    pub fn new(subject: impl Into<Subject>, relation: &str, object: Entity) -> Self {
        Self {
            subject: subject.into(),
            relation: relation.to_string(),
            object,
            zone_id: DEFAULT_ZONE.to_string(),
            subject_zone_id: None,
            object_zone_id: None,
            expires_at: None,
        }
    }

    pub fn in_zone(mut self, zone_id: &str) -> Self {
        self.zone_id = zone_id.to_string();
        self
    }

    pub fn with_subject_zone(mut self, zone_id: &str) -> Self {
        self.subject_zone_id = Some(zone_id.to_string());
        self
    }

    pub fn with_object_zone(mut self, zone_id: &str) -> Self {
        self.object_zone_id = Some(zone_id.to_string());
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn subject_zone(&self) -> &str {
        self.subject_zone_id.as_deref().unwrap_or(&self.zone_id)
    }

    pub fn object_zone(&self) -> &str {
        self.object_zone_id.as_deref().unwrap_or(&self.zone_id)
    }

    /// Materialize the stored row with a fresh id and creation time.
    pub fn into_tuple(self) -> RelationshipTuple {
        let subject_zone_id = self.subject_zone().to_string();
        let object_zone_id = self.object_zone().to_string();
        RelationshipTuple {
            tuple_id: Uuid::new_v4(),
            subject: self.subject,
            relation: self.relation,
            object: self.object,
            zone_id: self.zone_id,
            subject_zone_id,
            object_zone_id,
            expires_at: self.expires_at,
            created_at: Utc::now(),
        }
    }
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub tuple_id: TupleId,
    pub revision: u64,
    /// Consistency token to pass as `min_zookie` on later reads.
    pub zookie: String,
}

/// Filter for `rebac_list_tuples`; `None` fields act as wildcards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TupleFilter {
    pub subject: Option<Subject>,
    pub relation: Option<String>,
    pub object: Option<Entity>,
    pub zone_id: Option<String>,
}

impl TupleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subject(mut self, subject: impl Into<Subject>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn relation(mut self, relation: &str) -> Self {
        self.relation = Some(relation.to_string());
        self
    }

    pub fn object(mut self, object: Entity) -> Self {
        self.object = Some(object);
        self
    }

    pub fn zone(mut self, zone_id: &str) -> Self {
        self.zone_id = Some(zone_id.to_string());
        self
    }

    pub fn matches(&self, tuple: &RelationshipTuple) -> bool {
        self.subject.as_ref().map_or(true, |s| tuple.subject == *s)
            && self.relation.as_ref().map_or(true, |r| tuple.relation == *r)
            && self.object.as_ref().map_or(true, |o| tuple.object == *o)
            && self.zone_id.as_ref().map_or(true, |z| tuple.zone_id == *z)
    }
}

/// One item of `rebac_check_batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckItem {
    pub subject: Entity,
    pub permission: String,
    pub object: Entity,
}

impl CheckItem {
    pub fn new(subject: Entity, permission: &str, object: Entity) -> Self {
        Self {
            subject,
            permission: permission.to_string(),
            object,
        }
    }
}

/// How a single explanation hop was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExplanationStep {
    /// Started from the requested permission on the object.
    Start { object: Entity, relation: String },
    /// Followed a userset tuple `userset#relation -> relation -> object`.
    Userset {
        tuple_id: TupleId,
        userset: Entity,
        relation: String,
    },
    /// Followed a tupleset edge and re-evaluated `computed` on the related object.
    TupleToUserset {
        tuple_id: TupleId,
        tupleset: String,
        related: Entity,
        computed: String,
    },
    /// A tuple naming the subject (or the wildcard) directly.
    Direct { tuple_id: TupleId, relation: String },
}

/// Terminal state of an explain call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplanationOutcome {
    Allowed,
    Denied,
    LimitExceeded(crate::error::GraphLimit),
}

/// Debug view of a permission decision. An empty `path` with `Denied`
/// means no relation path exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    pub subject: Entity,
    pub permission: String,
    pub object: Entity,
    pub zone_id: String,
    pub outcome: ExplanationOutcome,
    pub path: Vec<ExplanationStep>,
    pub visited_nodes: usize,
}

impl Explanation {
    pub fn allowed(&self) -> bool {
        self.outcome == ExplanationOutcome::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_entity_parse_keeps_colons_in_id() {
        let entity = Entity::parse("file:/a:b").unwrap();
        assert_eq!(entity.entity_type, "file");
        assert_eq!(entity.entity_id, "/a:b");
        assert!(Entity::parse("no-separator").is_err());
        assert!(Entity::parse(":id").is_err());
    }

    #[test]
    fn test_subject_display() {
        assert_eq!(Subject::user("alice").to_string(), "user:alice");
        assert_eq!(
            Subject::userset("group", "eng", "member").to_string(),
            "group:eng#member"
        );
    }

    #[test]
    fn test_tuple_write_defaults_zones() {
        let tuple = TupleWrite::new(Entity::user("bob"), "shared-viewer", Entity::file("/doc"))
            .in_zone("acme")
            .with_subject_zone("partner")
            .into_tuple();
        assert_eq!(tuple.object_zone_id, "acme");
        assert_eq!(tuple.subject_zone_id, "partner");
        assert!(tuple.is_cross_zone());
    }

    #[test]
    fn test_expiry_is_evaluated_against_now() {
        let now = Utc::now();
        let tuple = TupleWrite::new(Entity::user("bob"), "viewer", Entity::file("/doc"))
            .expires_at(now - Duration::seconds(1))
            .into_tuple();
        assert!(tuple.is_expired(now));
        assert!(!tuple.is_expired(now - Duration::seconds(5)));
    }
}
