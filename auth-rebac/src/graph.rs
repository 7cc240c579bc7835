//! In-memory index over the tuples visible to one traversal.

use crate::models::{Entity, RelationshipTuple};
use ahash::AHashMap;
use std::collections::BTreeSet;

type EdgeKey = (Entity, String);

/// Tuples indexed for O(1) lookups during check and expand.
///
/// - `direct`: `(object, relation)` to tuples whose subject is a plain entity
/// - `usersets`: `(object, relation)` to tuples whose subject is a userset
/// - `outgoing`: `(subject, relation)` to tuples leaving that entity, used to
///   follow tuplesets such as `parent`
#[derive(Debug, Default)]
pub struct TupleGraph {
    tuples: Vec<RelationshipTuple>,
    direct: AHashMap<EdgeKey, Vec<usize>>,
    usersets: AHashMap<EdgeKey, Vec<usize>>,
    outgoing: AHashMap<EdgeKey, Vec<usize>>,
}

impl TupleGraph {
    pub fn from_tuples(tuples: Vec<RelationshipTuple>) -> Self {
        let mut direct: AHashMap<EdgeKey, Vec<usize>> = AHashMap::new();
        let mut usersets: AHashMap<EdgeKey, Vec<usize>> = AHashMap::new();
        let mut outgoing: AHashMap<EdgeKey, Vec<usize>> = AHashMap::new();

        for (index, tuple) in tuples.iter().enumerate() {
            let object_key = (tuple.object.clone(), tuple.relation.clone());
            if tuple.subject.relation.is_some() {
                usersets.entry(object_key).or_default().push(index);
            } else {
                direct.entry(object_key).or_default().push(index);
                outgoing
                    .entry((tuple.subject.entity.clone(), tuple.relation.clone()))
                    .or_default()
                    .push(index);
            }
        }

        Self {
            tuples,
            direct,
            usersets,
            outgoing,
        }
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    fn resolve<'a>(&'a self, indexes: Option<&'a Vec<usize>>) -> impl Iterator<Item = &'a RelationshipTuple> {
        indexes
            .into_iter()
            .flatten()
            .filter_map(move |&index| self.tuples.get(index))
    }

    /// The tuple granting `relation` on `object` to `subject` itself or to the
    /// wildcard subject.
    pub fn direct_grant(&self, subject: &Entity, relation: &str, object: &Entity) -> Option<&RelationshipTuple> {
        let key = (object.clone(), relation.to_string());
        self.resolve(self.direct.get(&key))
            .find(|tuple| tuple.subject.entity == *subject || tuple.subject.entity.is_wildcard())
    }

    /// Plain-entity subjects holding `relation` on `object`.
    pub fn direct_subjects<'a>(&'a self, object: &Entity, relation: &str) -> impl Iterator<Item = &'a RelationshipTuple> {
        let key = (object.clone(), relation.to_string());
        self.resolve(self.direct.get(&key))
    }

    /// Userset tuples (`type:id#rel`) granting `relation` on `object`.
    pub fn usersets<'a>(&'a self, object: &Entity, relation: &str) -> impl Iterator<Item = &'a RelationshipTuple> {
        let key = (object.clone(), relation.to_string());
        self.resolve(self.usersets.get(&key))
    }

    /// Tuples `entity --relation--> x`, e.g. the parents of a file.
    pub fn outgoing<'a>(&'a self, entity: &Entity, relation: &str) -> impl Iterator<Item = &'a RelationshipTuple> {
        let key = (entity.clone(), relation.to_string());
        self.resolve(self.outgoing.get(&key))
    }

    /// Entities of `entity_type` named anywhere in the graph, wildcard excluded.
    pub fn entities_of_type(&self, entity_type: &str) -> BTreeSet<Entity> {
        self.tuples
            .iter()
            .flat_map(|tuple| [&tuple.object, &tuple.subject.entity])
            .filter(|entity| entity.entity_type == entity_type && !entity.is_wildcard())
            .cloned()
            .collect()
    }
}
