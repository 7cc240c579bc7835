//! Namespace configuration: per object type, how permissions and computed
//! relations are derived from stored relations.

use crate::error::RebacError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::info;

/// Relation used for containment; always guarded against cycles on write.
pub const PARENT_RELATION: &str = "parent";

/// How a relation is computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationConfig {
    Union {
        union: Vec<String>,
    },
    TupleToUserset {
        #[serde(rename = "tupleToUserset")]
        tuple_to_userset: TupleToUserset,
    },
    /// Stored tuples only. Written as `"direct"` or `{}`.
    Direct(DirectRelation),
}

impl RelationConfig {
    pub fn direct() -> Self {
        RelationConfig::Direct(DirectRelation::Keyword("direct".to_string()))
    }

    pub fn union(members: &[&str]) -> Self {
        RelationConfig::Union {
            union: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn tuple_to_userset(tupleset: &str, computed_userset: &str) -> Self {
        RelationConfig::TupleToUserset {
            tuple_to_userset: TupleToUserset {
                tupleset: tupleset.to_string(),
                computed_userset: computed_userset.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DirectRelation {
    Keyword(String),
    Empty(EmptyObject),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyObject {}

/// Follow `tupleset` from the object, then evaluate `computed_userset` on
/// whatever the edge points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleToUserset {
    pub tupleset: String,
    #[serde(rename = "computedUserset")]
    pub computed_userset: String,
}

/// Configuration for one object type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    #[serde(default)]
    pub relations: HashMap<String, RelationConfig>,
    /// Permission name to the relations any one of which grants it.
    #[serde(default)]
    pub permissions: HashMap<String, Vec<String>>,
    /// Relations (besides `parent`) that must stay acyclic.
    #[serde(default)]
    pub hierarchical: Vec<String>,
}

impl NamespaceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(mut self, name: &str, config: RelationConfig) -> Self {
        self.relations.insert(name.to_string(), config);
        self
    }

    pub fn permission(mut self, name: &str, usersets: &[&str]) -> Self {
        self.permissions.insert(
            name.to_string(),
            usersets.iter().map(|u| u.to_string()).collect(),
        );
        self
    }

    pub fn hierarchical(mut self, relation: &str) -> Self {
        self.hierarchical.push(relation.to_string());
        self
    }

    pub fn from_json(document: &str) -> Result<Self, RebacError> {
        let config: Self = serde_json::from_str(document)
            .map_err(|e| RebacError::InvalidSchema(format!("unparseable namespace: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks; references to undeclared relations are allowed and
    /// resolve to stored tuples.
    pub fn validate(&self) -> Result<(), RebacError> {
        for (name, relation) in &self.relations {
            if name.is_empty() {
                return Err(RebacError::InvalidSchema("empty relation name".to_string()));
            }
            match relation {
                RelationConfig::Union { union } if union.is_empty() => {
                    return Err(RebacError::InvalidSchema(format!(
                        "union relation '{}' has no members",
                        name
                    )));
                }
                RelationConfig::TupleToUserset { tuple_to_userset }
                    if tuple_to_userset.tupleset.is_empty()
                        || tuple_to_userset.computed_userset.is_empty() =>
                {
                    return Err(RebacError::InvalidSchema(format!(
                        "tupleToUserset relation '{}' is incomplete",
                        name
                    )));
                }
                RelationConfig::Direct(DirectRelation::Keyword(keyword)) if keyword != "direct" => {
                    return Err(RebacError::InvalidSchema(format!(
                        "relation '{}' uses unknown keyword '{}'",
                        name, keyword
                    )));
                }
                _ => {}
            }
        }
        for (name, usersets) in &self.permissions {
            if name.is_empty() || usersets.is_empty() {
                return Err(RebacError::InvalidSchema(format!(
                    "permission '{}' must name at least one relation",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Expression a permission expands to, evaluated against the tuple graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionExpr {
    /// Stored tuples carrying this relation on the object.
    Relation(String),
    Union(Vec<PermissionExpr>),
    TupleToUserset {
        tupleset: String,
        computed_userset: String,
    },
}

impl PermissionExpr {
    /// Relations whose stored tuples feed this expression directly.
    pub fn leaf_relations(&self, out: &mut BTreeSet<String>) {
        match self {
            PermissionExpr::Relation(name) => {
                out.insert(name.clone());
            }
            PermissionExpr::Union(children) => {
                for child in children {
                    child.leaf_relations(out);
                }
            }
            PermissionExpr::TupleToUserset { .. } => {}
        }
    }
}

/// Registered namespaces keyed by object type.
#[derive(Debug, Default)]
pub struct NamespaceRegistry {
    namespaces: RwLock<HashMap<String, Arc<NamespaceConfig>>>,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the `file` and `group` namespaces.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.namespaces.write().extend([
            ("file".to_string(), Arc::new(Self::file_namespace())),
            ("group".to_string(), Arc::new(Self::group_namespace())),
        ]);
        registry
    }

    /// Files and directories: owner/editor/viewer, each fed by direct grants,
    /// inheritance through `parent`, and cross-zone shares.
    pub fn file_namespace() -> NamespaceConfig {
        NamespaceConfig::new()
            .relation("direct_owner", RelationConfig::direct())
            .relation("direct_editor", RelationConfig::direct())
            .relation("direct_viewer", RelationConfig::direct())
            .relation(PARENT_RELATION, RelationConfig::direct())
            .relation("shared-owner", RelationConfig::direct())
            .relation("shared-editor", RelationConfig::direct())
            .relation("shared-viewer", RelationConfig::direct())
            .relation("parent_owner", RelationConfig::tuple_to_userset(PARENT_RELATION, "owner"))
            .relation("parent_editor", RelationConfig::tuple_to_userset(PARENT_RELATION, "editor"))
            .relation("parent_viewer", RelationConfig::tuple_to_userset(PARENT_RELATION, "viewer"))
            .relation("owner", RelationConfig::union(&["direct_owner", "parent_owner", "shared-owner"]))
            .relation("editor", RelationConfig::union(&["direct_editor", "parent_editor", "shared-editor"]))
            .relation("viewer", RelationConfig::union(&["direct_viewer", "parent_viewer", "shared-viewer"]))
            .permission("read", &["viewer", "editor", "owner"])
            .permission("write", &["editor", "owner"])
            .permission("execute", &["owner"])
            .hierarchical(PARENT_RELATION)
    }

    pub fn group_namespace() -> NamespaceConfig {
        NamespaceConfig::new()
            .relation("member-of", RelationConfig::direct())
            .relation("direct_member", RelationConfig::direct())
            .relation("member", RelationConfig::union(&["member-of", "direct_member"]))
    }

    /// Install or replace the namespace for `object_type`. Re-registering
    /// replaces the previous definition wholesale.
    pub fn register(&self, object_type: &str, config: NamespaceConfig) -> Result<(), RebacError> {
        if object_type.is_empty() {
            return Err(RebacError::InvalidSchema("empty object type".to_string()));
        }
        config.validate()?;
        let replaced = self
            .namespaces
            .write()
            .insert(object_type.to_string(), Arc::new(config))
            .is_some();
        info!(object_type, replaced, "namespace registered");
        Ok(())
    }

    pub fn get(&self, object_type: &str) -> Option<Arc<NamespaceConfig>> {
        self.namespaces.read().get(object_type).cloned()
    }

    pub fn object_types(&self) -> BTreeSet<String> {
        self.namespaces.read().keys().cloned().collect()
    }

    pub fn permissions_for(&self, object_type: &str) -> Result<BTreeSet<String>, RebacError> {
        let namespace = self
            .get(object_type)
            .ok_or_else(|| RebacError::ObjectTypeNotFound(object_type.to_string()))?;
        Ok(namespace.permissions.keys().cloned().collect())
    }

    /// Expand `permission` on `object_type` into its expression tree. Unknown
    /// types and names resolve to stored tuples of that name.
    pub fn expand_permission(&self, object_type: &str, permission: &str) -> PermissionExpr {
        match self.get(object_type) {
            Some(namespace) => expand_name(&namespace, permission, &mut Vec::new()),
            None => PermissionExpr::Relation(permission.to_string()),
        }
    }

    /// Relations whose direct tuples can grant `permission`.
    pub fn relations_granting(&self, object_type: &str, permission: &str) -> BTreeSet<String> {
        let mut relations = BTreeSet::new();
        self.expand_permission(object_type, permission)
            .leaf_relations(&mut relations);
        relations
    }

    pub fn is_hierarchical(&self, object_type: &str, relation: &str) -> bool {
        relation == PARENT_RELATION
            || self
                .get(object_type)
                .is_some_and(|ns| ns.hierarchical.iter().any(|r| r == relation))
    }
}

fn expand_name(namespace: &NamespaceConfig, name: &str, stack: &mut Vec<String>) -> PermissionExpr {
    // A self-referencing definition bottoms out at stored tuples.
    if stack.iter().any(|seen| seen == name) {
        return PermissionExpr::Relation(name.to_string());
    }
    stack.push(name.to_string());

    let expr = if let Some(usersets) = namespace.permissions.get(name) {
        PermissionExpr::Union(
            usersets
                .iter()
                .map(|userset| expand_name(namespace, userset, stack))
                .collect(),
        )
    } else {
        match namespace.relations.get(name) {
            Some(RelationConfig::Union { union }) => PermissionExpr::Union(
                union
                    .iter()
                    .map(|member| expand_name(namespace, member, stack))
                    .collect(),
            ),
            // Direct tuples with the computed relation's own name still count.
            Some(RelationConfig::TupleToUserset { tuple_to_userset }) => PermissionExpr::Union(vec![
                PermissionExpr::TupleToUserset {
                    tupleset: tuple_to_userset.tupleset.clone(),
                    computed_userset: tuple_to_userset.computed_userset.clone(),
                },
                PermissionExpr::Relation(name.to_string()),
            ]),
            Some(RelationConfig::Direct(_)) | None => PermissionExpr::Relation(name.to_string()),
        }
    };

    stack.pop();
    expr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_namespaces_validate() {
        assert!(NamespaceRegistry::file_namespace().validate().is_ok());
        assert!(NamespaceRegistry::group_namespace().validate().is_ok());
        let registry = NamespaceRegistry::with_defaults();
        assert_eq!(
            registry.permissions_for("file").unwrap(),
            ["execute", "read", "write"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>()
        );
        assert_eq!(registry.object_types().into_iter().collect::<Vec<_>>(), vec!["file", "group"]);
        assert!(matches!(
            registry.permissions_for("printer"),
            Err(RebacError::ObjectTypeNotFound(_))
        ));
    }

    #[test]
    fn test_write_does_not_reach_viewer_relations() {
        let registry = NamespaceRegistry::with_defaults();
        let write = registry.relations_granting("file", "write");
        assert!(write.contains("shared-editor"));
        assert!(write.contains("shared-owner"));
        assert!(!write.contains("shared-viewer"));

        let read = registry.relations_granting("file", "read");
        assert!(read.contains("shared-viewer"));
        assert!(read.contains("direct_owner"));
    }

    #[test]
    fn test_tuple_to_userset_expansion() {
        let registry = NamespaceRegistry::with_defaults();
        let expr = registry.expand_permission("file", "parent_owner");
        assert_eq!(
            expr,
            PermissionExpr::Union(vec![
                PermissionExpr::TupleToUserset {
                    tupleset: "parent".to_string(),
                    computed_userset: "owner".to_string(),
                },
                PermissionExpr::Relation("parent_owner".to_string()),
            ])
        );
    }

    #[test]
    fn test_unknown_type_is_a_plain_relation() {
        let registry = NamespaceRegistry::new();
        assert_eq!(
            registry.expand_permission("printer", "use"),
            PermissionExpr::Relation("use".to_string())
        );
    }

    #[test]
    fn test_self_referencing_union_terminates() {
        let registry = NamespaceRegistry::new();
        registry
            .register(
                "doc",
                NamespaceConfig::new().relation("viewer", RelationConfig::union(&["viewer", "reader"])),
            )
            .unwrap();
        let mut leaves = BTreeSet::new();
        registry.expand_permission("doc", "viewer").leaf_relations(&mut leaves);
        assert!(leaves.contains("viewer"));
        assert!(leaves.contains("reader"));
    }

    #[test]
    fn test_register_replaces_without_merging() {
        let registry = NamespaceRegistry::with_defaults();
        registry
            .register("file", NamespaceConfig::new().permission("read", &["reader"]))
            .unwrap();
        assert_eq!(registry.permissions_for("file").unwrap().len(), 1);
        assert!(registry.relations_granting("file", "write").contains("write"));
    }

    #[test]
    fn test_from_json_document() {
        let config = NamespaceConfig::from_json(
            r#"{
                "relations": {
                    "direct_owner": "direct",
                    "parent": {},
                    "parent_owner": {"tupleToUserset": {"tupleset": "parent", "computedUserset": "owner"}},
                    "owner": {"union": ["direct_owner", "parent_owner"]}
                },
                "permissions": {"read": ["owner"]},
                "hierarchical": ["parent"]
            }"#,
        )
        .unwrap();
        assert_eq!(config.relations.get("parent"), Some(&RelationConfig::Direct(DirectRelation::Empty(EmptyObject {}))));
        assert_eq!(config.relations.get("owner"), Some(&RelationConfig::union(&["direct_owner", "parent_owner"])));
        assert!(NamespaceConfig::from_json(r#"{"relations": {"x": {"union": []}}}"#).is_err());
        assert!(NamespaceConfig::from_json(r#"{"relations": {"x": "sometimes"}}"#).is_err());
    }

    #[test]
    fn test_hierarchical_relations() {
        let registry = NamespaceRegistry::with_defaults();
        assert!(registry.is_hierarchical("file", "parent"));
        assert!(registry.is_hierarchical("unknown", "parent"));
        assert!(!registry.is_hierarchical("file", "direct_owner"));
    }
}
