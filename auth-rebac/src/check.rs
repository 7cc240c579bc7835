use crate::{
    error::{GraphLimit, RebacError},
    graph::TupleGraph,
    models::*,
    schema::{NamespaceRegistry, PermissionExpr},
};
use ahash::AHashSet;
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Budgets bounding a single check, explain or expand call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraversalLimits {
    /// Maximum hop count from the requested object.
    pub max_depth: u32,
    pub max_visited_nodes: usize,
    pub timeout: Duration,
}

impl Default for TraversalLimits {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_visited_nodes: 10_000,
            timeout: Duration::from_millis(1_000),
        }
    }
}

/// Result of a completed search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub outcome: ExplanationOutcome,
    /// Hops from the requested permission to the granting tuple. Empty unless allowed.
    pub path: Vec<ExplanationStep>,
    pub visited_nodes: usize,
}

/// A check decision plus the work it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub visited_nodes: usize,
}

/// Evaluates permissions over a zone's tuple graph.
pub trait TraversalEngine: Send + Sync {
    /// Search for a path granting `permission` on `object` to `subject`.
    /// Limit exhaustion is reported through the outcome, never as an error.
    fn search(
        &self,
        graph: &TupleGraph,
        registry: &NamespaceRegistry,
        subject: &Entity,
        permission: &str,
        object: &Entity,
    ) -> SearchResult;

    /// All plain subjects holding `permission` on `object`, sorted.
    fn expand(
        &self,
        graph: &TupleGraph,
        registry: &NamespaceRegistry,
        permission: &str,
        object: &Entity,
    ) -> Result<Vec<Entity>, RebacError>;

    fn check(
        &self,
        graph: &TupleGraph,
        registry: &NamespaceRegistry,
        subject: &Entity,
        permission: &str,
        object: &Entity,
    ) -> Result<Decision, RebacError> {
        let result = self.search(graph, registry, subject, permission, object);
        match result.outcome {
            ExplanationOutcome::Allowed => Ok(Decision {
                allowed: true,
                visited_nodes: result.visited_nodes,
            }),
            ExplanationOutcome::Denied => Ok(Decision {
                allowed: false,
                visited_nodes: result.visited_nodes,
            }),
            ExplanationOutcome::LimitExceeded(limit) => Err(RebacError::GraphLimitExceeded(limit)),
        }
    }
}

/// Breadth-first traversal with a visited set keyed by `(entity, relation)`.
#[derive(Debug, Clone, Default)]
pub struct BfsTraversal {
    limits: TraversalLimits,
}

struct Goal {
    object: Entity,
    relation: String,
    depth: u32,
    parent: Option<usize>,
    via: Option<ExplanationStep>,
}

struct Frontier {
    goals: Vec<Goal>,
    queue: VecDeque<usize>,
    visited: AHashSet<(Entity, String)>,
    started: Instant,
    limits: TraversalLimits,
}

impl Frontier {
    fn new(object: &Entity, relation: &str, limits: TraversalLimits) -> Self {
        let mut frontier = Self {
            goals: Vec::new(),
            queue: VecDeque::new(),
            visited: AHashSet::new(),
            started: Instant::now(),
            limits,
        };
        frontier.push(object.clone(), relation.to_string(), 0, None, None);
        frontier
    }

    fn push(
        &mut self,
        object: Entity,
        relation: String,
        depth: u32,
        parent: Option<usize>,
        via: Option<ExplanationStep>,
    ) {
        if !self.visited.insert((object.clone(), relation.clone())) {
            return;
        }
        self.goals.push(Goal {
            object,
            relation,
            depth,
            parent,
            via,
        });
        self.queue.push_back(self.goals.len() - 1);
    }

    fn visited_nodes(&self) -> usize {
        self.goals.len() - self.queue.len()
    }

    /// Next goal to evaluate, or the limit that stops the search.
    fn pop(&mut self) -> Option<Result<usize, GraphLimit>> {
        let index = self.queue.pop_front()?;
        let goal = &self.goals[index];

        if goal.depth > self.limits.max_depth {
            return Some(Err(GraphLimit::Depth {
                max_depth: self.limits.max_depth,
            }));
        }
        if self.visited_nodes() > self.limits.max_visited_nodes {
            return Some(Err(GraphLimit::VisitedNodes {
                max_visited_nodes: self.limits.max_visited_nodes,
            }));
        }
        // A zero budget is exhausted before the first goal.
        if self.started.elapsed() >= self.limits.timeout {
            return Some(Err(GraphLimit::Time {
                budget_ms: budget_ms(self.limits.timeout),
            }));
        }
        Some(Ok(index))
    }

    fn path_to(&self, index: usize, last: ExplanationStep) -> Vec<ExplanationStep> {
        let mut steps = vec![last];
        let mut cursor = Some(index);
        while let Some(current) = cursor {
            let goal = &self.goals[current];
            if let Some(ref via) = goal.via {
                steps.push(via.clone());
            }
            cursor = goal.parent;
        }
        let root = &self.goals[0];
        steps.push(ExplanationStep::Start {
            object: root.object.clone(),
            relation: root.relation.clone(),
        });
        steps.reverse();
        steps
    }
}

fn budget_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// What evaluating one goal produced.
enum Step<'a> {
    Granted(&'a RelationshipTuple),
    Continue,
}

impl BfsTraversal {
    pub fn new(limits: TraversalLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> TraversalLimits {
        self.limits
    }

    /// Walk one expression on `object`, queueing userset and tupleset hops.
    /// `subject` is `None` when expanding, in which case every plain subject
    /// of a leaf relation is collected instead of matched.
    fn evaluate<'g>(
        graph: &'g TupleGraph,
        expr: &PermissionExpr,
        object: &Entity,
        subject: Option<&Entity>,
        hops: &mut Vec<(Entity, String, ExplanationStep)>,
        collected: &mut BTreeSet<Entity>,
    ) -> Step<'g> {
        match expr {
            PermissionExpr::Relation(relation) => {
                match subject {
                    Some(subject) => {
                        if let Some(tuple) = graph.direct_grant(subject, relation, object) {
                            return Step::Granted(tuple);
                        }
                    }
                    None => {
                        collected.extend(
                            graph
                                .direct_subjects(object, relation)
                                .map(|tuple| tuple.subject.entity.clone()),
                        );
                    }
                }
                for tuple in graph.usersets(object, relation) {
                    if let Some(ref userset_relation) = tuple.subject.relation {
                        hops.push((
                            tuple.subject.entity.clone(),
                            userset_relation.clone(),
                            ExplanationStep::Userset {
                                tuple_id: tuple.tuple_id,
                                userset: tuple.subject.entity.clone(),
                                relation: userset_relation.clone(),
                            },
                        ));
                    }
                }
                Step::Continue
            }
            PermissionExpr::Union(children) => {
                for child in children {
                    if let Step::Granted(tuple) =
                        Self::evaluate(graph, child, object, subject, hops, collected)
                    {
                        return Step::Granted(tuple);
                    }
                }
                Step::Continue
            }
            PermissionExpr::TupleToUserset {
                tupleset,
                computed_userset,
            } => {
                for tuple in graph.outgoing(object, tupleset) {
                    hops.push((
                        tuple.object.clone(),
                        computed_userset.clone(),
                        ExplanationStep::TupleToUserset {
                            tuple_id: tuple.tuple_id,
                            tupleset: tupleset.clone(),
                            related: tuple.object.clone(),
                            computed: computed_userset.clone(),
                        },
                    ));
                }
                Step::Continue
            }
        }
    }
}

impl TraversalEngine for BfsTraversal {
    fn search(
        &self,
        graph: &TupleGraph,
        registry: &NamespaceRegistry,
        subject: &Entity,
        permission: &str,
        object: &Entity,
    ) -> SearchResult {
        let mut frontier = Frontier::new(object, permission, self.limits);
        let mut hops = Vec::new();
        let mut unused = BTreeSet::new();

        while let Some(next) = frontier.pop() {
            let index = match next {
                Ok(index) => index,
                Err(limit) => {
                    debug!(%subject, permission, %object, %limit, "traversal gave up");
                    return SearchResult {
                        outcome: ExplanationOutcome::LimitExceeded(limit),
                        path: Vec::new(),
                        visited_nodes: frontier.visited_nodes(),
                    };
                }
            };

            let goal = &frontier.goals[index];
            let expr = registry.expand_permission(&goal.object.entity_type, &goal.relation);
            let depth = goal.depth;
            let goal_object = goal.object.clone();
            let goal_relation = goal.relation.clone();

            hops.clear();
            if let Step::Granted(tuple) =
                Self::evaluate(graph, &expr, &goal_object, Some(subject), &mut hops, &mut unused)
            {
                let path = frontier.path_to(
                    index,
                    ExplanationStep::Direct {
                        tuple_id: tuple.tuple_id,
                        relation: tuple.relation.clone(),
                    },
                );
                debug!(%subject, permission, %object, hops = path.len(), "permission granted");
                return SearchResult {
                    outcome: ExplanationOutcome::Allowed,
                    path,
                    visited_nodes: frontier.visited_nodes(),
                };
            }

            debug!(object = %goal_object, relation = %goal_relation, next = hops.len(), "expanded goal");
            for (next_object, next_relation, via) in hops.drain(..) {
                frontier.push(next_object, next_relation, depth + 1, Some(index), Some(via));
            }
        }

        SearchResult {
            outcome: ExplanationOutcome::Denied,
            path: Vec::new(),
            visited_nodes: frontier.visited_nodes(),
        }
    }

    fn expand(
        &self,
        graph: &TupleGraph,
        registry: &NamespaceRegistry,
        permission: &str,
        object: &Entity,
    ) -> Result<Vec<Entity>, RebacError> {
        let mut frontier = Frontier::new(object, permission, self.limits);
        let mut hops = Vec::new();
        let mut subjects = BTreeSet::new();

        while let Some(next) = frontier.pop() {
            let index = next.map_err(RebacError::GraphLimitExceeded)?;
            let goal = &frontier.goals[index];
            let expr = registry.expand_permission(&goal.object.entity_type, &goal.relation);
            let depth = goal.depth;
            let goal_object = goal.object.clone();

            hops.clear();
            Self::evaluate(graph, &expr, &goal_object, None, &mut hops, &mut subjects);
            for (next_object, next_relation, via) in hops.drain(..) {
                frontier.push(next_object, next_relation, depth + 1, Some(index), Some(via));
            }
        }

        debug!(permission, %object, count = subjects.len(), "expanded subjects");
        Ok(subjects.into_iter().collect())
    }
}
