//! Tracing hooks around each stage of a check.
//!
//! Disabled hooks cost a branch: every method returns `Span::none()` or does
//! nothing. Enabled hooks open one span per stage and bump `metrics` counters.

use crate::{cache::CacheLookup, consistency::ConsistencyOutcome, error::GraphLimit, models::Entity};
use metrics::{counter, histogram};
use tracing::{info_span, warn, Span};

pub const CHECKS_TOTAL: &str = "rebac_checks_total";
pub const CACHE_LOOKUPS_TOTAL: &str = "rebac_cache_lookups_total";
pub const GRAPH_LIMIT_EXCEEDED_TOTAL: &str = "rebac_graph_limit_exceeded_total";
pub const CONSISTENCY_TOTAL: &str = "rebac_consistency_total";
pub const TRAVERSAL_VISITED_NODES: &str = "rebac_traversal_visited_nodes";

/// Check pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Consistency,
    CacheLookup,
    Traversal,
    Decision,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Consistency => "consistency",
            Stage::CacheLookup => "cache_lookup",
            Stage::Traversal => "traversal",
            Stage::Decision => "decision",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TraceHooks {
    enabled: bool,
}

impl TraceHooks {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Span covering one stage. `decision` starts empty and is filled by
    /// [`TraceHooks::record_decision`].
    pub fn stage_span(&self, stage: Stage, zone_id: &str, permission: &str, object: &Entity) -> Span {
        if !self.enabled {
            return Span::none();
        }
        info_span!(
            "rebac_check",
            stage = stage.as_str(),
            zone_id,
            permission,
            object = %object,
            decision = tracing::field::Empty,
        )
    }

    pub fn on_consistency(&self, outcome: &ConsistencyOutcome) {
        if !self.enabled {
            return;
        }
        counter!(CONSISTENCY_TOTAL, "outcome" => outcome.label(), "action" => outcome.action().as_str())
            .increment(1);
    }

    pub fn on_cache_lookup(&self, lookup: CacheLookup) {
        if !self.enabled {
            return;
        }
        counter!(CACHE_LOOKUPS_TOTAL, "result" => lookup.label()).increment(1);
    }

    pub fn on_traversal(&self, visited_nodes: usize) {
        if !self.enabled {
            return;
        }
        histogram!(TRAVERSAL_VISITED_NODES).record(visited_nodes as f64);
    }

    /// Limit exhaustion is always logged; the counter only when enabled.
    pub fn on_limit_exceeded(&self, span: &Span, limit: GraphLimit) {
        warn!(kind = limit.as_str(), %limit, "graph traversal limit exceeded");
        if !self.enabled {
            return;
        }
        span.record("decision", "limit_exceeded");
        counter!(GRAPH_LIMIT_EXCEEDED_TOTAL, "limit" => limit.as_str()).increment(1);
    }

    pub fn record_decision(&self, span: &Span, allowed: bool) {
        if !self.enabled {
            return;
        }
        let decision = if allowed { "allow" } else { "deny" };
        span.record("decision", decision);
        counter!(CHECKS_TOTAL, "decision" => decision).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_hooks_are_noops() {
        let hooks = TraceHooks::disabled();
        let span = hooks.stage_span(Stage::Traversal, "acme", "read", &Entity::file("/doc"));
        assert!(span.is_none());
        hooks.record_decision(&span, true);
        hooks.on_cache_lookup(CacheLookup::Miss);
        hooks.on_traversal(12);
    }

    #[test]
    fn test_enabled_hooks_without_recorder() {
        // No metrics recorder or subscriber installed: calls must still be safe.
        let hooks = TraceHooks::new(true);
        let span = hooks.stage_span(Stage::Decision, "acme", "read", &Entity::file("/doc"));
        hooks.record_decision(&span, false);
        hooks.on_limit_exceeded(&span, GraphLimit::Depth { max_depth: 3 });
        hooks.on_cache_lookup(CacheLookup::L1(true));
        hooks.on_traversal(4);
        assert_eq!(Stage::CacheLookup.as_str(), "cache_lookup");
    }
}
