//! Per-zone revision counters.
//!
//! Each zone owns an independent mutex/condvar pair, created lazily on first
//! use and kept for the life of the tracker. Writers in one zone never touch
//! another zone's lock, and readers waiting on a revision are woken by the
//! writer's notification rather than by polling.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Default)]
struct ZoneRevision {
    revision: Mutex<u64>,
    advanced: Condvar,
}

#[derive(Debug, Default)]
pub struct RevisionTracker {
    zones: DashMap<String, Arc<ZoneRevision>>,
}

impl RevisionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn zone(&self, zone_id: &str) -> Arc<ZoneRevision> {
        if let Some(existing) = self.zones.get(zone_id) {
            return existing.clone();
        }
        // `entry` holds the shard lock, so two racing creators share one pair.
        self.zones
            .entry(zone_id.to_string())
            .or_default()
            .clone()
    }

    /// Bump the zone's counter and wake everyone waiting on it.
    pub fn increment_and_get(&self, zone_id: &str) -> u64 {
        let zone = self.zone(zone_id);
        let revision = {
            let mut revision = zone.revision.lock();
            *revision = revision.saturating_add(1);
            *revision
        };
        zone.advanced.notify_all();
        debug!(zone_id, revision, "zone revision advanced");
        revision
    }

    /// Current revision; zero for zones that have never been written.
    pub fn current(&self, zone_id: &str) -> u64 {
        match self.zones.get(zone_id) {
            Some(zone) => *zone.revision.lock(),
            None => 0,
        }
    }

    /// Block until the zone reaches `min_revision` or `timeout` elapses.
    /// Returns whether the revision was reached.
    pub fn wait_for_revision(&self, zone_id: &str, min_revision: u64, timeout: Duration) -> bool {
        let zone = self.zone(zone_id);
        let deadline = Instant::now() + timeout;
        let mut revision = zone.revision.lock();
        while *revision < min_revision {
            if zone.advanced.wait_until(&mut revision, deadline).timed_out() {
                return *revision >= min_revision;
            }
        }
        true
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }
}
