//! Read-after-write consistency.
//!
//! The action taken for a read depends on two axes: how the backing store
//! behaves (`StorageConsistency`) and what the caller asked for
//! (`ConsistencyLevel`). `resolve_action` is the single place that pairs them.

use crate::{error::RebacError, revision::RevisionTracker, zookie::Zookie};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Caller-selected freshness guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    /// Never wait.
    Eventual,
    /// Wait for the zookie's revision, but read anyway on timeout.
    CloseToOpen,
    /// Wait for the zookie's revision and fail on timeout.
    Strong,
}

impl ConsistencyLevel {
    pub const ALL: [ConsistencyLevel; 3] = [
        ConsistencyLevel::Eventual,
        ConsistencyLevel::CloseToOpen,
        ConsistencyLevel::Strong,
    ];
}

/// What the backing tuple store guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageConsistency {
    StronglyConsistent,
    EventuallyConsistent,
}

impl StorageConsistency {
    pub const ALL: [StorageConsistency; 2] = [
        StorageConsistency::StronglyConsistent,
        StorageConsistency::EventuallyConsistent,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyAction {
    SkipZookieWait,
    WaitBestEffort,
    WaitOrRaise,
    /// STRONG cannot be honored on an eventually consistent store; log and
    /// fall back to a best-effort wait.
    WarnThenWait,
}

impl ConsistencyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsistencyAction::SkipZookieWait => "skip_zookie_wait",
            ConsistencyAction::WaitBestEffort => "wait_best_effort",
            ConsistencyAction::WaitOrRaise => "wait_or_raise",
            ConsistencyAction::WarnThenWait => "warn_then_wait",
        }
    }
}

impl fmt::Display for ConsistencyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The compatibility matrix.
pub const fn resolve_action(storage: StorageConsistency, level: ConsistencyLevel) -> ConsistencyAction {
    use ConsistencyAction::*;
    use ConsistencyLevel::*;
    use StorageConsistency::*;

    match (storage, level) {
        (StronglyConsistent, Eventual) => SkipZookieWait,
        (StronglyConsistent, CloseToOpen) => WaitBestEffort,
        (StronglyConsistent, Strong) => WaitOrRaise,
        (EventuallyConsistent, Eventual) => SkipZookieWait,
        (EventuallyConsistent, CloseToOpen) => WaitBestEffort,
        (EventuallyConsistent, Strong) => WarnThenWait,
    }
}

/// What happened while enforcing consistency for one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyOutcome {
    /// No wait was attempted.
    Skipped { action: ConsistencyAction },
    /// The zone reached the requested revision.
    Satisfied {
        action: ConsistencyAction,
        zone_id: String,
        revision: u64,
    },
    /// Best-effort wait timed out; the read proceeds and may be stale.
    Stale {
        action: ConsistencyAction,
        zone_id: String,
        requested_revision: u64,
        observed_revision: u64,
    },
}

impl ConsistencyOutcome {
    pub fn action(&self) -> ConsistencyAction {
        match self {
            ConsistencyOutcome::Skipped { action }
            | ConsistencyOutcome::Satisfied { action, .. }
            | ConsistencyOutcome::Stale { action, .. } => *action,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConsistencyOutcome::Skipped { .. } => "skipped",
            ConsistencyOutcome::Satisfied { .. } => "satisfied",
            ConsistencyOutcome::Stale { .. } => "stale",
        }
    }
}

/// Result of the non-blocking half of enforcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    /// Nothing to wait for.
    Done(ConsistencyOutcome),
    /// The caller must block on `ConsistencyController::wait`.
    Wait(PendingWait),
}

/// A decoded wait request, ready to block on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWait {
    pub action: ConsistencyAction,
    pub zone_id: String,
    pub min_revision: u64,
    pub timeout: Duration,
}

/// Decides whether a read must wait for a zookie and performs the wait.
#[derive(Debug, Clone)]
pub struct ConsistencyController {
    tracker: Arc<RevisionTracker>,
    storage: StorageConsistency,
}

impl ConsistencyController {
    pub fn new(tracker: Arc<RevisionTracker>, storage: StorageConsistency) -> Self {
        Self { tracker, storage }
    }

    pub fn storage(&self) -> StorageConsistency {
        self.storage
    }

    pub fn tracker(&self) -> &Arc<RevisionTracker> {
        &self.tracker
    }

    /// Resolve the action and decode the token without blocking.
    ///
    /// A malformed token is only an error under `Strong`; at weaker levels
    /// it is ignored.
    pub fn prepare(
        &self,
        level: ConsistencyLevel,
        min_zookie: Option<&str>,
        timeout: Duration,
    ) -> Result<Prepared, RebacError> {
        let action = resolve_action(self.storage, level);
        if action == ConsistencyAction::WarnThenWait {
            warn!(
                zookie = min_zookie.is_some(),
                "STRONG consistency requested on an eventually consistent store; downgrading to best-effort wait"
            );
        }

        let Some(token) = min_zookie else {
            return Ok(Prepared::Done(ConsistencyOutcome::Skipped { action }));
        };
        if action == ConsistencyAction::SkipZookieWait {
            return Ok(Prepared::Done(ConsistencyOutcome::Skipped { action }));
        }

        let (zone_id, min_revision) = match Zookie::decode(token) {
            Ok(decoded) => decoded,
            Err(e) if level == ConsistencyLevel::Strong => return Err(e),
            Err(e) => {
                debug!(error = %e, "ignoring malformed zookie at {:?} consistency", level);
                return Ok(Prepared::Done(ConsistencyOutcome::Skipped { action }));
            }
        };

        let observed = self.tracker.current(&zone_id);
        if observed >= min_revision {
            return Ok(Prepared::Done(ConsistencyOutcome::Satisfied {
                action,
                zone_id,
                revision: observed,
            }));
        }

        Ok(Prepared::Wait(PendingWait {
            action,
            zone_id,
            min_revision,
            timeout,
        }))
    }

    /// Block on the revision tracker and apply the action's timeout policy.
    pub fn wait(&self, pending: PendingWait) -> Result<ConsistencyOutcome, RebacError> {
        let reached = self
            .tracker
            .wait_for_revision(&pending.zone_id, pending.min_revision, pending.timeout);
        let observed = self.tracker.current(&pending.zone_id);

        if reached {
            return Ok(ConsistencyOutcome::Satisfied {
                action: pending.action,
                zone_id: pending.zone_id,
                revision: observed,
            });
        }

        match pending.action {
            ConsistencyAction::WaitOrRaise => Err(RebacError::ConsistencyTimeout {
                zone_id: pending.zone_id,
                requested_revision: pending.min_revision,
                observed_revision: observed,
                timeout_ms: u64::try_from(pending.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            action => {
                debug!(
                    zone_id = %pending.zone_id,
                    requested = pending.min_revision,
                    observed,
                    "best-effort consistency wait timed out; reading possibly stale data"
                );
                Ok(ConsistencyOutcome::Stale {
                    action,
                    zone_id: pending.zone_id,
                    requested_revision: pending.min_revision,
                    observed_revision: observed,
                })
            }
        }
    }

    /// Blocking entry point: prepare, then wait if needed.
    pub fn enforce(
        &self,
        level: ConsistencyLevel,
        min_zookie: Option<&str>,
        timeout: Duration,
    ) -> Result<ConsistencyOutcome, RebacError> {
        match self.prepare(level, min_zookie, timeout)? {
            Prepared::Wait(pending) => self.wait(pending),
            Prepared::Done(outcome) => Ok(outcome),
        }
    }

    /// Async entry point: the blocking wait runs on tokio's blocking pool so
    /// it never parks a runtime worker.
    pub async fn enforce_async(
        self: &Arc<Self>,
        level: ConsistencyLevel,
        min_zookie: Option<&str>,
        timeout: Duration,
    ) -> Result<ConsistencyOutcome, RebacError> {
        let pending = match self.prepare(level, min_zookie, timeout)? {
            Prepared::Wait(pending) => pending,
            Prepared::Done(outcome) => return Ok(outcome),
        };
        let controller = Arc::clone(self);
        tokio::task::spawn_blocking(move || controller.wait(pending))
            .await
            .map_err(|e| RebacError::InternalError(anyhow::anyhow!("consistency wait panicked: {}", e)))?
    }
}
