use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which traversal budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "limit", rename_all = "snake_case")]
pub enum GraphLimit {
    Depth { max_depth: u32 },
    VisitedNodes { max_visited_nodes: usize },
    Time { budget_ms: u64 },
}

impl GraphLimit {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphLimit::Depth { .. } => "depth",
            GraphLimit::VisitedNodes { .. } => "visited_nodes",
            GraphLimit::Time { .. } => "time",
        }
    }
}

impl fmt::Display for GraphLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphLimit::Depth { max_depth } => write!(f, "max depth {} exceeded", max_depth),
            GraphLimit::VisitedNodes { max_visited_nodes } => {
                write!(f, "visited more than {} nodes", max_visited_nodes)
            }
            GraphLimit::Time { budget_ms } => write!(f, "time budget of {}ms exhausted", budget_ms),
        }
    }
}

#[derive(Error, Debug)]
pub enum RebacError {
    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    #[error("Invalid object: {0}")]
    InvalidObject(String),

    #[error("Invalid relation: {0}")]
    InvalidRelation(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error(
        "Zone isolation violated: relation '{relation}' cannot link subject zone '{subject_zone}' to object zone '{object_zone}'"
    )]
    ZoneIsolation {
        relation: String,
        subject_zone: String,
        object_zone: String,
    },

    #[error("Writing {subject} {relation} {object} would create a cycle")]
    CycleDetected {
        relation: String,
        subject: String,
        object: String,
    },

    #[error("Invalid zookie: {0}")]
    InvalidZookie(String),

    #[error(
        "Timed out after {timeout_ms}ms waiting for zone '{zone_id}' to reach revision {requested_revision} (observed {observed_revision})"
    )]
    ConsistencyTimeout {
        zone_id: String,
        requested_revision: u64,
        observed_revision: u64,
        timeout_ms: u64,
    },

    #[error("Graph traversal gave up: {0}")]
    GraphLimitExceeded(GraphLimit),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Object type not found: {0}")]
    ObjectTypeNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl RebacError {
    /// Caller supplied a malformed subject, object, relation or zone.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RebacError::InvalidSubject(_)
                | RebacError::InvalidObject(_)
                | RebacError::InvalidRelation(_)
                | RebacError::ValidationError(_)
        )
    }

    /// Worth retrying as-is (or with relaxed consistency).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RebacError::ConsistencyTimeout { .. } | RebacError::StorageError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;
