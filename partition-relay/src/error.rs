use std::time::Duration;

use thiserror::Error;

use crate::session::state::SessionState;

/// Failures of a single routing decision, returned as values by the router.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// Policy or target topic unset, or an invalid setting. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The message itself cannot be routed under the active policy.
    #[error("invalid message: {0}")]
    Validation(String),

    /// KeepPartition with a destination that has fewer partitions than the source.
    #[error(
        "destination topic has {num_partitions} partitions, cannot keep source partition {partition}"
    )]
    Capacity { partition: i32, num_partitions: i32 },
}

impl RoutingError {
    /// Metric label for this error class
    pub fn label(&self) -> &'static str {
        match self {
            RoutingError::Configuration(_) => "configuration",
            RoutingError::Validation(_) => "validation",
            RoutingError::Capacity { .. } => "capacity",
        }
    }
}

/// An error observed on the consuming or producing side's own error stream.
/// These are retried by the client and never stop the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}: {detail}")]
pub struct TransportError {
    pub level: &'static str,
    pub error: &'static str,
    pub detail: String,
}

impl TransportError {
    pub fn info(error: &'static str, detail: impl Into<String>) -> Self {
        Self {
            level: "info",
            error,
            detail: detail.into(),
        }
    }

    pub fn warn(error: &'static str, detail: impl Into<String>) -> Self {
        Self {
            level: "warn",
            error,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session transition: {event} while {from:?}")]
    InvalidTransition {
        from: SessionState,
        event: &'static str,
    },

    #[error("claim source failed: {0}")]
    Source(String),
}

/// Why a claim loop stopped before its stream ended.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("routing failed for {topic}:{partition} offset {offset}: {source}")]
    Routing {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: RoutingError,
    },

    #[error("production queue closed")]
    QueueClosed,
}

/// Top-level failures of a relay run.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// The close sequences did not both report before the deadline.
    #[error("shutdown timed out after {elapsed:?}, still closing: {remaining:?}")]
    ShutdownTimeout {
        elapsed: Duration,
        remaining: Vec<&'static str>,
    },
}
