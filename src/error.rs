//! Crate-wide error taxonomy.

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the topology cache, placement engine, and recovery engine.
///
/// Propagation follows the policy in the design doc: `NotFound`/`AlreadyExists`
/// are logged and the triggering event is skipped; `Unschedulable` is retried
/// at the next-lower-preference strategy; `Internal` aborts the current
/// operation, increments an error counter, and dumps cache state, but never
/// panics.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Referenced node or domain does not exist in the cache.
    #[error("not found: {0}")]
    NotFound(String),

    /// Attempted to add a node or domain that already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Caller-supplied argument violates a stated precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No placement satisfies the requirement right now; retry eligible.
    #[error("unschedulable: {0}")]
    Unschedulable(String),

    /// The operation's cancellation context expired before completion.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// An invariant was violated. Must be logged; must never crash the process.
    #[error("internal error: {0}")]
    Internal(String),

    /// Recovery exhausted every fallback for a displaced workload.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl Error {
    /// Short tag identifying the error's taxonomy member, used as the
    /// `type`/`result` label on the `topology_scheduler_errors_total` and
    /// `topology_placement_decisions_total` metrics.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Unschedulable(_) => "unschedulable",
            Error::DeadlineExceeded => "deadline_exceeded",
            Error::Internal(_) => "internal",
            Error::Unrecoverable(_) => "unrecoverable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_carry_context() {
        let err = Error::NotFound("node a".to_string());
        assert_eq!(err.to_string(), "not found: node a");
    }
}
