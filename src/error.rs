//! Job-level error taxonomy.
//!
//! Everything recoverable (flaky HTTP, forge 5xx, races that restart the
//! rebase loop) is handled inside the job and never surfaces here. What does
//! surface is the final classification of one merge attempt.

use thiserror::Error;

/// Terminal outcome of a merge job that did not end in a merge.
#[derive(Debug, Error)]
pub enum JobError {
    /// The merge request cannot be merged. The payload is the user-facing
    /// reason, posted back to the request as
    /// `"I couldn't merge this branch: <reason>"` before the request is
    /// handed back to its author.
    #[error("{0}")]
    Unmergeable(String),

    /// The job was canceled from the outside (signal). No note is posted.
    #[error("job canceled")]
    Canceled,

    /// A bug or an unclassifiable failure. Produces the fallback note so the
    /// merge request is never left without an explanation.
    #[error(transparent)]
    Broken(#[from] anyhow::Error),
}

impl JobError {
    /// Shorthand for the common terminal case.
    pub fn unmergeable(reason: impl Into<String>) -> Self {
        JobError::Unmergeable(reason.into())
    }
}

/// Transient failures are retried this many times before surfacing.
pub(crate) const MAX_TRANSIENT_RETRIES: u32 = 5;

/// Exponential backoff schedule for transient failures: 2s, 4s, 8s, ...
/// capped at 60s. `attempt` counts from 1.
pub(crate) fn backoff_delay(attempt: u32) -> std::time::Duration {
    std::time::Duration::from_secs(2u64.saturating_pow(attempt.min(6)).min(60))
}
