//! Pipeline waiter.
//!
//! After the bot pushes a rewritten head it polls the project's pipelines
//! until the one matching `(branch, sha)` reaches a terminal status. The
//! forge offers no push notifications for pipeline transitions, so polling
//! is unavoidable; this is one of the two places the job sleeps.

use crate::cancel::CancelFlag;
use crate::clock::Clock;
use crate::error::JobError;
use crate::forge::{Forge, PipelineStatus};
use slog::{debug, warn, Logger};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CiWaitConfig {
    /// Give up after this long without a terminal status.
    pub timeout: Duration,
    /// Fixed cadence between polls.
    pub poll_interval: Duration,
}

impl Default for CiWaitConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Terminal observation of the pipeline wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiOutcome {
    /// Pipeline succeeded; safe to merge.
    Passed,
    /// Pipeline was skipped; treated as passing.
    Skipped,
    Failed,
    Canceled,
    /// No pipeline for the pushed sha ever showed up.
    NeverAppeared,
    /// A pipeline appeared but never reached a terminal status.
    TimedOut,
}

/// Poll until the pipeline for `(branch, sha)` is terminal.
///
/// A pipeline is matched by ref *and* sha; pipelines for older heads of the
/// same branch are ignored. Each poll trusts the latest observation, so a
/// pipeline that flaps back from a terminal status (forge quirk) is simply
/// re-awaited. Transient forge errors don't abort the wait, they just burn
/// timeout budget.
#[allow(clippy::too_many_arguments)]
pub async fn wait_for_pipeline(
    forge: &dyn Forge,
    clock: &dyn Clock,
    cancel: &CancelFlag,
    log: &Logger,
    project_id: u64,
    branch: &str,
    sha: &str,
    config: &CiWaitConfig,
) -> Result<CiOutcome, JobError> {
    let started = clock.now();
    let timeout = chrono::Duration::from_std(config.timeout).unwrap_or(chrono::Duration::MAX);
    let mut seen = false;

    loop {
        if cancel.is_canceled() {
            return Err(JobError::Canceled);
        }

        match forge.list_pipelines(project_id, branch).await {
            Ok(pipelines) => {
                let current = pipelines
                    .iter()
                    .find(|pipeline| pipeline.ref_ == branch && pipeline.sha == sha);
                match current {
                    Some(pipeline) => {
                        seen = true;
                        match pipeline.status {
                            PipelineStatus::Success => return Ok(CiOutcome::Passed),
                            PipelineStatus::Skipped => return Ok(CiOutcome::Skipped),
                            PipelineStatus::Failed => return Ok(CiOutcome::Failed),
                            PipelineStatus::Canceled => return Ok(CiOutcome::Canceled),
                            status => {
                                debug!(log, "Pipeline {} on {} is {}", pipeline.id, branch, status);
                            }
                        }
                    }
                    None => {
                        debug!(log, "No pipeline for {} on {} yet", sha, branch);
                    }
                }
            }
            Err(err) if err.is_transient() => {
                warn!(log, "Transient error listing pipelines: {}", err);
            }
            Err(err) => {
                return Err(JobError::Broken(
                    anyhow::Error::new(err).context("listing pipelines"),
                ));
            }
        }

        if clock.now() - started >= timeout {
            return Ok(if seen { CiOutcome::TimedOut } else { CiOutcome::NeverAppeared });
        }
        clock.sleep(config.poll_interval).await;
    }
}
