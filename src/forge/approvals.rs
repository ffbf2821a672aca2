//! Approval tracking across a branch rewrite.
//!
//! Pushing rewritten commits makes the forge invalidate existing approvals.
//! When the bot impersonates approvers it snapshots them before the push,
//! waits for the forge to report an empty approver set, then re-approves
//! once per prior approver with a `Sudo` header. This is the second of the
//! two places the job sleeps.

use crate::cancel::CancelFlag;
use crate::clock::Clock;
use crate::error::{backoff_delay, JobError, MAX_TRANSIENT_RETRIES};
use crate::forge::{ApprovalState, Forge};
use slog::{debug, info, warn, Logger};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ApprovalWaitConfig {
    /// Give up if the approvals haven't reset after this long.
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ApprovalWaitConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Poll until the forge reports an empty approver set.
///
/// Returns `Ok(true)` once the reset is observed, `Ok(false)` on timeout.
pub async fn wait_for_reset(
    forge: &dyn Forge,
    clock: &dyn Clock,
    cancel: &CancelFlag,
    log: &Logger,
    project_id: u64,
    iid: u64,
    config: &ApprovalWaitConfig,
) -> Result<bool, JobError> {
    info!(log, "Checking if approvals have reset");
    let started = clock.now();
    let timeout = chrono::Duration::from_std(config.timeout).unwrap_or(chrono::Duration::MAX);

    loop {
        if cancel.is_canceled() {
            return Err(JobError::Canceled);
        }

        match forge.get_approvals(project_id, iid).await {
            Ok(approvals) if approvals.is_reset() => return Ok(true),
            Ok(_) => {}
            Err(err) if err.is_transient() => {
                warn!(log, "Transient error fetching approvals: {}", err);
            }
            Err(err) => {
                return Err(JobError::Broken(
                    anyhow::Error::new(err).context("fetching approvals"),
                ));
            }
        }

        if clock.now() - started >= timeout {
            return Ok(false);
        }
        debug!(log, "Approvals haven't reset yet, sleeping for {} secs", config.poll_interval.as_secs());
        clock.sleep(config.poll_interval).await;
    }
}

/// Re-apply a pre-push snapshot of approvals, impersonating each approver.
pub async fn reapprove(
    forge: &dyn Forge,
    clock: &dyn Clock,
    log: &Logger,
    project_id: u64,
    iid: u64,
    snapshot: &ApprovalState,
) -> Result<(), JobError> {
    for approver in &snapshot.approvers {
        info!(log, "Approving again on behalf of {}", approver.username);
        let mut attempt = 0;
        loop {
            match forge.approve(project_id, iid, Some(&approver.username)).await {
                Ok(()) => break,
                Err(err) if err.is_transient() && attempt < MAX_TRANSIENT_RETRIES => {
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    warn!(log, "Approving as {} failed ({}); retrying in {:?}", approver.username, err, delay);
                    clock.sleep(delay).await;
                }
                Err(err) => {
                    return Err(JobError::Broken(
                        anyhow::Error::new(err).context(format!("re-approving as {}", approver.username)),
                    ));
                }
            }
        }
    }
    Ok(())
}
