//! The single merge job state machine.
//!
//! Drives one assigned merge request from "assigned to the bot" to either
//! merged or handed back to its author with an explanation:
//!
//! ```text
//! Preflight -> Rebase -> Rewrite -> Push -> WaitApprovals -> WaitCI -> Accept
//! ```
//!
//! Between any two forge calls a human or another bot may push, approve,
//! close, or merge, so every step re-validates what it depends on and every
//! failure is classified as either worth retrying, worth restarting the
//! rebase loop for, or terminal. Accept bouncing with "target moved" (406)
//! re-enters the loop at Rebase, bounded by [`MAX_REBASE_ROUNDS`].
//!
//! The job owns its working copy for its whole lifetime and runs strictly
//! sequentially; its only suspension points are the CI and approval waiters
//! and transient-failure backoff, all of which honor the cancel flag.


use crate::cancel::CancelFlag;
use crate::clock::Clock;
use crate::config::MergeOptions;
use crate::error::{backoff_delay, JobError, MAX_TRANSIENT_RETRIES};
use crate::forge::ci_wait::{self, CiOutcome};
use crate::forge::{approvals, Forge, ForgeError, ForgeResult};
use crate::forge::{Branch, MergeRequest, MrState, Project, User};
use crate::git_gateway::{GitError, Repo, Trailer};
use slog::{debug, error, info, warn, Logger};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// User-facing messages. The texts are contractual: they end up as notes on
// merge requests and the tests assert on them verbatim.
pub const MSG_WIP: &str = "Sorry, I can't merge requests marked as Work-In-Progress!";
pub const MSG_SQUASH: &str = "Sorry, merging requests marked as auto-squash would ruin my commit tagging!";
pub const MSG_PROTECTED: &str = "Sorry, I can't push rewritten changes to protected branches!";
pub const MSG_CONFLICTS: &str = "got conflicts while rebasing, your problem now...";
pub const MSG_CI_FAILED: &str = "CI failed!";
pub const MSG_CI_CANCELED: &str = "Someone canceled the CI.";
pub const MSG_CI_MISSING: &str = "CI did not appear";
pub const MSG_CI_TIMEOUT: &str = "CI is taking too long";
pub const MSG_SOMEONE_PUSHED: &str = "Someone pushed to branch while we were trying to merge";
pub const MSG_BECAME_WIP: &str = "The request was marked as WIP as I was processing it (maybe a WIP commit?)";
pub const MSG_SOMEONE_CLOSED: &str = "Someone closed the merge request while I was attempting to merge it.";
pub const MSG_GITLAB_REFUSED: &str = "Gitlab refused to merge this request and I don't know why!";
pub const MSG_UNRESOLVED_DISCUSSIONS: &str =
    "Gitlab refused to merge this request and I don't know why! Maybe you have unresolved discussions?";
pub const MSG_GIT_HOOK: &str = "GitLab refused to merge this branch. I suspect that a Push Rule or a git-hook \
                                is rejecting my commits; maybe my email needs to be white-listed?";
pub const MSG_APPROVALS_STUCK: &str = "approvals did not reset";
pub const MSG_TARGET_RACING: &str = "The target branch is moving faster than I can merge it; giving up!";
pub const MSG_JUMPED_QUEUE: &str =
    "My job would be easier if people didn't jump the queue and push directly... *sigh*";
pub const MSG_BROKEN: &str = "I'm broken on the inside, please somebody fix me... :cry:";

pub fn msg_changes_already_exist(target_branch: &str) -> String {
    format!("these changes already exist in branch `{}`", target_branch)
}

/// How many times Accept may bounce back to Rebase on a moved target.
const MAX_REBASE_ROUNDS: u32 = 6;
/// Cadence for re-checking an active merge embargo.
const EMBARGO_RECHECK: Duration = Duration::from_secs(60);

/// The capabilities a job runs against; fakes in tests, the real forge,
/// working copy and clock in production.
pub struct JobEnv {
    pub forge: Arc<dyn Forge>,
    pub repo: Arc<dyn Repo>,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancelFlag,
    pub log: Logger,
}

/// Answer from one Accept attempt that didn't end the job.
enum AcceptOutcome {
    Merged,
    TargetMoved,
}

pub struct MergeJob {
    forge: Arc<dyn Forge>,
    repo: Arc<dyn Repo>,
    clock: Arc<dyn Clock>,
    cancel: CancelFlag,
    log: Logger,
    user: User,
    project: Project,
    mr: MergeRequest,
    options: MergeOptions,
}

impl MergeJob {
    pub fn new(env: JobEnv, user: User, project: Project, mr: MergeRequest, options: MergeOptions) -> Self {
        Self {
            forge: env.forge,
            repo: env.repo,
            clock: env.clock,
            cancel: env.cancel,
            log: env.log,
            user,
            project,
            mr,
            options,
        }
    }

    /// Run the job to completion.
    ///
    /// On `Unmergeable`, posts `"I couldn't merge this branch: <reason>"`
    /// and reassigns the request to its author (both best-effort). On an
    /// unexpected failure, posts the fallback note so the request is never
    /// abandoned silently. A canceled job touches nothing.
    pub async fn execute(self) -> Result<(), JobError> {
        info!(
            self.log,
            "Processing merge request !{} in {}", self.mr.iid, self.project.path_with_namespace
        );
        match self.run().await {
            Ok(()) => {
                info!(self.log, "Merge job finished");
                Ok(())
            }
            Err(JobError::Canceled) => {
                info!(self.log, "Merge job canceled; leaving the request untouched");
                Err(JobError::Canceled)
            }
            Err(JobError::Unmergeable(reason)) => {
                warn!(self.log, "Giving up on the merge request: {}", reason);
                self.abort(&reason).await;
                Err(JobError::Unmergeable(reason))
            }
            Err(JobError::Broken(err)) => {
                error!(self.log, "Unexpected failure: {:#}", err);
                if let Err(note_err) = self.forge.comment_mr(self.mr.project_id, self.mr.iid, MSG_BROKEN).await {
                    warn!(self.log, "Failed to post the fallback note: {}", note_err);
                }
                Err(JobError::Broken(err))
            }
        }
    }

    /// Post the explanation and hand the request back to its author.
    /// Forge errors here are logged, not retried.
    async fn abort(&self, reason: &str) {
        let note = format!("I couldn't merge this branch: {}", reason);
        if let Err(err) = self.forge.comment_mr(self.mr.project_id, self.mr.iid, &note).await {
            warn!(self.log, "Failed to post the abort note: {}", err);
        }
        if let Err(err) = self.forge.assign_mr(self.mr.project_id, self.mr.iid, self.mr.author.id).await {
            warn!(self.log, "Failed to reassign the request to its author: {}", err);
        }
    }

    async fn run(&self) -> Result<(), JobError> {
        if self.cancel.is_canceled() {
            return Err(JobError::Canceled);
        }
        let mr = self.fetch_mr().await?;
        if mr.assignee_id() != Some(self.user.id) {
            info!(self.log, "Merge request is not assigned to me anymore; leaving it alone");
            return Ok(());
        }
        self.preflight(&mr)?;
        self.update_and_accept(mr).await
    }

    /// Cheap validations before any git work.
    fn preflight(&self, mr: &MergeRequest) -> Result<(), JobError> {
        if !mr.state.is_open() {
            return Err(JobError::unmergeable(format!("The merge request is already {}!", mr.state)));
        }
        if mr.work_in_progress {
            return Err(JobError::unmergeable(MSG_WIP));
        }
        // Forge-side auto-squash would rewrite after us and discard trailers
        if mr.squash && self.options.rewrites_commits() {
            return Err(JobError::unmergeable(MSG_SQUASH));
        }
        Ok(())
    }

    /// The rebase/push/wait/accept loop. Each round observes the forge
    /// afresh; a 406 from Accept with a target that really moved starts the
    /// next round.
    async fn update_and_accept(&self, initial: MergeRequest) -> Result<(), JobError> {
        let mut mr = initial;
        let mut complained = false;

        for round in 0..MAX_REBASE_ROUNDS {
            if self.cancel.is_canceled() {
                return Err(JobError::Canceled);
            }
            if round > 0 {
                mr = self.fetch_mr().await?;
                if mr.state == MrState::Merged {
                    info!(self.log, "The merge request got merged while I was catching up");
                    return Ok(());
                }
                self.preflight(&mr)?;
            }

            let (tip, target_sha) = self.rebase_and_push(&mr).await?;

            info!(self.log, "Waiting for CI on {} to pass", tip);
            let outcome = ci_wait::wait_for_pipeline(
                self.forge.as_ref(),
                self.clock.as_ref(),
                &self.cancel,
                &self.log,
                mr.source_project_id,
                &mr.source_branch,
                &tip,
                &self.options.ci,
            )
            .await?;
            match outcome {
                CiOutcome::Passed | CiOutcome::Skipped => {}
                CiOutcome::Failed => return Err(JobError::unmergeable(MSG_CI_FAILED)),
                CiOutcome::Canceled => return Err(JobError::unmergeable(MSG_CI_CANCELED)),
                CiOutcome::NeverAppeared => return Err(JobError::unmergeable(MSG_CI_MISSING)),
                CiOutcome::TimedOut => return Err(JobError::unmergeable(MSG_CI_TIMEOUT)),
            }

            // Did anyone push to the source branch while CI was running?
            let head = self.get_branch(mr.source_project_id, &mr.source_branch).await?;
            if head.sha() != tip {
                return Err(JobError::unmergeable(MSG_SOMEONE_PUSHED));
            }

            self.hold_for_embargo().await?;

            match self.try_accept(&mr, &tip).await? {
                AcceptOutcome::Merged => return Ok(()),
                AcceptOutcome::TargetMoved => {
                    let fresh_target = self.get_branch(mr.target_project_id, &mr.target_branch).await?;
                    if fresh_target.sha() == target_sha {
                        // The target didn't actually move; the refusal is
                        // something we can't fix by rebasing again
                        return Err(JobError::unmergeable(MSG_GITLAB_REFUSED));
                    }
                    info!(
                        self.log,
                        "Someone pushed directly to {} while I was merging; starting over", mr.target_branch
                    );
                    if !complained {
                        complained = true;
                        if let Err(err) = self.forge.comment_mr(mr.project_id, mr.iid, MSG_JUMPED_QUEUE).await {
                            warn!(self.log, "Failed to post the queue-jumping note: {}", err);
                        }
                    }
                }
            }
        }

        Err(JobError::unmergeable(MSG_TARGET_RACING))
    }

    /// One Rebase -> Rewrite -> Push -> WaitApprovals pass. Returns the sha
    /// that is now the forge-side head of the source branch, plus the target
    /// sha it sits on.
    async fn rebase_and_push(&self, mr: &MergeRequest) -> Result<(String, String), JobError> {
        let source = self.get_branch(mr.source_project_id, &mr.source_branch).await?;
        if source.protected {
            return Err(JobError::unmergeable(MSG_PROTECTED));
        }
        let target = self.get_branch(mr.target_project_id, &mr.target_branch).await?;
        let target_sha = target.sha().to_string();

        // Snapshot approvers before the push invalidates them
        let snapshot = if self.options.reapprove {
            Some(
                self.retry_forge("fetching approvals", || {
                    self.forge.get_approvals(mr.project_id, mr.iid)
                })
                .await?,
            )
        } else {
            None
        };

        self.repo
            .fetch()
            .await
            .map_err(|err| JobError::Broken(anyhow::Error::new(err).context("fetching branches")))?;

        info!(
            self.log,
            "Rebasing {} onto {} ({})", mr.source_branch, mr.target_branch, target_sha
        );
        let mut tip = match self.repo.rebase(&mr.source_branch, &mr.target_branch).await {
            Ok(tip) => tip,
            Err(GitError::Conflict) => return Err(JobError::unmergeable(MSG_CONFLICTS)),
            Err(err) => return Err(JobError::Broken(anyhow::Error::new(err).context("rebasing"))),
        };
        if tip == target_sha {
            return Err(JobError::unmergeable(msg_changes_already_exist(&mr.target_branch)));
        }

        if self.options.rewrites_commits() {
            let (trailers, tip_trailer) = self.build_trailers(mr).await?;
            tip = self
                .repo
                .rewrite_trailers(&mr.source_branch, &target_sha, &trailers, tip_trailer.as_ref())
                .await
                .map_err(|err| JobError::Broken(anyhow::Error::new(err).context("rewriting trailers")))?;
        }

        let expected = source.sha().to_string();
        if tip == expected {
            debug!(self.log, "The branch on the forge is already what I'd push; skipping the push");
            return Ok((tip, target_sha));
        }

        info!(self.log, "Pushing {} ({} -> {})", mr.source_branch, expected, tip);
        match self.repo.push(&mr.source_branch, &expected).await {
            Ok(()) => {}
            Err(GitError::PushRejected) => {
                // Protection applied mid-job also lands here
                let protected_now = self
                    .get_branch(mr.source_project_id, &mr.source_branch)
                    .await
                    .map(|branch| branch.protected)
                    .unwrap_or(false);
                let reason = if protected_now { MSG_PROTECTED } else { MSG_SOMEONE_PUSHED };
                return Err(JobError::unmergeable(reason));
            }
            Err(err) => {
                return Err(JobError::Broken(
                    anyhow::Error::new(err).context("pushing the rewritten branch"),
                ));
            }
        }

        if let Some(snapshot) = &snapshot {
            let reset = approvals::wait_for_reset(
                self.forge.as_ref(),
                self.clock.as_ref(),
                &self.cancel,
                &self.log,
                mr.project_id,
                mr.iid,
                &self.options.approvals,
            )
            .await?;
            if !reset {
                return Err(JobError::unmergeable(MSG_APPROVALS_STUCK));
            }
            approvals::reapprove(
                self.forge.as_ref(),
                self.clock.as_ref(),
                &self.log,
                mr.project_id,
                mr.iid,
                snapshot,
            )
            .await?;
        }

        Ok((tip, target_sha))
    }

    /// Trailers for the rewrite: one `Reviewed-by:` per current approver,
    /// and `Tested:` for the tip when enabled.
    async fn build_trailers(&self, mr: &MergeRequest) -> Result<(Vec<Trailer>, Option<Trailer>), JobError> {
        let mut trailers = Vec::new();
        if self.options.add_reviewers {
            let approvals = self
                .retry_forge("fetching approvals", || self.forge.get_approvals(mr.project_id, mr.iid))
                .await?;
            for approver in &approvals.approvers {
                let user = self
                    .retry_forge("looking up an approver", || self.forge.get_user(approver.id))
                    .await?;
                let email = user.email.clone().ok_or_else(|| {
                    JobError::unmergeable(format!(
                        "Failed to find an email address for approver {}",
                        user.username
                    ))
                })?;
                trailers.push(Trailer::reviewed_by(&user.name, &email));
            }
        }
        let tip_trailer = if self.options.add_tested {
            Some(Trailer::tested(&self.user.username, &mr.web_url))
        } else {
            None
        };
        Ok((trailers, tip_trailer))
    }

    /// Ask the forge to merge, classifying the refusals that matter.
    async fn try_accept(&self, mr: &MergeRequest, sha: &str) -> Result<AcceptOutcome, JobError> {
        let mut attempt = 0;
        loop {
            if self.cancel.is_canceled() {
                return Err(JobError::Canceled);
            }
            match self.forge.accept_mr(mr.project_id, mr.iid, sha, true).await {
                Ok(()) => {
                    info!(self.log, "Merge request accepted");
                    return Ok(AcceptOutcome::Merged);
                }
                Err(ForgeError::NotAcceptable) => return Ok(AcceptOutcome::TargetMoved),
                Err(ForgeError::NotFound) => {
                    // A peer may have merged it first; that counts as done,
                    // whatever the target head looks like now
                    let fresh = self.fetch_mr().await?;
                    if fresh.state == MrState::Merged {
                        info!(self.log, "Someone else merged the request already; nothing left to do");
                        return Ok(AcceptOutcome::Merged);
                    }
                    return Err(JobError::unmergeable(MSG_GITLAB_REFUSED));
                }
                Err(ForgeError::MethodNotAllowed) => {
                    let reason = self.diagnose_refusal().await?;
                    return Err(JobError::Unmergeable(reason));
                }
                Err(err) if err.is_transient() && attempt < MAX_TRANSIENT_RETRIES => {
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    warn!(self.log, "Accept failed ({}); retrying in {:?}", err, delay);
                    self.clock.sleep(delay).await;
                }
                Err(err) => {
                    return Err(JobError::unmergeable(format!(
                        "Gitlab keeps failing while accepting the merge request: {}",
                        err
                    )));
                }
            }
        }
    }

    /// A 405 is ambiguous; re-read the request to figure out why the forge
    /// said no. When both the unresolved-discussions setting and the
    /// push-rule heuristic are plausible, the discussions explanation wins.
    async fn diagnose_refusal(&self) -> Result<String, JobError> {
        let mr = self.fetch_mr().await?;
        let message = if mr.work_in_progress {
            MSG_BECAME_WIP
        } else if mr.state == MrState::Closed {
            MSG_SOMEONE_CLOSED
        } else if self.project.only_allow_merge_if_all_discussions_are_resolved {
            MSG_UNRESOLVED_DISCUSSIONS
        } else if mr.state == MrState::Reopened {
            MSG_GIT_HOOK
        } else {
            MSG_GITLAB_REFUSED
        };
        Ok(message.to_string())
    }

    /// Defer the Accept while a merge embargo is in effect.
    async fn hold_for_embargo(&self) -> Result<(), JobError> {
        while self.options.embargo.covers(self.clock.now()) {
            if self.cancel.is_canceled() {
                return Err(JobError::Canceled);
            }
            info!(self.log, "Merge embargo is in effect; holding off");
            self.clock.sleep(EMBARGO_RECHECK).await;
        }
        Ok(())
    }

    async fn fetch_mr(&self) -> Result<MergeRequest, JobError> {
        self.retry_forge("fetching the merge request", || {
            self.forge.get_mr(self.mr.project_id, self.mr.iid)
        })
        .await
    }

    async fn get_branch(&self, project_id: u64, branch: &str) -> Result<Branch, JobError> {
        self.retry_forge("fetching a branch head", || self.forge.get_branch(project_id, branch))
            .await
    }

    /// Run a forge call, retrying transient failures with exponential
    /// backoff. Exhausting the retry budget is terminal.
    async fn retry_forge<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ForgeResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < MAX_TRANSIENT_RETRIES => {
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    warn!(self.log, "{} failed ({}); retrying in {:?}", what, err, delay);
                    self.clock.sleep(delay).await;
                    if self.cancel.is_canceled() {
                        return Err(JobError::Canceled);
                    }
                }
                Err(err) if err.is_transient() => {
                    return Err(JobError::unmergeable(format!(
                        "Gitlab keeps failing while {}: {}",
                        what, err
                    )));
                }
                Err(err) => {
                    return Err(JobError::Broken(
                        anyhow::Error::new(err).context(format!("while {}", what)),
                    ));
                }
            }
        }
    }
}
