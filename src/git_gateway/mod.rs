//! Local git operations.
//!
//! All git work goes through subprocess invocations over ssh with the bot's
//! dedicated key, the same way the original pushes are done by the forge
//! CLIs this tool replaces. The merge job only sees the [`Repo`] trait so
//! tests can substitute a scripted fake.
//!
//! A working copy is owned by exactly one job at a time: [`RepoLock`] holds
//! an advisory file lock for the gateway's whole lifetime, and pushes are
//! atomic (`--force-with-lease`), so a crash mid-job leaves no half-pushed
//! state; the forge stays the source of truth.

mod commit;
mod rebase;
mod remote;
pub mod store;


pub use commit::Trailer;
pub use store::RepoManager;

use async_trait::async_trait;
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Output;
use thiserror::Error;
use tokio::process::Command;

/// Errors from local git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Rebase stopped on conflicting changes.
    #[error("rebase hit conflicts")]
    Conflict,

    /// The remote refused the push: the lease was broken (someone pushed) or
    /// the branch is protected.
    #[error("push rejected by the remote")]
    PushRejected,

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

pub type GitResult<T> = Result<T, GitError>;

/// Local working-copy operations the merge job needs.
#[async_trait]
pub trait Repo: Send + Sync {
    /// Refresh branch tips from every configured remote (`fetch --prune`).
    async fn fetch(&self) -> GitResult<()>;

    /// Rebase `branch` onto the target branch's fetched tip; returns the new
    /// tip sha. History stays linear; conflicts fail with
    /// [`GitError::Conflict`] and leave the working copy clean.
    async fn rebase(&self, branch: &str, onto: &str) -> GitResult<String>;

    /// Add `trailers` to the message of every commit in `base..branch`; the
    /// tail commit additionally gets `tip_trailer`. Author and authored
    /// dates are preserved; the committer becomes the bot. Returns the new
    /// tip sha.
    async fn rewrite_trailers(
        &self,
        branch: &str,
        base: &str,
        trailers: &[Trailer],
        tip_trailer: Option<&Trailer>,
    ) -> GitResult<String>;

    /// Push `branch`, succeeding only if the remote head still equals
    /// `expected_sha` (`--force-with-lease`).
    async fn push(&self, branch: &str, expected_sha: &str) -> GitResult<()>;

    /// Resolve a ref to a commit sha.
    async fn get_commit_hash(&self, reference: &str) -> GitResult<String>;
}

/// Guard holding the per-repository advisory lock.
///
/// Released when dropped, i.e. on every job exit path.
pub struct RepoLock {
    _file: File,
}

impl RepoLock {
    /// Block until the lock for `path` can be taken.
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

/// Subprocess-backed implementation operating on one project clone.
pub struct GitGateway {
    workdir: PathBuf,
    ssh_command: String,
    /// Remote holding the source branch: `origin`, or `source` for forks.
    source_remote: String,
    _lock: Option<RepoLock>,
}

impl GitGateway {
    pub(crate) fn new(workdir: PathBuf, ssh_command: String, source_remote: String, lock: Option<RepoLock>) -> Self {
        Self {
            workdir,
            ssh_command,
            source_remote,
            _lock: lock,
        }
    }

    pub(crate) fn source_remote(&self) -> &str {
        &self.source_remote
    }

    pub(crate) fn git_dir(&self) -> PathBuf {
        self.workdir.join(".git")
    }

    /// Run git in the working copy, returning the raw output.
    pub(crate) async fn run_git(&self, args: &[&str]) -> GitResult<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_SSH_COMMAND", &self.ssh_command)
            .output()
            .await
            .map_err(|err| GitError::CommandFailed {
                command: args.join(" "),
                stderr: err.to_string(),
            })
    }

    /// Run git and fail on a non-zero exit.
    pub(crate) async fn git_ok(&self, args: &[&str]) -> GitResult<Output> {
        let output = self.run_git(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Resolve a ref to a full sha.
    pub(crate) async fn rev_parse(&self, reference: &str) -> GitResult<String> {
        let output = self.git_ok(&["rev-parse", reference]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Repo for GitGateway {
    async fn fetch(&self) -> GitResult<()> {
        self.fetch_all().await
    }

    async fn rebase(&self, branch: &str, onto: &str) -> GitResult<String> {
        self.rebase_branch(branch, onto).await
    }

    async fn rewrite_trailers(
        &self,
        branch: &str,
        base: &str,
        trailers: &[Trailer],
        tip_trailer: Option<&Trailer>,
    ) -> GitResult<String> {
        self.rewrite_range_trailers(branch, base, trailers, tip_trailer).await
    }

    async fn push(&self, branch: &str, expected_sha: &str) -> GitResult<()> {
        self.push_with_lease(branch, expected_sha).await
    }

    async fn get_commit_hash(&self, reference: &str) -> GitResult<String> {
        self.rev_parse(reference).await
    }
}
