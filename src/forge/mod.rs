//! Forge abstraction layer.
//!
//! The merge job talks to GitLab exclusively through the [`Forge`] trait so
//! the whole state machine can run against a scripted fake in tests. The
//! real implementation ([`GitLabForge`]) speaks the v4 REST API.
//!
//! Failure classification matters more than the happy path here: the job
//! decides between retrying, restarting its rebase loop, and giving up based
//! on which [`ForgeError`] a call returns.

pub mod approvals;
pub mod ci_wait;
pub mod gitlab;
pub mod types;

pub use gitlab::GitLabForge;
pub use types::{
    AccessLevel, ApprovalState, Branch, MergeRequest, MrState, Pipeline, PipelineStatus, Project, User, UserRef,
};

use async_trait::async_trait;
use thiserror::Error;

/// Errors from forge operations, classified by HTTP status.
///
/// `NotFound`, `MethodNotAllowed` and `NotAcceptable` are meaningful answers
/// from the forge (someone merged first, the forge refused, the target
/// moved); everything else is assumed retryable.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("not acceptable")]
    NotAcceptable,

    /// Any other HTTP-level failure.
    #[error("gitlab returned {status}: {message}")]
    Remote { status: u16, message: String },

    /// Transport-level failure (connect, TLS, decode).
    #[error("network error: {0}")]
    Network(String),
}

impl ForgeError {
    /// Whether retrying the same call later can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ForgeError::Remote { .. } | ForgeError::Network(_))
    }
}

/// Map an HTTP status to the error taxonomy.
pub(crate) fn classify_status(status: u16, message: String) -> ForgeError {
    match status {
        404 => ForgeError::NotFound,
        405 => ForgeError::MethodNotAllowed,
        406 => ForgeError::NotAcceptable,
        _ => ForgeError::Remote { status, message },
    }
}

pub type ForgeResult<T> = Result<T, ForgeError>;

/// Typed operations over the forge REST surface.
///
/// One method per endpoint the bot uses; no call mutates anything except
/// `approve`, `accept_mr`, `assign_mr` and `comment_mr`.
#[async_trait]
pub trait Forge: Send + Sync {
    /// The authenticated bot user.
    async fn current_user(&self) -> ForgeResult<User>;

    /// Look up another user (approver email lookup; needs admin).
    async fn get_user(&self, user_id: u64) -> ForgeResult<User>;

    async fn get_project(&self, project_id: u64) -> ForgeResult<Project>;

    /// All projects the bot is a member of.
    async fn my_projects(&self) -> ForgeResult<Vec<Project>>;

    async fn get_mr(&self, project_id: u64, iid: u64) -> ForgeResult<MergeRequest>;

    /// Open merge requests assigned to `assignee_id`, oldest first.
    async fn assigned_mrs(&self, project_id: u64, assignee_id: u64) -> ForgeResult<Vec<MergeRequest>>;

    /// Head (and protection flag) of a branch. `NotFound` if it's gone.
    async fn get_branch(&self, project_id: u64, branch: &str) -> ForgeResult<Branch>;

    /// Pipelines for `branch`, newest first.
    async fn list_pipelines(&self, project_id: u64, branch: &str) -> ForgeResult<Vec<Pipeline>>;

    async fn get_approvals(&self, project_id: u64, iid: u64) -> ForgeResult<ApprovalState>;

    /// Approve the merge request; with `sudo`, impersonate that username
    /// (requires the bot to be an admin).
    async fn approve(&self, project_id: u64, iid: u64, sudo: Option<&str>) -> ForgeResult<()>;

    /// Ask the forge to merge, but only if its current head is `sha`.
    ///
    /// The interesting answers: `NotFound` (the request vanished, possibly
    /// merged by someone else), `MethodNotAllowed` (refused, reason must be
    /// disambiguated by re-reading the request), `NotAcceptable` (the target
    /// branch advanced past the sha we rebased onto).
    async fn accept_mr(&self, project_id: u64, iid: u64, sha: &str, remove_source_branch: bool) -> ForgeResult<()>;

    async fn assign_mr(&self, project_id: u64, iid: u64, assignee_id: u64) -> ForgeResult<()>;

    async fn comment_mr(&self, project_id: u64, iid: u64, text: &str) -> ForgeResult<()>;
}
