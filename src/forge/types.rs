//! Typed projections of the GitLab REST payloads the bot consumes.
//!
//! These are read-only views: the only fields the bot ever changes on the
//! forge are a merge request's head (by pushing) and its assignee (when
//! handing the request back to its author).

use serde::Deserialize;
use std::fmt;

/// Lifecycle state of a merge request. Once `Merged`, no further transitions
/// occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MrState {
    Opened,
    Reopened,
    Closed,
    Merged,
    Locked,
}

impl MrState {
    /// Whether the request can still be worked on.
    pub fn is_open(self) -> bool {
        matches!(self, MrState::Opened | MrState::Reopened)
    }
}

impl fmt::Display for MrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MrState::Opened => "opened",
            MrState::Reopened => "reopened",
            MrState::Closed => "closed",
            MrState::Merged => "merged",
            MrState::Locked => "locked",
        };
        write!(f, "{}", text)
    }
}

/// A user as embedded in other payloads (author, assignee, approver).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserRef {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub name: String,
}

/// A fully fetched user (`GET /user`, `GET /users/:id`). The email is only
/// visible when the caller is an admin, which is exactly when the bot needs
/// it (for `Reviewed-by:` trailers).
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

/// Read-only view of a merge request's salient fields.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeRequest {
    pub iid: u64,
    pub project_id: u64,
    pub source_project_id: u64,
    pub target_project_id: u64,
    pub source_branch: String,
    pub target_branch: String,
    /// Last-seen head of the source branch.
    pub sha: String,
    pub state: MrState,
    #[serde(default)]
    pub work_in_progress: bool,
    #[serde(default)]
    pub squash: bool,
    #[serde(default)]
    pub assignee: Option<UserRef>,
    pub author: UserRef,
    pub web_url: String,
}

impl MergeRequest {
    pub fn assignee_id(&self) -> Option<u64> {
        self.assignee.as_ref().map(|user| user.id)
    }

    /// Whether the source branch lives in a different project (fork).
    pub fn is_fork(&self) -> bool {
        self.source_project_id != self.target_project_id
    }
}

/// What the bot may do in a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    None,
    Guest,
    Reporter,
    Developer,
    Maintainer,
    Owner,
}

impl AccessLevel {
    /// From GitLab's numeric encoding (10, 20, 30, 40, 50).
    fn from_gitlab(value: u64) -> Self {
        match value {
            0..=9 => AccessLevel::None,
            10..=19 => AccessLevel::Guest,
            20..=29 => AccessLevel::Reporter,
            30..=39 => AccessLevel::Developer,
            40..=49 => AccessLevel::Maintainer,
            _ => AccessLevel::Owner,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AccessEntry {
    access_level: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Permissions {
    #[serde(default)]
    project_access: Option<AccessEntry>,
    #[serde(default)]
    group_access: Option<AccessEntry>,
}

/// A project the bot is a member of. Read-only to the merge job.
#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: u64,
    pub path_with_namespace: String,
    pub ssh_url_to_repo: String,
    #[serde(default)]
    pub only_allow_merge_if_pipeline_succeeds: bool,
    #[serde(default)]
    pub only_allow_merge_if_all_discussions_are_resolved: bool,
    #[serde(default)]
    permissions: Option<Permissions>,
}

impl Project {
    /// The bot's effective access: the stronger of project and group grants.
    pub fn access_level(&self) -> AccessLevel {
        let Some(permissions) = &self.permissions else {
            return AccessLevel::None;
        };
        let project = permissions
            .project_access
            .as_ref()
            .map_or(AccessLevel::None, |entry| AccessLevel::from_gitlab(entry.access_level));
        let group = permissions
            .group_access
            .as_ref()
            .map_or(AccessLevel::None, |entry| AccessLevel::from_gitlab(entry.access_level));
        project.max(group)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitRef {
    pub id: String,
}

/// Head of a repository branch
/// (`GET /projects/:id/repository/branches/:name`).
#[derive(Debug, Clone, Deserialize)]
pub struct Branch {
    pub name: String,
    #[serde(default)]
    pub protected: bool,
    pub commit: CommitRef,
}

impl Branch {
    pub fn sha(&self) -> &str {
        &self.commit.id
    }
}

/// Status of a CI pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Created,
    WaitingForResource,
    Preparing,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    Manual,
    Scheduled,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PipelineStatus::Created => "created",
            PipelineStatus::WaitingForResource => "waiting_for_resource",
            PipelineStatus::Preparing => "preparing",
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Success => "success",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Canceled => "canceled",
            PipelineStatus::Skipped => "skipped",
            PipelineStatus::Manual => "manual",
            PipelineStatus::Scheduled => "scheduled",
        };
        write!(f, "{}", text)
    }
}

/// One pipeline as returned by `GET /projects/:id/pipelines`.
#[derive(Debug, Clone, Deserialize)]
pub struct Pipeline {
    pub id: u64,
    #[serde(rename = "ref")]
    pub ref_: String,
    pub sha: String,
    pub status: PipelineStatus,
}

/// Approval status of a merge request
/// (`GET /projects/:id/merge_requests/:iid/approvals`).
#[derive(Debug, Clone, Default)]
pub struct ApprovalState {
    pub approvers: Vec<UserRef>,
    pub required: u64,
}

impl ApprovalState {
    pub fn is_reset(&self) -> bool {
        self.approvers.is_empty()
    }
}

impl<'de> Deserialize<'de> for ApprovalState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Entry {
            user: UserRef,
        }

        #[derive(Deserialize)]
        struct Payload {
            #[serde(default)]
            approvals_required: u64,
            #[serde(default)]
            approved_by: Vec<Entry>,
        }

        let payload = Payload::deserialize(deserializer)?;
        Ok(ApprovalState {
            required: payload.approvals_required,
            approvers: payload.approved_by.into_iter().map(|entry| entry.user).collect(),
        })
    }
}
