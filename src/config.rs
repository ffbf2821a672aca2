//! Merge-job configuration and admin-feature gating.

use crate::forge::approvals::ApprovalWaitConfig;
use crate::forge::ci_wait::CiWaitConfig;
use crate::forge::User;
use crate::interval::IntervalUnion;
use thiserror::Error;

/// Configuration problems that must stop the bot before any job runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{username} is not an admin, so {feature} is not available")]
    AdminRequired { username: String, feature: &'static str },
}

/// Per-job behavior knobs.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Add `Reviewed-by: <approver>` to every rewritten commit. Needs admin
    /// (approver email lookup).
    pub add_reviewers: bool,
    /// Add `Tested: <bot> <mr-url>` to the tip commit.
    pub add_tested: bool,
    /// Snapshot approvers before pushing and re-approve on their behalf
    /// afterwards. Needs admin (`Sudo` header).
    pub reapprove: bool,
    pub ci: CiWaitConfig,
    pub approvals: ApprovalWaitConfig,
    pub embargo: IntervalUnion,
}

impl MergeOptions {
    /// Whether the job rewrites commit messages (and therefore clashes with
    /// forge-side auto-squash).
    pub fn rewrites_commits(&self) -> bool {
        self.add_reviewers || self.add_tested
    }

    /// Features that impersonate other users refuse to start without an
    /// admin token.
    pub fn validate(&self, user: &User) -> Result<(), ConfigError> {
        if self.reapprove && !user.is_admin {
            return Err(ConfigError::AdminRequired {
                username: user.username.clone(),
                feature: "--impersonate-approvers",
            });
        }
        if self.add_reviewers && !user.is_admin {
            return Err(ConfigError::AdminRequired {
                username: user.username.clone(),
                feature: "--add-reviewers",
            });
        }
        Ok(())
    }
}
