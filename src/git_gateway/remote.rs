//! Remote operations: fetch and force-with-lease push.

use super::{GitError, GitGateway, GitResult};

/// Whether a failed push was refused by the remote rather than failing
/// locally. Covers lease breakage and branch protection as git phrases them.
fn is_push_rejection(stderr: &str) -> bool {
    stderr.contains("[rejected]")
        || stderr.contains("[remote rejected]")
        || stderr.contains("stale info")
        || stderr.contains("protected branch")
        || stderr.contains("not allowed to force push")
        || stderr.contains("pre-receive hook declined")
        || stderr.contains("non-fast-forward")
}

impl GitGateway {
    /// Fetch current branch tips from every configured remote.
    pub(crate) async fn fetch_all(&self) -> GitResult<()> {
        self.git_ok(&["fetch", "--prune", "origin"]).await?;
        if self.source_remote() != "origin" {
            self.git_ok(&["fetch", "--prune", self.source_remote()]).await?;
        }
        Ok(())
    }

    /// Atomic push: succeeds only if the remote `branch` still points at
    /// `expected_sha`.
    pub(crate) async fn push_with_lease(&self, branch: &str, expected_sha: &str) -> GitResult<()> {
        let lease = format!("--force-with-lease={}:{}", branch, expected_sha);
        let remote = self.source_remote().to_string();
        let output = self.run_git(&["push", &lease, &remote, branch]).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_push_rejection(&stderr) {
            Err(GitError::PushRejected)
        } else {
            Err(GitError::CommandFailed {
                command: format!("push {} {}", remote, branch),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}
