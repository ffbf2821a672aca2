//! Rebase with conflict classification.

use super::{GitError, GitGateway, GitResult};

impl GitGateway {
    /// Rebase `branch` (starting from its freshly fetched remote tip) onto
    /// the fetched tip of `onto`. Returns the new tip sha.
    ///
    /// Conflicts abort the rebase, leave the working copy clean, and fail
    /// with [`GitError::Conflict`].
    pub(crate) async fn rebase_branch(&self, branch: &str, onto: &str) -> GitResult<String> {
        let start = format!("{}/{}", self.source_remote(), branch);
        self.git_ok(&["checkout", "--quiet", "-B", branch, &start]).await?;

        let upstream = format!("origin/{}", onto);
        let output = self.run_git(&["rebase", &upstream]).await?;
        if !output.status.success() {
            if self.rebase_in_progress() {
                let _ = self.run_git(&["rebase", "--abort"]).await;
                return Err(GitError::Conflict);
            }
            return Err(GitError::CommandFailed {
                command: format!("rebase {}", upstream),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        self.rev_parse("HEAD").await
    }

    fn rebase_in_progress(&self) -> bool {
        let git_dir = self.git_dir();
        git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists()
    }
}
