//! Per-project clone management.
//!
//! One clone per project id under a root directory, created over ssh on
//! first use. The clone is handed to exactly one job at a time; the
//! advisory lock is taken here and travels with the gateway.

use super::{GitGateway, RepoLock};
use crate::forge::{Project, User};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub struct RepoManager {
    root: PathBuf,
    ssh_command: String,
    committer_name: String,
    committer_email: String,
}

fn ensure_ssh_url(url: &str) -> Result<()> {
    if url.starts_with("git@") || url.starts_with("ssh://") {
        Ok(())
    } else {
        bail!("remote URL must be ssh-form, got {:?}", url);
    }
}

impl RepoManager {
    pub fn new(root: PathBuf, ssh_key_file: &Path, user: &User) -> Self {
        let committer_name = if user.name.is_empty() {
            user.username.clone()
        } else {
            user.name.clone()
        };
        let committer_email = user
            .email
            .clone()
            .unwrap_or_else(|| format!("{}@localhost", user.username));
        Self {
            root,
            ssh_command: format!(
                "ssh -i {} -o IdentitiesOnly=yes -F /dev/null",
                ssh_key_file.display()
            ),
            committer_name,
            committer_email,
        }
    }

    /// The working copy for `project`, cloning on first use and fetching
    /// otherwise. For fork merge requests `source` names the project holding
    /// the source branch; it becomes a second remote called `source`.
    pub async fn repo_for_project(&self, project: &Project, source: Option<&Project>) -> Result<GitGateway> {
        ensure_ssh_url(&project.ssh_url_to_repo)?;
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;

        let lock = RepoLock::acquire(&self.root.join(format!("{}.lock", project.id)))
            .with_context(|| format!("locking repository for project {}", project.id))?;

        let workdir = self.root.join(project.id.to_string());
        if !workdir.join(".git").exists() {
            self.clone_into(&project.ssh_url_to_repo, &workdir).await?;
        }

        let fork_source = source.filter(|candidate| candidate.id != project.id);
        let source_remote = if fork_source.is_some() { "source" } else { "origin" };
        let gateway = GitGateway::new(workdir, self.ssh_command.clone(), source_remote.to_string(), Some(lock));

        // The committer identity used for rewritten commits.
        gateway.git_ok(&["config", "user.name", &self.committer_name]).await?;
        gateway.git_ok(&["config", "user.email", &self.committer_email]).await?;

        if let Some(source_project) = fork_source {
            ensure_ssh_url(&source_project.ssh_url_to_repo)?;
            let set = gateway
                .run_git(&["remote", "set-url", "source", &source_project.ssh_url_to_repo])
                .await?;
            if !set.status.success() {
                gateway
                    .git_ok(&["remote", "add", "source", &source_project.ssh_url_to_repo])
                    .await?;
            }
        }

        gateway.fetch_all().await?;
        Ok(gateway)
    }

    async fn clone_into(&self, url: &str, workdir: &Path) -> Result<()> {
        let output = Command::new("git")
            .args(["clone", "--quiet", url])
            .arg(workdir)
            .env("GIT_SSH_COMMAND", &self.ssh_command)
            .output()
            .await
            .context("running git clone")?;
        if !output.status.success() {
            bail!(
                "git clone of {} failed: {}",
                url,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
