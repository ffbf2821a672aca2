//! Commit-message trailer rewriting.

use super::{GitGateway, GitResult};
use std::fmt;

/// An RFC-822-style `Key: Value` line appended to a commit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    pub key: String,
    pub value: String,
}

impl Trailer {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// `Reviewed-by: Name <email>`, one per approver.
    pub fn reviewed_by(name: &str, email: &str) -> Self {
        Self::new("Reviewed-by", format!("{} <{}>", name, email))
    }

    /// `Tested: <bot> <mr-url>`, exactly one on the tip commit.
    pub fn tested(bot: &str, mr_url: &str) -> Self {
        Self::new("Tested", format!("{} <{}>", bot, mr_url))
    }
}

impl fmt::Display for Trailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.value)
    }
}

impl GitGateway {
    /// Replay `base..branch` commit by commit, amending each message with
    /// `trailers` (`git commit --amend --trailer`); the tail commit also
    /// gets `tip_trailer`. Author name, email and authored date survive the
    /// replay; the committer becomes the bot (the clone's configured
    /// identity). Returns the new tip, which `branch` is reset to.
    pub(crate) async fn rewrite_range_trailers(
        &self,
        branch: &str,
        base: &str,
        trailers: &[Trailer],
        tip_trailer: Option<&Trailer>,
    ) -> GitResult<String> {
        let range = format!("{}..{}", base, branch);
        let output = self.git_ok(&["rev-list", "--reverse", &range]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let shas: Vec<&str> = stdout.split_whitespace().collect();
        if shas.is_empty() {
            return self.rev_parse(branch).await;
        }

        self.git_ok(&["checkout", "--quiet", "--detach", base]).await?;
        let last = shas.len() - 1;
        for (index, sha) in shas.iter().enumerate() {
            self.git_ok(&["cherry-pick", "--allow-empty", sha]).await?;

            let mut args: Vec<String> = ["commit", "--amend", "--no-edit", "--allow-empty"]
                .iter()
                .map(|arg| (*arg).to_string())
                .collect();
            for trailer in trailers {
                args.push("--trailer".to_string());
                args.push(trailer.to_string());
            }
            if index == last {
                if let Some(trailer) = tip_trailer {
                    args.push("--trailer".to_string());
                    args.push(trailer.to_string());
                }
            }
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            self.git_ok(&arg_refs).await?;
        }

        let tip = self.rev_parse("HEAD").await?;
        self.git_ok(&["branch", "--force", branch, &tip]).await?;
        self.git_ok(&["checkout", "--quiet", branch]).await?;
        Ok(tip)
    }
}
