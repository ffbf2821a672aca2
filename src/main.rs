//! Automated merge-request integrator for self-hosted GitLab.
//!
//! A reviewer assigns an approved merge request to the bot user; the bot
//! rebases the source branch onto the target, optionally stamps
//! `Reviewed-by:`/`Tested:` trailers, waits for CI on the rewritten head,
//! and asks GitLab to merge, handing the request back to its author with an
//! explanation whenever that can't be done.

mod bot;
mod cancel;
mod clock;
mod config;
mod error;
mod forge;
mod git_gateway;
mod interval;
mod job;
#[cfg(test)]
mod testing;

use anyhow::{bail, Context, Result};
use clap::Parser;
use regex::Regex;
use slog::{o, Drain, Logger};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::bot::Bot;
use crate::cancel::CancelFlag;
use crate::clock::SystemClock;
use crate::config::MergeOptions;
use crate::forge::approvals::ApprovalWaitConfig;
use crate::forge::ci_wait::CiWaitConfig;
use crate::forge::{Forge, GitLabForge};
use crate::git_gateway::RepoManager;
use crate::interval::{IntervalUnion, WeeklyInterval};

#[derive(Parser)]
#[command(
    name = "mergeotron",
    version,
    about = "Automated merge-request integrator for self-hosted GitLab"
)]
struct Cli {
    /// Base URL of the GitLab instance, e.g. https://gitlab.example.com
    #[arg(long, value_name = "URL")]
    gitlab_url: String,

    /// File containing the API token; MERGEOTRON_AUTH_TOKEN is used otherwise
    #[arg(long, value_name = "FILE")]
    auth_token_file: Option<PathBuf>,

    /// Private ssh key for fetch/push; MERGEOTRON_SSH_KEY (the key itself) is used otherwise
    #[arg(long, value_name = "FILE")]
    ssh_key_file: Option<PathBuf>,

    /// Weekly window during which merges are deferred, e.g. "Friday 1pm - Monday 9am"; repeatable
    #[arg(long = "embargo", value_name = "INTERVAL")]
    embargo: Vec<WeeklyInterval>,

    /// Add a Reviewed-by: trailer for each approver to every commit (requires admin)
    #[arg(long)]
    add_reviewers: bool,

    /// Add a Tested: trailer to the tip commit of merged branches
    #[arg(long)]
    add_tested: bool,

    /// Keep approvals across the rewrite by re-approving as each prior approver (requires admin)
    #[arg(long)]
    impersonate_approvers: bool,

    /// Only process projects whose path matches this regular expression
    #[arg(long, value_name = "REGEX", default_value = ".*", value_parser = parse_regex)]
    project_regexp: Regex,

    /// Seconds to wait for CI on a rewritten head
    #[arg(long, value_name = "SECS", default_value_t = 900)]
    ci_timeout: u64,

    /// Seconds to wait for approvals to reset after a push
    #[arg(long, value_name = "SECS", default_value_t = 120)]
    approval_timeout: u64,

    /// Seconds to sleep between poll cycles
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    poll_interval: u64,

    /// Directory holding the per-project clones and the materialized ssh key
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,

    /// Debug logging (includes every poll)
    #[arg(long)]
    debug: bool,
}

fn parse_regex(text: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(text)
}

fn build_logger(debug: bool) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let level = if debug { slog::Level::Debug } else { slog::Level::Info };
    let drain = drain.filter_level(level).fuse();
    let drain = std::sync::Mutex::new(drain).fuse();
    Logger::root(drain, o!())
}

fn load_token(cli: &Cli) -> Result<String> {
    if let Some(path) = &cli.auth_token_file {
        let token = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        return Ok(token.trim().to_string());
    }
    match std::env::var("MERGEOTRON_AUTH_TOKEN") {
        Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
        _ => bail!("pass --auth-token-file or set MERGEOTRON_AUTH_TOKEN"),
    }
}

/// The key file to hand to ssh: the one given on the command line, or the
/// MERGEOTRON_SSH_KEY contents materialized under the state directory.
fn resolve_ssh_key(cli: &Cli, state_dir: &Path) -> Result<PathBuf> {
    if let Some(path) = &cli.ssh_key_file {
        return Ok(path.clone());
    }
    let Ok(key) = std::env::var("MERGEOTRON_SSH_KEY") else {
        bail!("pass --ssh-key-file or set MERGEOTRON_SSH_KEY");
    };
    let path = state_dir.join("ssh-key");
    std::fs::write(&path, format!("{}\n", key.trim_end())).with_context(|| format!("writing {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .context("restricting the ssh key permissions")?;
    }
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log = build_logger(cli.debug);

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        let log = log.clone();
        ctrlc::set_handler(move || {
            slog::warn!(log, "Interrupted; finishing up");
            cancel.cancel();
        })
        .context("installing the signal handler")?;
    }

    let token = load_token(&cli)?;
    let forge = Arc::new(GitLabForge::new(&cli.gitlab_url, token)?);
    let user = forge
        .current_user()
        .await
        .map_err(|err| anyhow::anyhow!("fetching the bot user: {}", err))?;
    slog::info!(
        log,
        "Authenticated as {} ({})",
        user.username,
        if user.is_admin { "admin" } else { "not admin" }
    );

    let options = MergeOptions {
        add_reviewers: cli.add_reviewers,
        add_tested: cli.add_tested,
        reapprove: cli.impersonate_approvers,
        ci: CiWaitConfig {
            timeout: Duration::from_secs(cli.ci_timeout),
            ..Default::default()
        },
        approvals: ApprovalWaitConfig {
            timeout: Duration::from_secs(cli.approval_timeout),
            ..Default::default()
        },
        embargo: IntervalUnion::new(cli.embargo.clone()),
    };
    options.validate(&user)?;

    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("mergeotron"));
    std::fs::create_dir_all(&state_dir).with_context(|| format!("creating {}", state_dir.display()))?;
    let ssh_key = resolve_ssh_key(&cli, &state_dir)?;
    let repos = RepoManager::new(state_dir.join("repos"), &ssh_key, &user);

    let bot = Bot::new(
        forge,
        repos,
        Arc::new(SystemClock),
        cancel,
        log,
        user,
        options,
        cli.project_regexp.clone(),
        Duration::from_secs(cli.poll_interval),
    );
    bot.run(cli.once).await;
    Ok(())
}
