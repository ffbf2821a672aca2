//! The top-level poll loop.
//!
//! Every cycle: list the projects the bot is a member of, filter them, fetch
//! the open merge requests assigned to the bot in each, and run one merge
//! job for the oldest. One job at a time; failures are logged and the loop
//! moves on.

use crate::cancel::CancelFlag;
use crate::clock::Clock;
use crate::config::MergeOptions;
use crate::forge::{AccessLevel, Forge, Project, User};
use crate::git_gateway::RepoManager;
use crate::job::{JobEnv, MergeJob};
use regex::Regex;
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;

pub struct Bot {
    forge: Arc<dyn Forge>,
    repos: RepoManager,
    clock: Arc<dyn Clock>,
    cancel: CancelFlag,
    log: Logger,
    user: User,
    options: MergeOptions,
    project_filter: Regex,
    cycle_sleep: Duration,
}

impl Bot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        forge: Arc<dyn Forge>,
        repos: RepoManager,
        clock: Arc<dyn Clock>,
        cancel: CancelFlag,
        log: Logger,
        user: User,
        options: MergeOptions,
        project_filter: Regex,
        cycle_sleep: Duration,
    ) -> Self {
        Self {
            forge,
            repos,
            clock,
            cancel,
            log,
            user,
            options,
            project_filter,
            cycle_sleep,
        }
    }

    /// Poll until canceled; with `once`, run a single cycle and return.
    pub async fn run(&self, once: bool) {
        loop {
            self.run_cycle().await;
            if once || self.cancel.is_canceled() {
                return;
            }
            debug!(self.log, "Sleeping for {:?} before the next poll", self.cycle_sleep);
            self.clock.sleep(self.cycle_sleep).await;
            if self.cancel.is_canceled() {
                return;
            }
        }
    }

    async fn run_cycle(&self) {
        info!(self.log, "Finding out my current projects");
        let projects = match self.forge.my_projects().await {
            Ok(projects) => projects,
            Err(err) => {
                warn!(self.log, "Failed to list projects: {}", err);
                return;
            }
        };
        for project in projects {
            if self.cancel.is_canceled() {
                return;
            }
            if self.should_process(&project) {
                self.process_project(&project).await;
            }
        }
    }

    fn should_process(&self, project: &Project) -> bool {
        if !self.project_filter.is_match(&project.path_with_namespace) {
            debug!(self.log, "{} does not match the project filter", project.path_with_namespace);
            return false;
        }
        if project.access_level() < AccessLevel::Reporter {
            warn!(
                self.log,
                "Don't have enough permissions to browse merge requests in {}!", project.path_with_namespace
            );
            return false;
        }
        true
    }

    async fn process_project(&self, project: &Project) {
        let mrs = match self.forge.assigned_mrs(project.id, self.user.id).await {
            Ok(mrs) => mrs,
            Err(err) => {
                warn!(
                    self.log,
                    "Failed to list merge requests in {}: {}", project.path_with_namespace, err
                );
                return;
            }
        };
        let Some(mr) = mrs.into_iter().next() else {
            debug!(self.log, "Nothing to merge in {} at this point", project.path_with_namespace);
            return;
        };
        info!(
            self.log,
            "Got !{} to merge in {}; starting a job", mr.iid, project.path_with_namespace
        );

        let source_project = if mr.is_fork() {
            match self.forge.get_project(mr.source_project_id).await {
                Ok(source) => Some(source),
                Err(err) => {
                    warn!(self.log, "Failed to fetch the fork's source project: {}", err);
                    return;
                }
            }
        } else {
            None
        };

        let repo = match self.repos.repo_for_project(project, source_project.as_ref()).await {
            Ok(repo) => repo,
            Err(err) => {
                warn!(
                    self.log,
                    "Couldn't prepare the repository for {}: {:#}", project.path_with_namespace, err
                );
                return;
            }
        };

        let env = JobEnv {
            forge: self.forge.clone(),
            repo: Arc::new(repo),
            clock: self.clock.clone(),
            cancel: self.cancel.clone(),
            log: self
                .log
                .new(o!("project" => project.path_with_namespace.clone(), "mr" => mr.iid)),
        };
        let job = MergeJob::new(env, self.user.clone(), project.clone(), mr, self.options.clone());
        if let Err(err) = job.execute().await {
            // The job already explained itself on the merge request
            debug!(self.log, "Merge job ended with: {}", err);
        }
    }
}
