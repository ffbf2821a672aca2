//! Shared test doubles.
//!
//! The state machine is tested the way the design notes prescribe: `Forge`,
//! `Repo` and `Clock` are scripted fakes around one shared state cell, so a
//! push through the fake repo moves the branch head the fake forge reports,
//! and scripted responses can mutate the world mid-flight (someone closes
//! the request, the target branch moves, a branch becomes protected).

use crate::cancel::CancelFlag;
use crate::clock::Clock;
use crate::config::MergeOptions;
use crate::forge::types::{
    ApprovalState, Branch, CommitRef, MergeRequest, MrState, Pipeline, PipelineStatus, Project, User, UserRef,
};
use crate::forge::{Forge, ForgeError, ForgeResult};
use crate::git_gateway::{GitResult, Repo, Trailer};
use crate::job::{JobEnv, MergeJob};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use slog::{o, Drain, Logger};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BOT_ID: u64 = 87;
pub const AUTHOR_ID: u64 = 1017;
pub const PROJECT_ID: u64 = 1234;
pub const MR_IID: u64 = 54;

/// A scripted change to the fake world, applied after the response that
/// carries it is produced.
#[derive(Debug, Clone)]
pub enum Mutation {
    MrState(MrState),
    Wip(bool),
    TargetHead(String),
    SourceHead(String),
    SourceProtected(bool),
}

impl Mutation {
    pub fn target_head(sha: &str) -> Self {
        Mutation::TargetHead(sha.to_string())
    }

    pub fn source_head(sha: &str) -> Self {
        Mutation::SourceHead(sha.to_string())
    }
}

pub struct AcceptScript {
    pub result: Result<(), ForgeError>,
    pub then: Vec<Mutation>,
}

impl AcceptScript {
    pub fn err(error: ForgeError) -> Self {
        Self {
            result: Err(error),
            then: Vec::new(),
        }
    }

    pub fn err_then(error: ForgeError, then: Vec<Mutation>) -> Self {
        Self {
            result: Err(error),
            then,
        }
    }
}

pub struct PushScript {
    pub result: GitResult<()>,
    pub then: Vec<Mutation>,
}

#[derive(Clone)]
pub struct PipelinePoll {
    pub status: Option<PipelineStatus>,
    pub then: Vec<Mutation>,
}

impl PipelinePoll {
    pub fn status(status: PipelineStatus) -> Self {
        Self {
            status: Some(status),
            then: Vec::new(),
        }
    }
}

pub struct FakeState {
    pub mr: MergeRequest,
    pub project: Project,
    pub users: Vec<User>,
    pub source_head: String,
    pub source_protected: bool,
    pub target_head: String,
    pub last_local_tip: String,
    // Scripted responses. Queues with more than one entry pop; the last
    // entry repeats forever (accept/rebase/rewrite/push queues just pop,
    // with a sensible default once empty).
    pub pipeline_script: VecDeque<PipelinePoll>,
    pub approvals_script: VecDeque<ApprovalState>,
    pub accept_script: VecDeque<AcceptScript>,
    pub rebase_script: VecDeque<GitResult<String>>,
    pub rewrite_script: VecDeque<GitResult<String>>,
    pub push_script: VecDeque<PushScript>,
    pub mr_fetch_errors: VecDeque<ForgeError>,
    // Observed calls
    pub notes: Vec<String>,
    pub assignments: Vec<u64>,
    pub accept_shas: Vec<String>,
    pub approve_sudo: Vec<Option<String>>,
    pub pushes: Vec<(String, String)>,
    pub rewrites: Vec<(Vec<Trailer>, Option<Trailer>)>,
    pub fetches: usize,
    /// Coarse journal of mutating/polling calls, for ordering assertions.
    pub calls: Vec<&'static str>,
}

impl FakeState {
    fn apply(&mut self, mutations: &[Mutation]) {
        for mutation in mutations {
            match mutation {
                Mutation::MrState(state) => self.mr.state = *state,
                Mutation::Wip(wip) => self.mr.work_in_progress = *wip,
                Mutation::TargetHead(sha) => self.target_head = sha.clone(),
                Mutation::SourceHead(sha) => {
                    self.source_head = sha.clone();
                    self.mr.sha = sha.clone();
                }
                Mutation::SourceProtected(protected) => self.source_protected = *protected,
            }
        }
    }

    fn record_push(&mut self) {
        let tip = self.last_local_tip.clone();
        self.source_head = tip.clone();
        self.mr.sha = tip;
    }
}

fn make_project(discussions_must_resolve: bool) -> Project {
    serde_json::from_value(serde_json::json!({
        "id": PROJECT_ID,
        "path_with_namespace": "group/repo",
        "ssh_url_to_repo": "git@gitlab.example.com:group/repo.git",
        "only_allow_merge_if_pipeline_succeeds": true,
        "only_allow_merge_if_all_discussions_are_resolved": discussions_must_resolve,
        "permissions": {"project_access": {"access_level": 40}}
    }))
    .unwrap()
}

fn bot_user() -> User {
    User {
        id: BOT_ID,
        username: "mergeotron".to_string(),
        name: "Mergeotron".to_string(),
        email: Some("mergeotron@example.com".to_string()),
        is_admin: true,
    }
}

fn author_user() -> User {
    User {
        id: AUTHOR_ID,
        username: "tarquin".to_string(),
        name: "Tarquin".to_string(),
        email: Some("tarquin@example.com".to_string()),
        is_admin: false,
    }
}

fn default_mr() -> MergeRequest {
    MergeRequest {
        iid: MR_IID,
        project_id: PROJECT_ID,
        source_project_id: PROJECT_ID,
        target_project_id: PROJECT_ID,
        source_branch: "useless_new_feature".to_string(),
        target_branch: "master".to_string(),
        sha: "deadbeef".to_string(),
        state: MrState::Opened,
        work_in_progress: false,
        squash: false,
        assignee: Some(UserRef {
            id: BOT_ID,
            username: "mergeotron".to_string(),
            name: "Mergeotron".to_string(),
        }),
        author: UserRef {
            id: AUTHOR_ID,
            username: "tarquin".to_string(),
            name: "Tarquin".to_string(),
        },
        web_url: "https://gitlab.example.com/group/repo/merge_requests/54".to_string(),
    }
}

#[derive(Clone)]
pub struct FakeForge {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl Forge for FakeForge {
    async fn current_user(&self) -> ForgeResult<User> {
        Ok(self.state.lock().unwrap().users[0].clone())
    }

    async fn get_user(&self, user_id: u64) -> ForgeResult<User> {
        self.state
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|user| user.id == user_id)
            .cloned()
            .ok_or(ForgeError::NotFound)
    }

    async fn get_project(&self, _project_id: u64) -> ForgeResult<Project> {
        Ok(self.state.lock().unwrap().project.clone())
    }

    async fn my_projects(&self) -> ForgeResult<Vec<Project>> {
        Ok(vec![self.state.lock().unwrap().project.clone()])
    }

    async fn get_mr(&self, _project_id: u64, _iid: u64) -> ForgeResult<MergeRequest> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.mr_fetch_errors.pop_front() {
            return Err(err);
        }
        state.calls.push("get_mr");
        Ok(state.mr.clone())
    }

    async fn assigned_mrs(&self, _project_id: u64, assignee_id: u64) -> ForgeResult<Vec<MergeRequest>> {
        let state = self.state.lock().unwrap();
        if state.mr.assignee_id() == Some(assignee_id) {
            Ok(vec![state.mr.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    async fn get_branch(&self, _project_id: u64, branch: &str) -> ForgeResult<Branch> {
        let state = self.state.lock().unwrap();
        if branch == state.mr.source_branch {
            Ok(Branch {
                name: branch.to_string(),
                protected: state.source_protected,
                commit: CommitRef {
                    id: state.source_head.clone(),
                },
            })
        } else if branch == state.mr.target_branch {
            Ok(Branch {
                name: branch.to_string(),
                protected: true,
                commit: CommitRef {
                    id: state.target_head.clone(),
                },
            })
        } else {
            Err(ForgeError::NotFound)
        }
    }

    async fn list_pipelines(&self, _project_id: u64, branch: &str) -> ForgeResult<Vec<Pipeline>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("list_pipelines");
        let poll = if state.pipeline_script.len() > 1 {
            state.pipeline_script.pop_front().unwrap()
        } else {
            state
                .pipeline_script
                .front()
                .cloned()
                .unwrap_or(PipelinePoll {
                    status: None,
                    then: Vec::new(),
                })
        };
        let pipelines = match poll.status {
            Some(status) => vec![Pipeline {
                id: 47,
                ref_: branch.to_string(),
                sha: state.source_head.clone(),
                status,
            }],
            None => Vec::new(),
        };
        state.apply(&poll.then);
        Ok(pipelines)
    }

    async fn get_approvals(&self, _project_id: u64, _iid: u64) -> ForgeResult<ApprovalState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("get_approvals");
        let approvals = if state.approvals_script.len() > 1 {
            state.approvals_script.pop_front().unwrap()
        } else {
            state.approvals_script.front().cloned().unwrap_or_default()
        };
        Ok(approvals)
    }

    async fn approve(&self, _project_id: u64, _iid: u64, sudo: Option<&str>) -> ForgeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("approve");
        state.approve_sudo.push(sudo.map(str::to_string));
        Ok(())
    }

    async fn accept_mr(&self, _project_id: u64, _iid: u64, sha: &str, _remove_source_branch: bool) -> ForgeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("accept");
        state.accept_shas.push(sha.to_string());
        match state.accept_script.pop_front() {
            Some(script) => {
                if script.result.is_ok() {
                    state.mr.state = MrState::Merged;
                    state.target_head = sha.to_string();
                }
                state.apply(&script.then);
                script.result
            }
            None => {
                state.mr.state = MrState::Merged;
                state.target_head = sha.to_string();
                Ok(())
            }
        }
    }

    async fn assign_mr(&self, _project_id: u64, _iid: u64, assignee_id: u64) -> ForgeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("assign");
        state.assignments.push(assignee_id);
        Ok(())
    }

    async fn comment_mr(&self, _project_id: u64, _iid: u64, text: &str) -> ForgeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("comment");
        state.notes.push(text.to_string());
        Ok(())
    }
}

#[derive(Clone)]
pub struct FakeRepo {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl Repo for FakeRepo {
    async fn fetch(&self) -> GitResult<()> {
        self.state.lock().unwrap().fetches += 1;
        Ok(())
    }

    async fn rebase(&self, _branch: &str, _onto: &str) -> GitResult<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("rebase");
        let fallback = format!("rebased-{}", state.target_head);
        let result = state.rebase_script.pop_front().unwrap_or(Ok(fallback));
        if let Ok(tip) = &result {
            state.last_local_tip = tip.clone();
        }
        result
    }

    async fn rewrite_trailers(
        &self,
        _branch: &str,
        _base: &str,
        trailers: &[Trailer],
        tip_trailer: Option<&Trailer>,
    ) -> GitResult<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("rewrite");
        state.rewrites.push((trailers.to_vec(), tip_trailer.cloned()));
        let fallback = state.last_local_tip.clone();
        let result = state.rewrite_script.pop_front().unwrap_or(Ok(fallback));
        if let Ok(tip) = &result {
            state.last_local_tip = tip.clone();
        }
        result
    }

    async fn push(&self, branch: &str, expected_sha: &str) -> GitResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("push");
        state.pushes.push((branch.to_string(), expected_sha.to_string()));
        match state.push_script.pop_front() {
            Some(script) => {
                if script.result.is_ok() {
                    state.record_push();
                }
                state.apply(&script.then);
                script.result
            }
            None => {
                state.record_push();
                Ok(())
            }
        }
    }

    async fn get_commit_hash(&self, _reference: &str) -> GitResult<String> {
        Ok(self.state.lock().unwrap().last_local_tip.clone())
    }
}

/// Deterministic clock: `sleep` advances `now` instantly.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    /// Starts on a Wednesday noon, well clear of weekend embargo windows.
    pub fn new() -> Self {
        Self::starting_at(Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap())
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn sleep_count(&self) -> usize {
        self.sleeps.lock().unwrap().len()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    pub fn set_now(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap() = instant;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        let mut now = self.now.lock().unwrap();
        *now = *now + delta;
        drop(now);
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// A drain that keeps every formatted message for assertions.
#[derive(Clone)]
pub struct CapturedLogs(Arc<Mutex<Vec<String>>>);

impl CapturedLogs {
    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Drain for CapturedLogs {
    type Ok = ();
    type Err = slog::Never;

    fn log(&self, record: &slog::Record, _values: &slog::OwnedKVList) -> Result<(), slog::Never> {
        self.0.lock().unwrap().push(format!("{}", record.msg()));
        Ok(())
    }
}

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

pub fn capturing_logger() -> (Logger, CapturedLogs) {
    let captured = CapturedLogs(Arc::new(Mutex::new(Vec::new())));
    (Logger::root(captured.clone(), o!()), captured)
}

/// One fake world: an MR assigned to the bot with source head `deadbeef`,
/// target head `c0ffee`, a scripted rebase to `af7a`, and a pipeline that
/// goes running -> success. Tests bend it from there.
pub struct Fixture {
    pub state: Arc<Mutex<FakeState>>,
    pub clock: Arc<ManualClock>,
    pub cancel: CancelFlag,
}

impl Fixture {
    pub fn new() -> Self {
        let state = FakeState {
            mr: default_mr(),
            project: make_project(false),
            users: vec![bot_user(), author_user()],
            source_head: "deadbeef".to_string(),
            source_protected: false,
            target_head: "c0ffee".to_string(),
            last_local_tip: "deadbeef".to_string(),
            pipeline_script: VecDeque::from([
                PipelinePoll::status(PipelineStatus::Running),
                PipelinePoll::status(PipelineStatus::Success),
            ]),
            approvals_script: VecDeque::new(),
            accept_script: VecDeque::new(),
            rebase_script: VecDeque::from([Ok("af7a".to_string())]),
            rewrite_script: VecDeque::new(),
            push_script: VecDeque::new(),
            mr_fetch_errors: VecDeque::new(),
            notes: Vec::new(),
            assignments: Vec::new(),
            accept_shas: Vec::new(),
            approve_sudo: Vec::new(),
            pushes: Vec::new(),
            rewrites: Vec::new(),
            fetches: 0,
            calls: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            clock: Arc::new(ManualClock::new()),
            cancel: CancelFlag::new(),
        }
    }

    pub fn forge(&self) -> FakeForge {
        FakeForge {
            state: self.state.clone(),
        }
    }

    pub fn repo(&self) -> FakeRepo {
        FakeRepo {
            state: self.state.clone(),
        }
    }

    pub fn job(&self) -> MergeJob {
        self.job_with(MergeOptions::default())
    }

    pub fn job_with(&self, options: MergeOptions) -> MergeJob {
        self.job_logged(options, test_logger())
    }

    pub fn job_logged(&self, options: MergeOptions, log: Logger) -> MergeJob {
        let (user, project, mr) = {
            let state = self.state.lock().unwrap();
            (state.users[0].clone(), state.project.clone(), state.mr.clone())
        };
        let env = JobEnv {
            forge: Arc::new(self.forge()),
            repo: Arc::new(self.repo()),
            clock: self.clock.clone(),
            cancel: self.cancel.clone(),
            log,
        };
        MergeJob::new(env, user, project, mr, options)
    }

    // --- scripting -------------------------------------------------------

    pub fn script_pipelines(&self, statuses: &[Option<PipelineStatus>]) {
        self.script_pipeline_polls(
            statuses
                .iter()
                .map(|status| PipelinePoll {
                    status: *status,
                    then: Vec::new(),
                })
                .collect(),
        );
    }

    pub fn script_pipeline_polls(&self, polls: Vec<PipelinePoll>) {
        self.state.lock().unwrap().pipeline_script = polls.into();
    }

    pub fn script_approvals(&self, states: Vec<ApprovalState>) {
        self.state.lock().unwrap().approvals_script = states.into();
    }

    pub fn script_accepts(&self, scripts: Vec<AcceptScript>) {
        self.state.lock().unwrap().accept_script = scripts.into();
    }

    pub fn script_rebases(&self, results: Vec<GitResult<String>>) {
        self.state.lock().unwrap().rebase_script = results.into();
    }

    pub fn script_pushes(&self, scripts: Vec<PushScript>) {
        self.state.lock().unwrap().push_script = scripts.into();
    }

    pub fn script_mr_fetch_errors(&self, errors: Vec<ForgeError>) {
        self.state.lock().unwrap().mr_fetch_errors = errors.into();
    }

    pub fn add_user(&self, user: User) {
        self.state.lock().unwrap().users.push(user);
    }

    // --- world setup -----------------------------------------------------

    pub fn set_wip(&self) {
        self.state.lock().unwrap().mr.work_in_progress = true;
    }

    pub fn set_squash(&self) {
        self.state.lock().unwrap().mr.squash = true;
    }

    pub fn set_state(&self, state: MrState) {
        self.state.lock().unwrap().mr.state = state;
    }

    pub fn clear_assignee(&self) {
        self.state.lock().unwrap().mr.assignee = None;
    }

    pub fn set_source_protected(&self) {
        self.state.lock().unwrap().source_protected = true;
    }

    pub fn set_source_head(&self, sha: &str) {
        let mut state = self.state.lock().unwrap();
        state.source_head = sha.to_string();
        state.mr.sha = sha.to_string();
    }

    pub fn require_resolved_discussions(&self) {
        self.state.lock().unwrap().project = make_project(true);
    }

    // --- observations ----------------------------------------------------

    pub fn notes(&self) -> Vec<String> {
        self.state.lock().unwrap().notes.clone()
    }

    pub fn assignments(&self) -> Vec<u64> {
        self.state.lock().unwrap().assignments.clone()
    }

    pub fn accept_shas(&self) -> Vec<String> {
        self.state.lock().unwrap().accept_shas.clone()
    }

    pub fn approve_sudos(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().approve_sudo.clone()
    }

    pub fn pushes(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().pushes.clone()
    }

    pub fn rewrites(&self) -> Vec<(Vec<Trailer>, Option<Trailer>)> {
        self.state.lock().unwrap().rewrites.clone()
    }

    pub fn mr_state(&self) -> MrState {
        self.state.lock().unwrap().mr.state
    }

    pub fn source_head(&self) -> String {
        self.state.lock().unwrap().source_head.clone()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }
}
