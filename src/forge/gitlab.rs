//! GitLab REST client.
//!
//! Speaks the v4 API with a bearer token. When impersonating an approver,
//! a `Sudo: <username>` header is added (requires the bot to be an admin).
//! All failure mapping lives in [`classify_status`]; callers only ever see
//! the [`ForgeError`] taxonomy.

use super::types::{ApprovalState, Branch, MergeRequest, Pipeline, Project, User};
use super::{classify_status, Forge, ForgeError, ForgeResult};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

/// Projects per page when listing memberships.
const PAGE_SIZE: u32 = 100;

pub struct GitLabForge {
    http: Client,
    base: Url,
    token: String,
}

impl GitLabForge {
    pub fn new(base_url: &str, token: String) -> anyhow::Result<Self> {
        let base = Url::parse(base_url).context("invalid GitLab URL")?;
        anyhow::ensure!(
            !base.cannot_be_a_base(),
            "GitLab URL must be an http(s) URL, got {base_url:?}"
        );
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("building HTTP client")?;
        Ok(Self { http, base, token })
    }

    /// Build `<base>/api/v4/<segments...>`, percent-encoding each segment
    /// (branch names may contain slashes).
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("api").push("v4").extend(segments);
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        sudo: Option<&str>,
    ) -> ForgeResult<reqwest::Response> {
        let mut request = self.http.request(method, url).bearer_auth(&self.token);
        if let Some(username) = sudo {
            request = request.header("Sudo", username);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| ForgeError::Network(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status.as_u16(), extract_message(&body)))
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> ForgeResult<T> {
        self.send(Method::GET, url, None, None)
            .await?
            .json()
            .await
            .map_err(|err| ForgeError::Network(err.to_string()))
    }

    async fn call(&self, method: Method, url: Url, body: &Value, sudo: Option<&str>) -> ForgeResult<()> {
        self.send(method, url, Some(body), sudo).await?;
        Ok(())
    }
}

/// Pull the `message` field out of a GitLab error body, falling back to the
/// raw text.
fn extract_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        match value.get("message") {
            Some(Value::String(message)) => return message.clone(),
            Some(other) => return other.to_string(),
            None => {}
        }
    }
    body.trim().to_string()
}

#[async_trait]
impl Forge for GitLabForge {
    async fn current_user(&self) -> ForgeResult<User> {
        self.get_json(self.endpoint(&["user"])).await
    }

    async fn get_user(&self, user_id: u64) -> ForgeResult<User> {
        self.get_json(self.endpoint(&["users", &user_id.to_string()])).await
    }

    async fn get_project(&self, project_id: u64) -> ForgeResult<Project> {
        self.get_json(self.endpoint(&["projects", &project_id.to_string()])).await
    }

    async fn my_projects(&self) -> ForgeResult<Vec<Project>> {
        let mut projects = Vec::new();
        for page in 1.. {
            let mut url = self.endpoint(&["projects"]);
            url.query_pairs_mut()
                .append_pair("membership", "true")
                .append_pair("per_page", &PAGE_SIZE.to_string())
                .append_pair("page", &page.to_string());
            let batch: Vec<Project> = self.get_json(url).await?;
            let done = batch.len() < PAGE_SIZE as usize;
            projects.extend(batch);
            if done {
                break;
            }
        }
        Ok(projects)
    }

    async fn get_mr(&self, project_id: u64, iid: u64) -> ForgeResult<MergeRequest> {
        let url = self.endpoint(&["projects", &project_id.to_string(), "merge_requests", &iid.to_string()]);
        self.get_json(url).await
    }

    async fn assigned_mrs(&self, project_id: u64, assignee_id: u64) -> ForgeResult<Vec<MergeRequest>> {
        let mut url = self.endpoint(&["projects", &project_id.to_string(), "merge_requests"]);
        url.query_pairs_mut()
            .append_pair("state", "opened")
            .append_pair("assignee_id", &assignee_id.to_string())
            .append_pair("order_by", "created_at")
            .append_pair("sort", "asc");
        self.get_json(url).await
    }

    async fn get_branch(&self, project_id: u64, branch: &str) -> ForgeResult<Branch> {
        let url = self.endpoint(&["projects", &project_id.to_string(), "repository", "branches", branch]);
        self.get_json(url).await
    }

    async fn list_pipelines(&self, project_id: u64, branch: &str) -> ForgeResult<Vec<Pipeline>> {
        let mut url = self.endpoint(&["projects", &project_id.to_string(), "pipelines"]);
        url.query_pairs_mut().append_pair("ref", branch);
        let mut pipelines: Vec<Pipeline> = self.get_json(url).await?;
        pipelines.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(pipelines)
    }

    async fn get_approvals(&self, project_id: u64, iid: u64) -> ForgeResult<ApprovalState> {
        let url = self.endpoint(&[
            "projects",
            &project_id.to_string(),
            "merge_requests",
            &iid.to_string(),
            "approvals",
        ]);
        self.get_json(url).await
    }

    async fn approve(&self, project_id: u64, iid: u64, sudo: Option<&str>) -> ForgeResult<()> {
        let url = self.endpoint(&[
            "projects",
            &project_id.to_string(),
            "merge_requests",
            &iid.to_string(),
            "approve",
        ]);
        self.call(Method::POST, url, &json!({}), sudo).await
    }

    async fn accept_mr(&self, project_id: u64, iid: u64, sha: &str, remove_source_branch: bool) -> ForgeResult<()> {
        let url = self.endpoint(&[
            "projects",
            &project_id.to_string(),
            "merge_requests",
            &iid.to_string(),
            "merge",
        ]);
        let body = json!({
            "sha": sha,
            "should_remove_source_branch": remove_source_branch,
            "merge_when_pipeline_succeeds": true,
        });
        self.call(Method::PUT, url, &body, None).await
    }

    async fn assign_mr(&self, project_id: u64, iid: u64, assignee_id: u64) -> ForgeResult<()> {
        let url = self.endpoint(&["projects", &project_id.to_string(), "merge_requests", &iid.to_string()]);
        self.call(Method::PUT, url, &json!({ "assignee_id": assignee_id }), None).await
    }

    async fn comment_mr(&self, project_id: u64, iid: u64, text: &str) -> ForgeResult<()> {
        let url = self.endpoint(&[
            "projects",
            &project_id.to_string(),
            "merge_requests",
            &iid.to_string(),
            "notes",
        ]);
        self.call(Method::POST, url, &json!({ "body": text }), None).await
    }
}
