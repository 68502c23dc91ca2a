//! GitLab adapter for the source-control seam.
//!
//! GitLab addresses projects by URL-encoded full path and issues by `iid`; assignment is done by
//! numeric user id, so the username operations resolve through `/users` first.

use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};

use bridge_core::model::Project;
use bridge_core::{Error, Result, SourceControl};
use bridge_engine::comments;

use crate::github::repo_path;

#[derive(Clone, Debug)]
pub struct GitlabClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

fn encoded_project_path(project: &Project) -> Result<String> {
    Ok(repo_path(&project.repo_url)?.replace('/', "%2F"))
}

impl GitlabClient {
    pub fn new(base_url: String, token: String) -> Self {
        Self {
            base_url,
            token,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        let joined = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        Url::parse(&joined).map_err(|err| Error::fatal(anyhow::anyhow!("gitlab url: {err}")))
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response> {
        let resp = req
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(|err| Error::external(anyhow::anyhow!("{what}: {err}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("{what}: not found")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::external(anyhow::anyhow!(
                "{what} returned {status}: {body}"
            )));
        }
        Ok(resp)
    }

    async fn edit_issue(&self, project: &Project, number: i64, body: Value) -> Result<()> {
        let path = encoded_project_path(project)?;
        let what = "PUT issue";
        let url = self.url(&format!("/projects/{path}/issues/{number}"))?;
        self.send(self.http.put(url).json(&body), what).await?;
        Ok(())
    }
}

#[async_trait]
impl SourceControl for GitlabClient {
    async fn create_comment(&self, project: &Project, number: i64, body: &str) -> Result<()> {
        let path = encoded_project_path(project)?;
        let what = "POST issue note";
        let url = self.url(&format!("/projects/{path}/issues/{number}/notes"))?;
        self.send(self.http.post(url).json(&json!({"body": body})), what)
            .await?;
        Ok(())
    }

    async fn add_labels(&self, project: &Project, number: i64, labels: &[String]) -> Result<()> {
        self.edit_issue(project, number, json!({"add_labels": labels.join(",")}))
            .await
    }

    async fn replace_labels(
        &self,
        project: &Project,
        number: i64,
        labels: &[String],
    ) -> Result<()> {
        self.edit_issue(project, number, json!({"labels": labels.join(",")}))
            .await
    }

    async fn assign_user(&self, project: &Project, number: i64, username: &str) -> Result<()> {
        let user_id = self.user_id_by_username(project, username).await?;
        self.edit_issue(project, number, json!({"assignee_ids": [user_id]}))
            .await
    }

    async fn unassign_user(&self, project: &Project, number: i64, _username: &str) -> Result<()> {
        self.edit_issue(project, number, json!({"assignee_ids": []}))
            .await
    }

    async fn username_by_id(&self, _project: &Project, user_id: i64) -> Result<String> {
        let what = "GET user by id";
        let url = self.url(&format!("/users/{user_id}"))?;
        let resp = self.send(self.http.get(url), what).await?;
        let raw: Value = resp
            .json()
            .await
            .map_err(|err| Error::external(anyhow::anyhow!("decode user: {err}")))?;
        raw["username"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::external(anyhow::anyhow!("user response missing username")))
    }

    async fn user_id_by_username(&self, _project: &Project, username: &str) -> Result<i64> {
        let what = "GET users by username";
        let url = self.url(&format!("/users?username={username}"))?;
        let resp = self.send(self.http.get(url), what).await?;
        let raw: Value = resp
            .json()
            .await
            .map_err(|err| Error::external(anyhow::anyhow!("decode users: {err}")))?;
        raw.as_array()
            .and_then(|users| users.first())
            .and_then(|user| user["id"].as_i64())
            .ok_or_else(|| Error::not_found(format!("gitlab user {username} not found")))
    }

    async fn update_title(&self, project: &Project, number: i64, title: &str) -> Result<()> {
        self.edit_issue(project, number, json!({"title": title})).await
    }

    async fn reopen_issue(&self, project: &Project, number: i64) -> Result<()> {
        self.edit_issue(project, number, json!({"state_event": "reopen"}))
            .await
    }

    async fn mark_paid(
        &self,
        project: &Project,
        number: i64,
        challenge_url: &str,
        winner: &str,
    ) -> Result<()> {
        let path = encoded_project_path(project)?;
        let what = "POST paid marker";
        let url = self.url(&format!("/projects/{path}/issues/{number}/notes"))?;
        let body = comments::paid(challenge_url, winner);
        self.send(self.http.post(url).json(&json!({"body": body})), what)
            .await?;
        Ok(())
    }
}
