//! GitHub adapter for the source-control seam.

use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};

use bridge_core::model::Project;
use bridge_core::{Error, Result, SourceControl};
use bridge_engine::comments;

#[derive(Clone, Debug)]
pub struct GithubClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

/// `owner/repo` path out of a repository URL.
pub fn repo_path(repo_url: &str) -> Result<&str> {
    let after_scheme = repo_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(repo_url);
    after_scheme
        .split_once('/')
        .map(|(_, path)| path.trim_end_matches('/'))
        .filter(|path| !path.is_empty())
        .ok_or_else(|| Error::validation(format!("repository url has no path: {repo_url}")))
}

impl GithubClient {
    pub fn new(base_url: String, token: String) -> Self {
        Self {
            base_url,
            token,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        let joined = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        Url::parse(&joined).map_err(|err| Error::fatal(anyhow::anyhow!("github url: {err}")))
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response> {
        let resp = req
            .bearer_auth(&self.token)
            .header("User-Agent", "bridge-processor")
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
}

#[async_trait]
impl SourceControl for GithubClient {
    async fn create_comment(&self, project: &Project, number: i64, body: &str) -> Result<()> {
        let path = repo_path(&project.repo_url)?;
        let what = "POST issue comment";
        let url = self.url(&format!("/repos/{path}/issues/{number}/comments"))?;
        self.send(self.http.post(url).json(&json!({"body": body})), what)
            .await?;
        Ok(())
    }

    async fn add_labels(&self, project: &Project, number: i64, labels: &[String]) -> Result<()> {
        let path = repo_path(&project.repo_url)?;
        let what = "POST issue labels";
        let url = self.url(&format!("/repos/{path}/issues/{number}/labels"))?;
        self.send(self.http.post(url).json(&json!({"labels": labels})), what)
            .await?;
        Ok(())
    }

    async fn replace_labels(
        &self,
        project: &Project,
        number: i64,
        labels: &[String],
    ) -> Result<()> {
        let path = repo_path(&project.repo_url)?;
        let what = "PUT issue labels";
        let url = self.url(&format!("/repos/{path}/issues/{number}/labels"))?;
        self.send(self.http.put(url).json(&json!({"labels": labels})), what)
            .await?;
        Ok(())
    }

    async fn assign_user(&self, project: &Project, number: i64, username: &str) -> Result<()> {
        let path = repo_path(&project.repo_url)?;
        let what = "POST issue assignees";
        let url = self.url(&format!("/repos/{path}/issues/{number}/assignees"))?;
        self.send(
            self.http.post(url).json(&json!({"assignees": [username]})),
            what,
        )
        .await?;
        Ok(())
    }

    async fn unassign_user(&self, project: &Project, number: i64, username: &str) -> Result<()> {
        let path = repo_path(&project.repo_url)?;
        let what = "DELETE issue assignees";
        let url = self.url(&format!("/repos/{path}/issues/{number}/assignees"))?;
        self.send(
            self.http.delete(url).json(&json!({"assignees": [username]})),
            what,
        )
        .await?;
        Ok(())
    }

    async fn username_by_id(&self, _project: &Project, user_id: i64) -> Result<String> {
        let what = "GET user by id";
        let url = self.url(&format!("/user/{user_id}"))?;
        let resp = self.send(self.http.get(url), what).await?;
        let raw: Value = resp
            .json()
            .await
            .map_err(|err| Error::external(anyhow::anyhow!("decode user: {err}")))?;
        raw["login"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::external(anyhow::anyhow!("user response missing login")))
    }

    async fn user_id_by_username(&self, _project: &Project, username: &str) -> Result<i64> {
        let what = "GET user by login";
        let url = self.url(&format!("/users/{username}"))?;
        let resp = self.send(self.http.get(url), what).await?;
        let raw: Value = resp
            .json()
            .await
            .map_err(|err| Error::external(anyhow::anyhow!("decode user: {err}")))?;
        raw["id"]
            .as_i64()
            .ok_or_else(|| Error::external(anyhow::anyhow!("user response missing id")))
    }

    async fn update_title(&self, project: &Project, number: i64, title: &str) -> Result<()> {
        let path = repo_path(&project.repo_url)?;
        let what = "PATCH issue title";
        let url = self.url(&format!("/repos/{path}/issues/{number}"))?;
        self.send(self.http.patch(url).json(&json!({"title": title})), what)
            .await?;
        Ok(())
    }

    async fn reopen_issue(&self, project: &Project, number: i64) -> Result<()> {
        let path = repo_path(&project.repo_url)?;
        let what = "PATCH issue state";
        let url = self.url(&format!("/repos/{path}/issues/{number}"))?;
        self.send(self.http.patch(url).json(&json!({"state": "open"})), what)
            .await?;
        Ok(())
    }

    async fn mark_paid(
        &self,
        project: &Project,
        number: i64,
        challenge_url: &str,
        winner: &str,
    ) -> Result<()> {
        let path = repo_path(&project.repo_url)?;
        let what = "POST paid marker";
        let url = self.url(&format!("/repos/{path}/issues/{number}/comments"))?;
        let body = comments::paid(challenge_url, winner);
        self.send(self.http.post(url).json(&json!({"body": body})), what)
            .await?;
        Ok(())
    }
}
