//! Contest-platform HTTP client.
//!
//! Thin typed wrapper over the v5 contest API. The engine hands this crate a flat
//! `prizes: &[u64]` vector; the wire `prizeSets` translation (placement vs copilot) happens
//! here and nowhere else. Every call carries the cached machine token.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};

use bridge_core::{
    Challenge, ChallengePatch, ChallengeStatus, ContestApi, Error, NewChallenge, ResourceRole,
    Result, Winner,
};

pub mod token;

use token::TokenCache;

/// Challenge type/track/timeline constants for pure-v5 task challenges. Overridable via config
/// for staging environments.
pub const DEFAULT_TYPE_ID: &str = "e885273d-aeda-42c0-917d-bfbf979afbba";
pub const DEFAULT_TRACK_ID: &str = "9b6fc876-f4d9-4ccb-9dfd-419247628825";
pub const DEFAULT_TIMELINE_TEMPLATE_ID: &str = "53a307ce-b4b3-4d6f-90e1-e1f929a9b775";

#[derive(Debug, Clone)]
pub struct ContestConfig {
    /// Base URL of the v5 API, e.g. `https://api.example.com/v5`.
    pub api_base: String,
    pub type_id: String,
    pub track_id: String,
    pub timeline_template_id: String,
}

impl ContestConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            type_id: DEFAULT_TYPE_ID.to_string(),
            track_id: DEFAULT_TRACK_ID.to_string(),
            timeline_template_id: DEFAULT_TIMELINE_TEMPLATE_ID.to_string(),
        }
    }
}

pub struct ContestClient {
    cfg: ContestConfig,
    http: reqwest::Client,
    token: TokenCache,
}

impl ContestClient {
    pub fn new(cfg: ContestConfig, http: reqwest::Client, token: TokenCache) -> Self {
        Self { cfg, http, token }
    }

    fn url(&self, path: &str) -> Result<Url> {
        let joined = format!("{}{}", self.cfg.api_base.trim_end_matches('/'), path);
        Url::parse(&joined).map_err(|err| Error::fatal(anyhow::anyhow!("contest url: {err}")))
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let bearer = self.token.bearer().await?;
        let resp = req
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|err| Error::external(anyhow::anyhow!("{what}: {err}")))?;
        Ok(resp)
    }

    async fn expect_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("{what}: not found")));
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::external(anyhow::anyhow!(
            "{what} returned {status}: {body}"
        )))
    }
}

/// Translate a flat prize vector into the v5 `prizeSets` shape.
pub fn prize_sets(prizes: &[u64], copilot_payment: bool) -> Value {
    let kind = if copilot_payment { "copilot" } else { "placement" };
    json!([{
        "type": kind,
        "prizes": prizes
            .iter()
            .map(|value| json!({"type": "USD", "value": value}))
            .collect::<Vec<_>>(),
    }])
}

fn parse_status(raw: &str) -> Result<ChallengeStatus> {
    match raw {
        "Draft" => Ok(ChallengeStatus::Draft),
        "Active" => Ok(ChallengeStatus::Active),
        "Completed" => Ok(ChallengeStatus::Completed),
        "Cancelled" | "Canceled" => Ok(ChallengeStatus::Canceled),
        other => Err(Error::validation(format!(
            "unknown challenge status: {other}"
        ))),
    }
}

#[async_trait]
impl ContestApi for ContestClient {
    async fn create_challenge(&self, req: &NewChallenge) -> Result<String> {
        let mut description = req.description.clone();
        if let Some(guidelines) = &req.submission_guidelines {
            description.push_str("\n\n### Submission guidelines\n\n");
            description.push_str(guidelines);
        }

        let body = json!({
            "typeId": self.cfg.type_id,
            "name": req.name,
            "description": description,
            "prizeSets": prize_sets(&req.prizes, req.copilot_payment),
            "timelineTemplateId": self.cfg.timeline_template_id,
            "projectId": req.project_id,
            "trackId": self.cfg.track_id,
            "legacy": {"pureV5Task": true},
            "startDate": Utc::now().to_rfc3339(),
        });

        let url = self.url("/challenges")?;
        let resp = self
            .send(self.http.post(url).json(&body), "POST /challenges")
            .await?;
        let resp = Self::expect_success(resp, "POST /challenges").await?;

        let created: Value = resp
            .json()
            .await
            .map_err(|err| Error::external(anyhow::anyhow!("decode challenge: {err}")))?;
        created["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::external(anyhow::anyhow!("challenge response missing id")))
    }

    async fn update_challenge(&self, challenge_id: &str, patch: &ChallengePatch) -> Result<()> {
        let mut body = serde_json::Map::new();
        if let Some(name) = &patch.name {
            body.insert("name".to_string(), json!(name));
        }
        if let Some(description) = &patch.description {
            body.insert("description".to_string(), json!(description));
        }
        if let Some(prizes) = &patch.prizes {
            body.insert(
                "prizeSets".to_string(),
                prize_sets(prizes, patch.copilot_payment),
            );
        }
        if let Some(billing_account_id) = patch.billing_account_id {
            body.insert("billingAccountId".to_string(), json!(billing_account_id));
        }

        let what = "PATCH /challenges";
        let url = self.url(&format!("/challenges/{challenge_id}"))?;
        let resp = self
            .send(self.http.patch(url).json(&Value::Object(body)), what)
            .await?;
        Self::expect_success(resp, what).await?;
        Ok(())
    }

    async fn activate_challenge(&self, challenge_id: &str) -> Result<()> {
        let what = "PATCH /challenges (activate)";
        let url = self.url(&format!("/challenges/{challenge_id}"))?;
        let resp = self
            .send(self.http.patch(url).json(&json!({"status": "Active"})), what)
            .await?;
        Self::expect_success(resp, what).await?;
        Ok(())
    }

    async fn close_challenge(&self, challenge_id: &str, winner: &Winner) -> Result<()> {
        let what = "PATCH /challenges (close)";
        let body = json!({
            "status": "Completed",
            "winners": [{
                "userId": winner.user_id,
                "handle": winner.handle,
                "placement": winner.placement,
            }],
        });
        let url = self.url(&format!("/challenges/{challenge_id}"))?;
        let resp = self.send(self.http.patch(url).json(&body), what).await?;
        Self::expect_success(resp, what).await?;
        Ok(())
    }

    async fn cancel_challenge(&self, challenge_id: &str) -> Result<()> {
        // The remote cancel endpoint is not functional; acknowledged as a no-op.
        tracing::warn!(
            event = "bridge.contest.cancel.noop",
            challenge_id = %challenge_id,
            "challenge cancel requested; remote cancel is a no-op"
        );
        Ok(())
    }

    async fn get_challenge(&self, challenge_id: &str) -> Result<Challenge> {
        let what = "GET /challenges/{id}";
        let url = self.url(&format!("/challenges/{challenge_id}"))?;
        let resp = self.send(self.http.get(url), what).await?;
        let resp = Self::expect_success(resp, what).await?;

        let raw: Value = resp
            .json()
            .await
            .map_err(|err| Error::external(anyhow::anyhow!("decode challenge: {err}")))?;
        let status = raw["status"]
            .as_str()
            .ok_or_else(|| Error::external(anyhow::anyhow!("challenge missing status")))?;

        Ok(Challenge {
            id: challenge_id.to_string(),
            name: raw["name"].as_str().unwrap_or_default().to_string(),
            status: parse_status(status)?,
        })
    }

    async fn add_resource(
        &self,
        challenge_id: &str,
        handle: &str,
        role: ResourceRole,
    ) -> Result<()> {
        let what = "POST /resources";
        let body = json!({
            "challengeId": challenge_id,
            "memberHandle": handle,
            "roleId": role.id(),
        });
        let url = self.url("/resources")?;
        let resp = self.send(self.http.post(url).json(&body), what).await?;

        // The member already holding the role is success: keeps close/assign idempotent.
        if resp.status() == StatusCode::CONFLICT {
            tracing::debug!(
                event = "bridge.contest.resource.exists",
                challenge_id = %challenge_id,
                handle = %handle,
                role_id = role.id(),
                "resource already present"
            );
            return Ok(());
        }

        Self::expect_success(resp, what).await?;
        Ok(())
    }

    async fn remove_resource(
        &self,
        challenge_id: &str,
        handle: &str,
        role: ResourceRole,
    ) -> Result<()> {
        let what = "DELETE /resources";
        let body = json!({
            "challengeId": challenge_id,
            "memberHandle": handle,
            "roleId": role.id(),
        });
        let url = self.url("/resources")?;
        let resp = self.send(self.http.delete(url).json(&body), what).await?;

        if resp.status() == StatusCode::NOT_FOUND {
            // Nothing to remove.
            return Ok(());
        }

        Self::expect_success(resp, what).await?;
        Ok(())
    }

    async fn member_id(&self, handle: &str) -> Result<i64> {
        let what = "GET /members/{handle}";
        let url = self.url(&format!("/members/{handle}"))?;
        let resp = self.send(self.http.get(url), what).await?;
        let resp = Self::expect_success(resp, what).await?;

        let raw: Value = resp
            .json()
            .await
            .map_err(|err| Error::external(anyhow::anyhow!("decode member: {err}")))?;
        raw["userId"]
            .as_i64()
            .ok_or_else(|| Error::external(anyhow::anyhow!("member response missing userId")))
    }

    async fn billing_account(&self, project_id: i64) -> Result<i64> {
        let what = "GET /projects/{id}";
        let url = self.url(&format!("/projects/{project_id}"))?;
        let resp = self.send(self.http.get(url), what).await?;
        let resp = Self::expect_success(resp, what).await?;

        let raw: Value = resp
            .json()
            .await
            .map_err(|err| Error::external(anyhow::anyhow!("decode project: {err}")))?;
        raw["billingAccountId"]
            .as_i64()
            .ok_or_else(|| Error::external(anyhow::anyhow!("project missing billingAccountId")))
    }
}
