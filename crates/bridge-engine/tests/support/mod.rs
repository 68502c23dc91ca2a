//! In-memory fakes of the bridge seams, recording every remote interaction so scenarios can
//! assert on the exact calls made.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use bridge_core::event::Event;
use bridge_core::model::{CopilotPayment, Issue, LabelSet, PaymentStatus, Project, Provider};
use bridge_core::{
    Challenge, ChallengePatch, ChallengeStatus, ContestApi, Error, NewChallenge, ResourceRole,
    Result, SourceControl, Store, UserDirectory, Winner,
};
use bridge_engine::{Engine, EngineConfig};

pub const WEB_BASE: &str = "https://contest.example.com";

// ---------------------------------------------------------------------------
// store

#[derive(Default)]
pub struct FakeStore {
    pub projects: Mutex<Vec<Project>>,
    pub issues: Mutex<HashMap<Uuid, Issue>>,
    pub payments: Mutex<HashMap<Uuid, CopilotPayment>>,
}

#[async_trait]
impl Store for FakeStore {
    async fn project_by_repo_url(&self, repo_url: &str) -> Result<Option<Project>> {
        tokio::task::yield_now().await;
        Ok(self
            .projects
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.repo_url == repo_url)
            .cloned())
    }

    async fn project_by_id(&self, id: Uuid) -> Result<Option<Project>> {
        tokio::task::yield_now().await;
        Ok(self
            .projects
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn projects_for_user(&self, handle: &str) -> Result<Vec<Project>> {
        tokio::task::yield_now().await;
        Ok(self
            .projects
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.copilot == handle || p.owner == handle)
            .cloned()
            .collect())
    }

    async fn issue_by_key(
        &self,
        provider: Provider,
        repository_id: i64,
        number: i64,
    ) -> Result<Option<Issue>> {
        tokio::task::yield_now().await;
        Ok(self
            .issues
            .lock()
            .unwrap()
            .values()
            .find(|i| {
                i.provider == provider && i.repository_id == repository_id && i.number == number
            })
            .cloned())
    }

    async fn insert_issue(&self, issue: &Issue) -> Result<()> {
        tokio::task::yield_now().await;
        self.issues.lock().unwrap().insert(issue.id, issue.clone());
        Ok(())
    }

    async fn update_issue(&self, issue: &Issue) -> Result<()> {
        tokio::task::yield_now().await;
        self.issues.lock().unwrap().insert(issue.id, issue.clone());
        Ok(())
    }

    async fn delete_issue(&self, id: Uuid) -> Result<()> {
        tokio::task::yield_now().await;
        self.issues.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn payment_by_id(&self, id: Uuid) -> Result<Option<CopilotPayment>> {
        tokio::task::yield_now().await;
        Ok(self.payments.lock().unwrap().get(&id).cloned())
    }

    async fn open_payments(&self, project: Uuid, username: &str) -> Result<Vec<CopilotPayment>> {
        tokio::task::yield_now().await;
        let mut rows: Vec<_> = self
            .payments
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.project == project && p.username == username && !p.closed)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.created_at);
        Ok(rows)
    }

    async fn payments_by_challenge(&self, challenge_id: &str) -> Result<Vec<CopilotPayment>> {
        tokio::task::yield_now().await;
        let mut rows: Vec<_> = self
            .payments
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.challenge_id.as_deref() == Some(challenge_id) && !p.closed)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.created_at);
        Ok(rows)
    }

    async fn update_payment(&self, payment: &CopilotPayment) -> Result<()> {
        tokio::task::yield_now().await;
        self.payments
            .lock()
            .unwrap()
            .insert(payment.id, payment.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// contest

#[derive(Debug, Clone, PartialEq)]
pub enum ContestCall {
    Create {
        name: String,
        prizes: Vec<u64>,
        copilot: bool,
    },
    Update {
        id: String,
        prizes: Option<Vec<u64>>,
        billing_account_id: Option<i64>,
    },
    Activate(String),
    Close {
        id: String,
        winner: String,
    },
    Cancel(String),
    AddResource {
        id: String,
        handle: String,
        role: i64,
    },
    RemoveResource {
        id: String,
        handle: String,
        role: i64,
    },
}

#[derive(Default)]
pub struct FakeContest {
    pub calls: Mutex<Vec<ContestCall>>,
    pub challenges: Mutex<HashMap<String, ChallengeStatus>>,
    pub counter: Mutex<u32>,
    pub create_delay: Option<Duration>,
    pub fail_create: AtomicBool,
    pub fail_close: AtomicBool,
}

impl FakeContest {
    pub fn creates(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, ContestCall::Create { .. }))
            .count()
    }

    pub fn updates(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, ContestCall::Update { .. }))
            .count()
    }

    pub fn closes(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, ContestCall::Close { .. }))
            .count()
    }
}

#[async_trait]
impl ContestApi for FakeContest {
    async fn create_challenge(&self, req: &NewChallenge) -> Result<String> {
        tokio::task::yield_now().await;
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::external(anyhow::anyhow!("challenge create failed")));
        }

        let id = {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            format!("ch-{}", *counter)
        };
        self.challenges
            .lock()
            .unwrap()
            .insert(id.clone(), ChallengeStatus::Draft);
        self.calls.lock().unwrap().push(ContestCall::Create {
            name: req.name.clone(),
            prizes: req.prizes.clone(),
            copilot: req.copilot_payment,
        });
        Ok(id)
    }

    async fn update_challenge(&self, challenge_id: &str, patch: &ChallengePatch) -> Result<()> {
        tokio::task::yield_now().await;
        self.calls.lock().unwrap().push(ContestCall::Update {
            id: challenge_id.to_string(),
            prizes: patch.prizes.clone(),
            billing_account_id: patch.billing_account_id,
        });
        Ok(())
    }

    async fn activate_challenge(&self, challenge_id: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.challenges
            .lock()
            .unwrap()
            .insert(challenge_id.to_string(), ChallengeStatus::Active);
        self.calls
            .lock()
            .unwrap()
            .push(ContestCall::Activate(challenge_id.to_string()));
        Ok(())
    }

    async fn close_challenge(&self, challenge_id: &str, winner: &Winner) -> Result<()> {
        tokio::task::yield_now().await;
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(Error::external(anyhow::anyhow!("challenge close failed")));
        }
        self.challenges
            .lock()
            .unwrap()
            .insert(challenge_id.to_string(), ChallengeStatus::Completed);
        self.calls.lock().unwrap().push(ContestCall::Close {
            id: challenge_id.to_string(),
            winner: winner.handle.clone(),
        });
        Ok(())
    }

    async fn cancel_challenge(&self, challenge_id: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.calls
            .lock()
            .unwrap()
            .push(ContestCall::Cancel(challenge_id.to_string()));
        Ok(())
    }

    async fn get_challenge(&self, challenge_id: &str) -> Result<Challenge> {
        tokio::task::yield_now().await;
        let status = self
            .challenges
            .lock()
            .unwrap()
            .get(challenge_id)
            .copied()
            .ok_or_else(|| Error::not_found(format!("challenge {challenge_id}")))?;
        Ok(Challenge {
            id: challenge_id.to_string(),
            name: String::new(),
            status,
        })
    }

    async fn add_resource(
        &self,
        challenge_id: &str,
        handle: &str,
        role: ResourceRole,
    ) -> Result<()> {
        tokio::task::yield_now().await;
        self.calls.lock().unwrap().push(ContestCall::AddResource {
            id: challenge_id.to_string(),
            handle: handle.to_string(),
            role: role.id(),
        });
        Ok(())
    }

    async fn remove_resource(
        &self,
        challenge_id: &str,
        handle: &str,
        role: ResourceRole,
    ) -> Result<()> {
        tokio::task::yield_now().await;
        self.calls
            .lock()
            .unwrap()
            .push(ContestCall::RemoveResource {
                id: challenge_id.to_string(),
                handle: handle.to_string(),
                role: role.id(),
            });
        Ok(())
    }

    async fn member_id(&self, handle: &str) -> Result<i64> {
        tokio::task::yield_now().await;
        Ok(6000 + handle.len() as i64)
    }

    async fn billing_account(&self, _project_id: i64) -> Result<i64> {
        tokio::task::yield_now().await;
        Ok(80001)
    }
}

// ---------------------------------------------------------------------------
// source control

#[derive(Default)]
pub struct FakeSource {
    pub comments: Mutex<Vec<String>>,
    /// Current label set per ticket number.
    pub labels: Mutex<HashMap<i64, Vec<String>>>,
    pub assigned: Mutex<Vec<String>>,
    pub unassigned: Mutex<Vec<String>>,
    pub titles: Mutex<Vec<String>>,
    pub reopened: Mutex<Vec<i64>>,
    /// (ticket number, winner handle) per paid marker posted.
    pub paid_markers: Mutex<Vec<(i64, String)>>,
    /// source-control user id → username
    pub usernames: HashMap<i64, String>,
}

impl FakeSource {
    pub fn ticket_labels(&self, number: i64) -> Vec<String> {
        self.labels
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SourceControl for FakeSource {
    async fn create_comment(&self, _project: &Project, _number: i64, body: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.comments.lock().unwrap().push(body.to_string());
        Ok(())
    }

    async fn add_labels(&self, _project: &Project, number: i64, labels: &[String]) -> Result<()> {
        tokio::task::yield_now().await;
        let mut all = self.labels.lock().unwrap();
        let current = all.entry(number).or_default();
        for label in labels {
            if !current.contains(label) {
                current.push(label.clone());
            }
        }
        Ok(())
    }

    async fn replace_labels(
        &self,
        _project: &Project,
        number: i64,
        labels: &[String],
    ) -> Result<()> {
        tokio::task::yield_now().await;
        self.labels.lock().unwrap().insert(number, labels.to_vec());
        Ok(())
    }

    async fn assign_user(&self, _project: &Project, _number: i64, username: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.assigned.lock().unwrap().push(username.to_string());
        Ok(())
    }

    async fn unassign_user(&self, _project: &Project, _number: i64, username: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.unassigned.lock().unwrap().push(username.to_string());
        Ok(())
    }

    async fn username_by_id(&self, _project: &Project, user_id: i64) -> Result<String> {
        tokio::task::yield_now().await;
        Ok(self
            .usernames
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| format!("user{user_id}")))
    }

    async fn user_id_by_username(&self, _project: &Project, username: &str) -> Result<i64> {
        tokio::task::yield_now().await;
        Ok(self
            .usernames
            .iter()
            .find(|(_, name)| name.as_str() == username)
            .map(|(id, _)| *id)
            .unwrap_or(0))
    }

    async fn update_title(&self, _project: &Project, _number: i64, title: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.titles.lock().unwrap().push(title.to_string());
        Ok(())
    }

    async fn reopen_issue(&self, _project: &Project, number: i64) -> Result<()> {
        tokio::task::yield_now().await;
        self.reopened.lock().unwrap().push(number);
        Ok(())
    }

    async fn mark_paid(
        &self,
        _project: &Project,
        number: i64,
        _challenge_url: &str,
        winner: &str,
    ) -> Result<()> {
        tokio::task::yield_now().await;
        self.paid_markers
            .lock()
            .unwrap()
            .push((number, winner.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// user directory

#[derive(Default)]
pub struct FakeDirectory {
    /// (provider, source user id) → contest handle
    pub mappings: HashMap<(Provider, i64), String>,
}

#[async_trait]
impl UserDirectory for FakeDirectory {
    async fn contest_handle(&self, provider: Provider, user_id: i64) -> Result<Option<String>> {
        tokio::task::yield_now().await;
        Ok(self.mappings.get(&(provider, user_id)).cloned())
    }

    async fn source_user_id(&self, provider: Provider, handle: &str) -> Result<Option<i64>> {
        tokio::task::yield_now().await;
        Ok(self
            .mappings
            .iter()
            .find(|((p, _), h)| *p == provider && h.as_str() == handle)
            .map(|((_, id), _)| *id))
    }
}

// ---------------------------------------------------------------------------
// harness

pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<FakeStore>,
    pub contest: Arc<FakeContest>,
    pub source: Arc<FakeSource>,
    pub project: Project,
}

pub fn project() -> Project {
    Project {
        id: Uuid::new_v4(),
        title: "Widget".to_string(),
        repo_url: "https://github.com/acme/widget".to_string(),
        tc_direct_id: 9001,
        copilot: "cp1".to_string(),
        owner: "own1".to_string(),
        create_copilot_payments: false,
        tags: Vec::new(),
    }
}

pub fn harness() -> Harness {
    harness_with(FakeContest::default(), project())
}

pub fn harness_with(contest: FakeContest, project: Project) -> Harness {
    let store = Arc::new(FakeStore::default());
    store.projects.lock().unwrap().push(project.clone());

    let contest = Arc::new(contest);
    let source = Arc::new(FakeSource {
        usernames: HashMap::from([(7, "octo-dev".to_string()), (8, "octo-two".to_string())]),
        ..FakeSource::default()
    });
    let directory = Arc::new(FakeDirectory {
        mappings: HashMap::from([
            ((Provider::Github, 7), "dev1".to_string()),
            ((Provider::Gitlab, 7), "dev1".to_string()),
        ]),
    });

    let engine = Engine::new(
        store.clone(),
        directory,
        contest.clone(),
        source.clone(),
        source.clone(),
        EngineConfig {
            labels: LabelSet::default(),
            challenge_web_base: WEB_BASE.to_string(),
        },
    );

    Harness {
        engine: Arc::new(engine),
        store,
        contest,
        source,
        project,
    }
}

impl Harness {
    pub fn stored_issue(&self, number: i64) -> Option<Issue> {
        self.store
            .issues
            .lock()
            .unwrap()
            .values()
            .find(|i| i.number == number)
            .cloned()
    }

    pub fn insert_payment(&self, amount: i64, challenge_id: Option<&str>, status: PaymentStatus) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.store.payments.lock().unwrap().insert(
            id,
            CopilotPayment {
                id,
                project: self.project.id,
                username: "cp1".to_string(),
                amount,
                description: format!("payment {id}"),
                challenge_id: challenge_id.map(str::to_string),
                closed: false,
                status,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    pub fn payment(&self, id: Uuid) -> CopilotPayment {
        self.store.payments.lock().unwrap()[&id].clone()
    }
}

// ---------------------------------------------------------------------------
// event builders

pub fn issue_event(
    kind: &str,
    number: i64,
    title: &str,
    labels: &[&str],
    assignees: &[i64],
) -> Event {
    let assignee = assignees
        .first()
        .map(|id| serde_json::json!({"id": id}))
        .unwrap_or(serde_json::Value::Null);
    let raw = serde_json::json!({
        "event": kind,
        "provider": "github",
        "data": {
            "issue": {
                "number": number,
                "title": title,
                "body": "fix the widget",
                "labels": labels,
                "assignees": assignees.iter().map(|id| serde_json::json!({"id": id})).collect::<Vec<_>>(),
                "owner": {"id": 11},
            },
            "repository": {
                "id": 42,
                "name": "widget",
                "full_name": "acme/widget",
            },
            "assignee": assignee,
        },
    });
    serde_json::from_value(raw).expect("valid test event")
}

pub fn comment_event(number: i64, title: &str, body: &str) -> Event {
    let raw = serde_json::json!({
        "event": "comment.created",
        "provider": "github",
        "data": {
            "issue": {
                "number": number,
                "title": title,
                "labels": [],
                "assignees": [],
            },
            "repository": {
                "id": 42,
                "name": "widget",
                "full_name": "acme/widget",
            },
            "comment": {"id": 1, "body": body, "user": {"id": 7}},
        },
    });
    serde_json::from_value(raw).expect("valid test comment event")
}

pub fn payment_event(kind: &str, payment_id: Uuid, project: Uuid, challenge_uuid: Option<&str>) -> Event {
    let raw = serde_json::json!({
        "event": kind,
        "data": {
            "payment": {
                "id": payment_id,
                "project": project,
                "amount": 0,
                "description": "",
                "challengeUUID": challenge_uuid,
            },
        },
    });
    serde_json::from_value(raw).expect("valid test payment event")
}

pub fn check_updates_event(handle: &str) -> Event {
    let raw = serde_json::json!({
        "event": "copilotPayment.checkUpdates",
        "data": {
            "copilot": {"handle": handle},
        },
    });
    serde_json::from_value(raw).expect("valid test checkUpdates event")
}
