//! Shared contracts for the contest bridge.
//!
//! This crate defines the cross-crate seams the engine is written against: the domain model, the
//! bus envelope and event payloads, the durable store, the source-control adapter, the
//! user-mapping directory, and the contest-platform API. Concrete Postgres implementations of the
//! store and the bus live here too (`pgstore`, `pgqueue`); HTTP implementations live in
//! `bridge-contest` and the processor binary.
//!
//! # API notes
//! `bridge-core` is an internal crate (`publish = false`). Its public API uses a few third-party
//! types (`uuid::Uuid`, `chrono::DateTime<Utc>`, `serde_json::Value`) as part of the bridge
//! contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub mod event;
pub mod model;
pub mod pgqueue;
pub mod pgstore;

use model::{CopilotPayment, Issue, Project, Provider};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

/// Bridge error taxonomy.
///
/// The variant decides the delivery policy: retryable kinds are rescheduled by the retry service,
/// the rest are logged and dropped (or, for `Fatal`, crash the handler loudly).
#[derive(Debug, Error)]
pub enum Error {
    /// Payload does not match the schema. Rejected, never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// A remote call failed. Retried with backoff.
    #[error("external api: {0}")]
    ExternalApi(#[source] anyhow::Error),

    /// A dependency is temporarily unavailable or a creation is still pending. Retried.
    #[error("internal dependency: {0}")]
    InternalDependency(String),

    /// An entity is missing where one was expected. Surfaced, not retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate record or creation in progress. Retried.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Programmer error or invariant violation.
    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn external(err: impl Into<anyhow::Error>) -> Self {
        Self::ExternalApi(err.into())
    }

    pub fn internal_dependency(message: impl Into<String>) -> Self {
        Self::InternalDependency(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    /// Whether the retry service may reschedule the event that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExternalApi(_) | Self::InternalDependency(_) | Self::Conflict(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self::InternalDependency(format!("store: {value}"))
    }
}

#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Opaque token used to acknowledge or requeue the message.
    pub ack_token: String,

    /// Provider message id (for tracing).
    pub message_id: String,

    pub topic: String,
    pub payload: Value,
    pub deliveries: i32,
}

/// The message bus the processor consumes from and the retry service republishes to.
///
/// Delivery is at-least-once and unordered across partitions; `available_at` in the future is the
/// reschedule backoff timer.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        available_at: DateTime<Utc>,
    ) -> Result<String>;

    async fn receive(
        &self,
        topic: &str,
        max: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<BusMessage>>;

    async fn ack(&self, ack_token: &str) -> Result<()>;

    async fn requeue(&self, ack_token: &str, delay: Duration) -> Result<()>;
}

/// Durable records. The single source of truth across processes: no in-process caching of issue
/// or payment rows is permitted between event boundaries.
#[async_trait]
pub trait Store: Send + Sync {
    async fn project_by_repo_url(&self, repo_url: &str) -> Result<Option<Project>>;

    async fn project_by_id(&self, id: Uuid) -> Result<Option<Project>>;

    /// Projects where `handle` is the copilot or the owner.
    async fn projects_for_user(&self, handle: &str) -> Result<Vec<Project>>;

    async fn issue_by_key(
        &self,
        provider: Provider,
        repository_id: i64,
        number: i64,
    ) -> Result<Option<Issue>>;

    async fn insert_issue(&self, issue: &Issue) -> Result<()>;

    async fn update_issue(&self, issue: &Issue) -> Result<()>;

    async fn delete_issue(&self, id: Uuid) -> Result<()>;

    async fn payment_by_id(&self, id: Uuid) -> Result<Option<CopilotPayment>>;

    /// Open (not closed) payment rows for a (project, copilot username) pair.
    async fn open_payments(&self, project: Uuid, username: &str) -> Result<Vec<CopilotPayment>>;

    /// Open payment rows bound to a challenge.
    async fn payments_by_challenge(&self, challenge_id: &str) -> Result<Vec<CopilotPayment>>;

    async fn update_payment(&self, payment: &CopilotPayment) -> Result<()>;
}

/// Source-control operations the engine drives (comments, labels, assignment, identity).
///
/// Implemented per provider; the processor selects the adapter from the event's `provider`.
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn create_comment(&self, project: &Project, number: i64, body: &str) -> Result<()>;

    async fn add_labels(&self, project: &Project, number: i64, labels: &[String]) -> Result<()>;

    /// Replace the full label set on the ticket.
    async fn replace_labels(&self, project: &Project, number: i64, labels: &[String])
        -> Result<()>;

    async fn assign_user(&self, project: &Project, number: i64, username: &str) -> Result<()>;

    async fn unassign_user(&self, project: &Project, number: i64, username: &str) -> Result<()>;

    async fn username_by_id(&self, project: &Project, user_id: i64) -> Result<String>;

    async fn user_id_by_username(&self, project: &Project, username: &str) -> Result<i64>;

    async fn update_title(&self, project: &Project, number: i64, title: &str) -> Result<()>;

    async fn reopen_issue(&self, project: &Project, number: i64) -> Result<()>;

    /// Post the provider's payment-confirmation marker on the ticket. Invoked once the
    /// challenge close went through, after the label swap.
    async fn mark_paid(
        &self,
        project: &Project,
        number: i64,
        challenge_url: &str,
        winner: &str,
    ) -> Result<()>;
}

/// Maps source-control identities to contest-platform handles and back.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Contest handle for a source-control user id, if the user signed up.
    async fn contest_handle(&self, provider: Provider, user_id: i64) -> Result<Option<String>>;

    /// Source-control user id previously mapped to a contest handle.
    async fn source_user_id(&self, provider: Provider, handle: &str) -> Result<Option<i64>>;
}

#[derive(Debug, Clone)]
pub struct NewChallenge {
    pub name: String,
    /// The external (direct) project id the challenge bills against.
    pub project_id: i64,
    pub description: String,
    pub prizes: Vec<u64>,
    /// Copilot payments use the `copilot` prize-set type instead of `placement`.
    pub copilot_payment: bool,
    pub submission_guidelines: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChallengePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub prizes: Option<Vec<u64>>,
    /// Render `prizes` as a copilot prize set instead of placement.
    pub copilot_payment: bool,
    pub billing_account_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Draft,
    Active,
    Completed,
    Canceled,
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: String,
    pub name: String,
    pub status: ChallengeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRole {
    Submitter,
    Copilot,
}

impl ResourceRole {
    pub fn id(self) -> i64 {
        match self {
            Self::Submitter => 1,
            Self::Copilot => 14,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Winner {
    pub user_id: i64,
    pub handle: String,
    pub placement: i64,
}

/// The contest-platform API as the engine consumes it.
///
/// The engine only ever speaks `prizes: &[u64]`; the client translates into the platform's
/// prize-set wire shape.
#[async_trait]
pub trait ContestApi: Send + Sync {
    /// Create a challenge and return its id.
    async fn create_challenge(&self, req: &NewChallenge) -> Result<String>;

    async fn update_challenge(&self, challenge_id: &str, patch: &ChallengePatch) -> Result<()>;

    async fn activate_challenge(&self, challenge_id: &str) -> Result<()>;

    async fn close_challenge(&self, challenge_id: &str, winner: &Winner) -> Result<()>;

    async fn cancel_challenge(&self, challenge_id: &str) -> Result<()>;

    async fn get_challenge(&self, challenge_id: &str) -> Result<Challenge>;

    /// Adding a role the member already holds is a success.
    async fn add_resource(&self, challenge_id: &str, handle: &str, role: ResourceRole)
        -> Result<()>;

    async fn remove_resource(
        &self,
        challenge_id: &str,
        handle: &str,
        role: ResourceRole,
    ) -> Result<()>;

    async fn member_id(&self, handle: &str) -> Result<i64>;

    async fn billing_account(&self, project_id: i64) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::external(anyhow::anyhow!("http 502")).is_retryable());
        assert!(Error::internal_dependency("creation pending").is_retryable());
        assert!(Error::conflict("creation in progress").is_retryable());

        assert!(!Error::validation("bad payload").is_retryable());
        assert!(!Error::not_found("no project").is_retryable());
        assert!(!Error::fatal(anyhow::anyhow!("invariant")).is_retryable());
    }

    #[test]
    fn resource_role_ids() {
        assert_eq!(ResourceRole::Submitter.id(), 1);
        assert_eq!(ResourceRole::Copilot.id(), 14);
    }
}
