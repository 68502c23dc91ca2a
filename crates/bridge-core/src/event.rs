//! Bus envelope and event payloads.
//!
//! Messages arrive double-encoded: the outer envelope's `payload.value` is itself a JSON string
//! carrying the event. The `event` field is the discriminator; unknown kinds parse into
//! [`Event::Unknown`] and are dropped by the dispatcher, not failed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{fnv1a_64, Provider};
use crate::{Error, Result};

pub const MIME_JSON: &str = "application/json";

/// Outer bus envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub topic: String,
    pub originator: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "mime-type")]
    pub mime_type: String,
    pub payload: EnvelopePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopePayload {
    /// Stringified inner event.
    pub value: String,
}

impl BusEnvelope {
    /// Wrap any inner payload (an [`Event`], a notification batch) with the double encoding.
    pub fn wrap<T: serde::Serialize>(topic: &str, originator: &str, inner: &T) -> Result<Self> {
        let value = serde_json::to_string(inner)
            .map_err(|err| Error::fatal(anyhow::anyhow!("encode event: {err}")))?;
        Ok(Self {
            topic: topic.to_string(),
            originator: originator.to_string(),
            timestamp: Utc::now(),
            mime_type: MIME_JSON.to_string(),
            payload: EnvelopePayload { value },
        })
    }

    /// Decode the inner event out of `payload.value`.
    pub fn decode_event(&self) -> Result<Event> {
        serde_json::from_str(&self.payload.value)
            .map_err(|err| Error::validation(format!("decode inner event: {err}")))
    }
}

/// Parsed domain event, keyed by the `event` discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Event {
    #[serde(rename = "issue.created")]
    IssueCreated(IssueEvent),
    #[serde(rename = "issue.updated")]
    IssueUpdated(IssueEvent),
    #[serde(rename = "issue.closed")]
    IssueClosed(IssueEvent),
    #[serde(rename = "issue.recreated")]
    IssueRecreated(IssueEvent),
    #[serde(rename = "issue.assigned")]
    IssueAssigned(IssueEvent),
    #[serde(rename = "issue.unassigned")]
    IssueUnassigned(IssueEvent),
    #[serde(rename = "issue.labelUpdated")]
    IssueLabelUpdated(IssueEvent),
    #[serde(rename = "comment.created")]
    CommentCreated(IssueEvent),
    #[serde(rename = "comment.updated")]
    CommentUpdated(IssueEvent),
    #[serde(rename = "copilotPayment.add")]
    CopilotPaymentAdd(PaymentEvent),
    #[serde(rename = "copilotPayment.update")]
    CopilotPaymentUpdate(PaymentEvent),
    #[serde(rename = "copilotPayment.delete")]
    CopilotPaymentDelete(PaymentEvent),
    #[serde(rename = "copilotPayment.checkUpdates")]
    CopilotPaymentCheckUpdates(PaymentEvent),
    #[serde(other)]
    Unknown,
}

impl Event {
    /// The wire name of the discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IssueCreated(_) => "issue.created",
            Self::IssueUpdated(_) => "issue.updated",
            Self::IssueClosed(_) => "issue.closed",
            Self::IssueRecreated(_) => "issue.recreated",
            Self::IssueAssigned(_) => "issue.assigned",
            Self::IssueUnassigned(_) => "issue.unassigned",
            Self::IssueLabelUpdated(_) => "issue.labelUpdated",
            Self::CommentCreated(_) => "comment.created",
            Self::CommentUpdated(_) => "comment.updated",
            Self::CopilotPaymentAdd(_) => "copilotPayment.add",
            Self::CopilotPaymentUpdate(_) => "copilotPayment.update",
            Self::CopilotPaymentDelete(_) => "copilotPayment.delete",
            Self::CopilotPaymentCheckUpdates(_) => "copilotPayment.checkUpdates",
            Self::Unknown => "unknown",
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            Self::IssueCreated(e)
            | Self::IssueUpdated(e)
            | Self::IssueClosed(e)
            | Self::IssueRecreated(e)
            | Self::IssueAssigned(e)
            | Self::IssueUnassigned(e)
            | Self::IssueLabelUpdated(e)
            | Self::CommentCreated(e)
            | Self::CommentUpdated(e) => e.retry_count,
            Self::CopilotPaymentAdd(e)
            | Self::CopilotPaymentUpdate(e)
            | Self::CopilotPaymentDelete(e)
            | Self::CopilotPaymentCheckUpdates(e) => e.retry_count,
            Self::Unknown => 0,
        }
    }

    /// Bump the retry counter and drop any inlined project before republication.
    pub fn prepare_retry(&mut self) {
        match self {
            Self::IssueCreated(e)
            | Self::IssueUpdated(e)
            | Self::IssueClosed(e)
            | Self::IssueRecreated(e)
            | Self::IssueAssigned(e)
            | Self::IssueUnassigned(e)
            | Self::IssueLabelUpdated(e)
            | Self::CommentCreated(e)
            | Self::CommentUpdated(e) => {
                e.retry_count += 1;
                e.project = None;
            }
            Self::CopilotPaymentAdd(e)
            | Self::CopilotPaymentUpdate(e)
            | Self::CopilotPaymentDelete(e)
            | Self::CopilotPaymentCheckUpdates(e) => {
                e.retry_count += 1;
                e.project = None;
            }
            Self::Unknown => {}
        }
    }
}

/// Issue and comment event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueEvent {
    pub provider: Provider,
    pub data: IssueEventData,

    #[serde(default, rename = "retryCount")]
    pub retry_count: u32,

    /// Sticky across retries: the challenge close already went through, only the label and
    /// notification steps remain.
    #[serde(default, rename = "paymentSuccessful")]
    pub payment_successful: bool,

    #[serde(default, rename = "createCopilotPayments")]
    pub create_copilot_payments: bool,

    /// Project snapshot inlined by older producers. Stripped before any republication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueEventData {
    pub issue: IssuePayload,
    pub repository: RepositoryPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<CommentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<UserRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuePayload {
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignees: Vec<UserRef>,
    #[serde(default)]
    pub owner: Option<UserRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryPayload {
    pub id: RepoId,
    pub name: String,
    pub full_name: String,
    #[serde(default, rename = "repoUrl", skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
}

impl RepositoryPayload {
    /// The canonical repository URL: the inlined one when present, otherwise derived from the
    /// provider host and `full_name`.
    pub fn url(&self, provider: Provider) -> String {
        match &self.repo_url {
            Some(url) => url.clone(),
            None => match provider {
                Provider::Github => format!("https://github.com/{}", self.full_name),
                Provider::Gitlab => format!("https://gitlab.com/{}", self.full_name),
            },
        }
    }
}

/// Repository id as delivered: GitLab sends integers, some producers send strings. Strings are
/// hashed to a stable 64-bit value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RepoId {
    Int(i64),
    Str(String),
}

impl RepoId {
    pub fn normalize(&self) -> i64 {
        match self {
            Self::Int(v) => *v,
            Self::Str(s) => fnv1a_64(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRef {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentPayload {
    pub id: i64,
    pub body: String,
    pub user: UserRef,
}

/// Copilot-payment event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub data: PaymentEventData,

    #[serde(default, rename = "retryCount")]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copilot: Option<CopilotRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPayload {
    pub id: uuid::Uuid,
    pub project: uuid::Uuid,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "challengeUUID", skip_serializing_if = "Option::is_none")]
    pub challenge_uuid: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub closed: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotRef {
    pub handle: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Outbound notification payload for the notification topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsPayload {
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "serviceId")]
    pub service_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub details: NotificationDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationDetails {
    pub from: String,
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub cc: Vec<Recipient>,
    pub data: NotificationBody,
    #[serde(rename = "sendgridTemplateId")]
    pub sendgrid_template_id: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(rename = "userId")]
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationBody {
    pub subject: String,
    pub body: String,
}
