//! Domain model: projects, issues, copilot payments, labels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Github,
    Gitlab,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Provider {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Error> {
        match value {
            "github" => Ok(Self::Github),
            "gitlab" => Ok(Self::Gitlab),
            other => Err(Error::validation(format!("unknown provider: {other}"))),
        }
    }
}

/// Issue lifecycle status. Persisted as the snake_case string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    ChallengeCreationPending,
    ChallengeCreationSuccessful,
    ChallengeCreationFailed,
    ChallengePaymentPending,
    ChallengePaymentSuccessful,
    ChallengePaymentFailed,
}

impl IssueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChallengeCreationPending => "challenge_creation_pending",
            Self::ChallengeCreationSuccessful => "challenge_creation_successful",
            Self::ChallengeCreationFailed => "challenge_creation_failed",
            Self::ChallengePaymentPending => "challenge_payment_pending",
            Self::ChallengePaymentSuccessful => "challenge_payment_successful",
            Self::ChallengePaymentFailed => "challenge_payment_failed",
        }
    }
}

impl TryFrom<&str> for IssueStatus {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Error> {
        match value {
            "challenge_creation_pending" => Ok(Self::ChallengeCreationPending),
            "challenge_creation_successful" => Ok(Self::ChallengeCreationSuccessful),
            "challenge_creation_failed" => Ok(Self::ChallengeCreationFailed),
            "challenge_payment_pending" => Ok(Self::ChallengePaymentPending),
            "challenge_payment_successful" => Ok(Self::ChallengePaymentSuccessful),
            "challenge_payment_failed" => Ok(Self::ChallengePaymentFailed),
            other => Err(Error::validation(format!("unknown issue status: {other}"))),
        }
    }
}

/// Copilot-payment lifecycle status. Rows arrive from the admin tool as `New`;
/// `ChallengeCreationRetried` marks a row whose creation failed and was handed to the retry
/// service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    New,
    ChallengeCreationPending,
    ChallengeCreationSuccessful,
    ChallengeCreationRetried,
    ChallengeCreationFailed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::ChallengeCreationPending => "challenge_creation_pending",
            Self::ChallengeCreationSuccessful => "challenge_creation_successful",
            Self::ChallengeCreationRetried => "challenge_creation_retried",
            Self::ChallengeCreationFailed => "challenge_creation_failed",
        }
    }
}

impl TryFrom<&str> for PaymentStatus {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Error> {
        match value {
            "new" => Ok(Self::New),
            "challenge_creation_pending" => Ok(Self::ChallengeCreationPending),
            "challenge_creation_successful" => Ok(Self::ChallengeCreationSuccessful),
            "challenge_creation_retried" => Ok(Self::ChallengeCreationRetried),
            "challenge_creation_failed" => Ok(Self::ChallengeCreationFailed),
            other => Err(Error::validation(format!("unknown payment status: {other}"))),
        }
    }
}

/// Externally owned project registration. Read-only to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub title: String,
    pub repo_url: String,
    /// External (direct) project id challenges bill against.
    pub tc_direct_id: i64,
    pub copilot: String,
    pub owner: String,
    pub create_copilot_payments: bool,
    pub tags: Vec<String>,
}

/// Durable ticket↔challenge binding.
///
/// (provider, repository_id, number) is unique; at most one active record exists per ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub provider: Provider,
    pub repository_id: i64,
    pub number: i64,
    pub title: String,
    /// Rendered (HTML) body.
    pub body: String,
    pub prizes: Vec<i64>,
    pub labels: Vec<String>,
    pub assignee: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub challenge_id: Option<String>,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn key(&self) -> String {
        issue_key(self.provider, self.repository_id, self.number)
    }
}

/// Guard and log key for a ticket.
pub fn issue_key(provider: Provider, repository_id: i64, number: i64) -> String {
    format!("{provider}-{repository_id}-{number}")
}

/// Copilot-payment row. Several open rows for one (project, username) coalesce into a single
/// challenge once one of them carries a challenge id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotPayment {
    pub id: Uuid,
    pub project: Uuid,
    pub username: String,
    pub amount: i64,
    pub description: String,
    pub challenge_id: Option<String>,
    pub closed: bool,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The ticket labels the bridge reads and writes. All of them share the readiness prefix, which
/// is also what gates challenge creation (`tcx_ready`).
#[derive(Debug, Clone)]
pub struct LabelSet {
    pub prefix: String,
    pub open_for_pickup: String,
    pub assigned: String,
    pub not_ready: String,
    pub fix_accepted: String,
    pub canceled: String,
    pub paid: String,
}

impl Default for LabelSet {
    fn default() -> Self {
        Self {
            prefix: "tcx_".to_string(),
            open_for_pickup: "tcx_OpenForPickup".to_string(),
            assigned: "tcx_Assigned".to_string(),
            not_ready: "tcx_NotReady".to_string(),
            fix_accepted: "tcx_FixAccepted".to_string(),
            canceled: "tcx_Canceled".to_string(),
            paid: "tcx_Paid".to_string(),
        }
    }
}

impl LabelSet {
    /// Whether any label carries the readiness prefix (case-sensitive).
    pub fn ready(&self, labels: &[String]) -> bool {
        labels.iter().any(|l| l.starts_with(&self.prefix))
    }

    /// Drop every prefixed label, keeping foreign ones.
    pub fn strip_prefixed(&self, labels: &[String]) -> Vec<String> {
        labels
            .iter()
            .filter(|l| !l.starts_with(&self.prefix))
            .cloned()
            .collect()
    }

    /// Replace every prefixed label with `with`, keeping foreign labels in place.
    pub fn swap_prefixed(&self, labels: &[String], with: &[&str]) -> Vec<String> {
        let mut out = self.strip_prefixed(labels);
        out.extend(with.iter().map(|s| s.to_string()));
        out
    }
}

/// Stable 64-bit FNV-1a, used to normalize string repository ids.
pub fn fnv1a_64(input: &str) -> i64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash as i64
}
