//! Postgres store: projects, issues, copilot payments, user mappings.
//!
//! Projects and user mappings are maintained by upstream tooling and read-only here. Issues and
//! copilot payments are mutated one row per handler with last-writer-wins; the creation guard and
//! the pending statuses serialize the ambiguous transitions.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::model::{CopilotPayment, Issue, IssueStatus, PaymentStatus, Project, Provider};
use crate::{Result, Store, UserDirectory};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn project_from_row(row: &PgRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        repo_url: row.try_get("repo_url")?,
        tc_direct_id: row.try_get("tc_direct_id")?,
        copilot: row.try_get("copilot")?,
        owner: row.try_get("owner_handle")?,
        create_copilot_payments: row.try_get("create_copilot_payments")?,
        tags: row.try_get("tags")?,
    })
}

fn issue_from_row(row: &PgRow) -> Result<Issue> {
    let provider: String = row.try_get("provider")?;
    let status: String = row.try_get("status")?;
    Ok(Issue {
        id: row.try_get("id")?,
        provider: Provider::try_from(provider.as_str())?,
        repository_id: row.try_get("repository_id")?,
        number: row.try_get("number")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        prizes: row.try_get("prizes")?,
        labels: row.try_get("labels")?,
        assignee: row.try_get("assignee")?,
        assigned_at: row.try_get("assigned_at")?,
        challenge_id: row.try_get("challenge_id")?,
        status: IssueStatus::try_from(status.as_str())?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<CopilotPayment> {
    let status: String = row.try_get("status")?;
    Ok(CopilotPayment {
        id: row.try_get("id")?,
        project: row.try_get("project")?,
        username: row.try_get("username")?,
        amount: row.try_get("amount")?,
        description: row.try_get("description")?,
        challenge_id: row.try_get("challenge_id")?,
        closed: row.try_get("closed")?,
        status: PaymentStatus::try_from(status.as_str())?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn project_by_repo_url(&self, repo_url: &str) -> Result<Option<Project>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, repo_url, tc_direct_id, copilot, owner_handle,
                   create_copilot_payments, tags
            FROM projects
            WHERE repo_url = $1
            "#,
        )
        .bind(repo_url)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(project_from_row).transpose()
    }

    async fn project_by_id(&self, id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, repo_url, tc_direct_id, copilot, owner_handle,
                   create_copilot_payments, tags
            FROM projects
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(project_from_row).transpose()
    }

    async fn projects_for_user(&self, handle: &str) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, repo_url, tc_direct_id, copilot, owner_handle,
                   create_copilot_payments, tags
            FROM projects
            WHERE copilot = $1 OR owner_handle = $1
            "#,
        )
        .bind(handle)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(project_from_row).collect()
    }

    async fn issue_by_key(
        &self,
        provider: Provider,
        repository_id: i64,
        number: i64,
    ) -> Result<Option<Issue>> {
        let row = sqlx::query(
            r#"
            SELECT id, provider, repository_id, number, title, body, prizes, labels,
                   assignee, assigned_at, challenge_id, status, created_at, updated_at
            FROM issues
            WHERE provider = $1 AND repository_id = $2 AND number = $3
            "#,
        )
        .bind(provider.as_str())
        .bind(repository_id)
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(issue_from_row).transpose()
    }

    async fn insert_issue(&self, issue: &Issue) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO issues (id, provider, repository_id, number, title, body, prizes,
                                labels, assignee, assigned_at, challenge_id, status,
                                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(issue.id)
        .bind(issue.provider.as_str())
        .bind(issue.repository_id)
        .bind(issue.number)
        .bind(&issue.title)
        .bind(&issue.body)
        .bind(&issue.prizes)
        .bind(&issue.labels)
        .bind(&issue.assignee)
        .bind(issue.assigned_at)
        .bind(&issue.challenge_id)
        .bind(issue.status.as_str())
        .bind(issue.created_at)
        .bind(issue.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_issue(&self, issue: &Issue) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE issues
            SET title = $2,
                body = $3,
                prizes = $4,
                labels = $5,
                assignee = $6,
                assigned_at = $7,
                challenge_id = $8,
                status = $9,
                updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(issue.id)
        .bind(&issue.title)
        .bind(&issue.body)
        .bind(&issue.prizes)
        .bind(&issue.labels)
        .bind(&issue.assignee)
        .bind(issue.assigned_at)
        .bind(&issue.challenge_id)
        .bind(issue.status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_issue(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM issues
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn payment_by_id(&self, id: Uuid) -> Result<Option<CopilotPayment>> {
        let row = sqlx::query(
            r#"
            SELECT id, project, username, amount, description, challenge_id, closed,
                   status, created_at, updated_at
            FROM copilot_payments
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(payment_from_row).transpose()
    }

    async fn open_payments(&self, project: Uuid, username: &str) -> Result<Vec<CopilotPayment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, project, username, amount, description, challenge_id, closed,
                   status, created_at, updated_at
            FROM copilot_payments
            WHERE project = $1 AND username = $2 AND closed = FALSE
            ORDER BY created_at
            "#,
        )
        .bind(project)
        .bind(username)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(payment_from_row).collect()
    }

    async fn payments_by_challenge(&self, challenge_id: &str) -> Result<Vec<CopilotPayment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, project, username, amount, description, challenge_id, closed,
                   status, created_at, updated_at
            FROM copilot_payments
            WHERE challenge_id = $1 AND closed = FALSE
            ORDER BY created_at
            "#,
        )
        .bind(challenge_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(payment_from_row).collect()
    }

    async fn update_payment(&self, payment: &CopilotPayment) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE copilot_payments
            SET amount = $2,
                description = $3,
                challenge_id = $4,
                closed = $5,
                status = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(payment.id)
        .bind(payment.amount)
        .bind(&payment.description)
        .bind(&payment.challenge_id)
        .bind(payment.closed)
        .bind(payment.status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// User mappings maintained by the signup flow; read-only here.
#[derive(Debug, Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn contest_handle(&self, provider: Provider, user_id: i64) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT contest_handle
            FROM user_mappings
            WHERE provider = $1 AND source_user_id = $2
            "#,
        )
        .bind(provider.as_str())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_get("contest_handle"))
            .transpose()
            .map_err(Into::into)
    }

    async fn source_user_id(&self, provider: Provider, handle: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            SELECT source_user_id
            FROM user_mappings
            WHERE provider = $1 AND contest_handle = $2
            "#,
        )
        .bind(provider.as_str())
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_get("source_user_id"))
            .transpose()
            .map_err(Into::into)
    }
}
