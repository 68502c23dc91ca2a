//! Postgres-backed message bus.
//!
//! Topics live in one `bus_messages` table. Delivery uses `FOR UPDATE SKIP LOCKED` with a
//! visibility timeout, so concurrent consumers never double-claim a visible message, and a
//! future `available_at` delays delivery — that is the whole backoff mechanism for rescheduled
//! events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::{BusMessage, Error, EventBus, Result};

#[derive(Debug, Clone)]
pub struct PgBus {
    pool: PgPool,
}

impl PgBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventBus for PgBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        available_at: DateTime<Utc>,
    ) -> Result<String> {
        let message_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO bus_messages (message_id, topic, payload, available_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(message_id)
        .bind(topic)
        .bind(payload)
        .bind(available_at)
        .execute(&self.pool)
        .await?;

        Ok(message_id.to_string())
    }

    async fn receive(
        &self,
        topic: &str,
        max: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<BusMessage>> {
        let visibility_millis = duration_millis(visibility_timeout);
        let rows = sqlx::query(
            r#"
            WITH picked AS (
              SELECT message_id
              FROM bus_messages
              WHERE topic = $1
                AND available_at <= now()
                AND (invisible_until IS NULL OR invisible_until <= now())
              ORDER BY available_at, created_at
              LIMIT $2
              FOR UPDATE SKIP LOCKED
            )
            UPDATE bus_messages AS m
            SET invisible_until = now() + ($3::text || ' milliseconds')::interval,
                deliveries = deliveries + 1
            FROM picked
            WHERE m.message_id = picked.message_id
            RETURNING m.message_id, m.topic, m.payload, m.deliveries
            "#,
        )
        .bind(topic)
        .bind(max)
        .bind(visibility_millis)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let message_id: Uuid = row.try_get("message_id")?;
            let message_id = message_id.to_string();
            messages.push(BusMessage {
                ack_token: message_id.clone(),
                message_id,
                topic: row.try_get("topic")?,
                payload: row.try_get("payload")?,
                deliveries: row.try_get("deliveries")?,
            });
        }

        Ok(messages)
    }

    async fn ack(&self, ack_token: &str) -> Result<()> {
        let message_id = parse_ack_token(ack_token)?;
        sqlx::query(
            r#"
            DELETE FROM bus_messages
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn requeue(&self, ack_token: &str, delay: Duration) -> Result<()> {
        let message_id = parse_ack_token(ack_token)?;
        let delay_millis = duration_millis(delay);
        sqlx::query(
            r#"
            UPDATE bus_messages
            SET available_at = now() + ($2::text || ' milliseconds')::interval,
                invisible_until = NULL
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .bind(delay_millis)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn parse_ack_token(ack_token: &str) -> Result<Uuid> {
    Uuid::parse_str(ack_token)
        .map_err(|err| Error::validation(format!("ack token is not a uuid: {err}")))
}

fn duration_millis(d: Duration) -> i64 {
    let ms = d.as_millis();
    if ms > i64::MAX as u128 {
        i64::MAX
    } else {
        ms as i64
    }
}
