//! Retry service: reschedule-via-republish with bounded attempts.
//!
//! A failed handler never retries in-process. The original event is republished to the topic it
//! came from with the retry counter bumped and a backoff baked into `available_at`; the message
//! itself carries all retry state, so any process can pick it up. Once the ceiling is hit the
//! failure turns into a user-visible notification and the event is dropped.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use bridge_core::event::{
    BusEnvelope, Event, Notification, NotificationBody, NotificationDetails, NotificationsPayload,
    Recipient,
};
use bridge_core::{Error, EventBus, Result};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// `originator` stamped on republished envelopes.
    pub originator: String,
    pub notification_topic: String,
    /// Base reschedule interval; doubles per attempt.
    pub retry_interval: Duration,
    /// Attempts after which the event is abandoned with a notification.
    pub max_retries: u32,
    pub notification_from: String,
    pub sendgrid_template_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Non-retryable failure; the event was logged and dropped.
    Dropped,
    Rescheduled { attempt: u32 },
    /// Ceiling hit; a notification went out and the event was dropped.
    GaveUp,
}

pub struct RetryService {
    bus: Arc<dyn EventBus>,
    cfg: RetryConfig,
}

/// Exponential backoff capped at one hour, realized as the republished message's availability.
pub fn backoff_delay(base: Duration, retry_count: u32) -> chrono::Duration {
    const MAX_SECS: u64 = 3600;
    let factor = 1u64 << retry_count.min(20);
    let secs = base.as_secs().saturating_mul(factor).min(MAX_SECS);
    chrono::Duration::seconds(secs as i64)
}

fn recipients_for(event: &Event) -> Vec<Recipient> {
    match event {
        Event::IssueCreated(e)
        | Event::IssueUpdated(e)
        | Event::IssueClosed(e)
        | Event::IssueRecreated(e)
        | Event::IssueAssigned(e)
        | Event::IssueUnassigned(e)
        | Event::IssueLabelUpdated(e)
        | Event::CommentCreated(e)
        | Event::CommentUpdated(e) => e
            .data
            .issue
            .owner
            .as_ref()
            .map(|owner| vec![Recipient { user_id: owner.id }])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

impl RetryService {
    pub fn new(bus: Arc<dyn EventBus>, cfg: RetryConfig) -> Self {
        Self { bus, cfg }
    }

    /// Decide what happens to a failed event: drop, republish with backoff, or give up with a
    /// notification. `Fatal` errors never reach this point; the consumer crashes on them.
    pub async fn handle_failure(
        &self,
        topic: &str,
        mut event: Event,
        err: &Error,
    ) -> Result<RetryOutcome> {
        if !err.is_retryable() {
            tracing::warn!(
                event = "bridge.retry.dropped",
                kind = %event.kind(),
                error = %err,
                "non-retryable failure; dropping event"
            );
            return Ok(RetryOutcome::Dropped);
        }

        let attempt = event.retry_count();
        if attempt >= self.cfg.max_retries {
            self.notify_terminal(&event, err).await?;
            tracing::warn!(
                event = "bridge.retry.gave_up",
                kind = %event.kind(),
                attempts = attempt,
                error = %err,
                "retry ceiling hit; notified and dropped"
            );
            return Ok(RetryOutcome::GaveUp);
        }

        event.prepare_retry();
        let envelope = BusEnvelope::wrap(topic, &self.cfg.originator, &event)?;
        let payload = serde_json::to_value(&envelope)
            .map_err(|err| Error::fatal(anyhow::anyhow!("encode retry envelope: {err}")))?;

        let delay = backoff_delay(self.cfg.retry_interval, attempt);
        self.bus.publish(topic, payload, Utc::now() + delay).await?;

        tracing::info!(
            event = "bridge.retry.rescheduled",
            kind = %event.kind(),
            attempt = attempt + 1,
            delay_secs = delay.num_seconds(),
            "event rescheduled"
        );
        Ok(RetryOutcome::Rescheduled {
            attempt: attempt + 1,
        })
    }

    async fn notify_terminal(&self, event: &Event, err: &Error) -> Result<()> {
        let kind = event.kind();
        let notifications = NotificationsPayload {
            notifications: vec![Notification {
                service_id: "email".to_string(),
                kind: "bridge.processing.failed".to_string(),
                details: NotificationDetails {
                    from: self.cfg.notification_from.clone(),
                    recipients: recipients_for(event),
                    cc: Vec::new(),
                    data: NotificationBody {
                        subject: format!("A {kind} event could not be processed"),
                        body: format!(
                            "Processing of a {kind} event failed after {} attempts and was \
                             abandoned. Last error: {err}",
                            event.retry_count()
                        ),
                    },
                    sendgrid_template_id: self.cfg.sendgrid_template_id.clone(),
                    version: "v3".to_string(),
                },
            }],
        };

        let envelope = BusEnvelope::wrap(
            &self.cfg.notification_topic,
            &self.cfg.originator,
            &notifications,
        )?;
        let payload = serde_json::to_value(&envelope)
            .map_err(|err| Error::fatal(anyhow::anyhow!("encode notification: {err}")))?;

        self.bus
            .publish(&self.cfg.notification_topic, payload, Utc::now())
            .await?;
        Ok(())
    }
}
