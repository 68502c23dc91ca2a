//! Bus consumer loop.
//!
//! Receives from the issue and payment topics, double-decodes the envelope, hands the event to
//! the engine, and acknowledges. Handler failures go through the retry service; the original
//! message is acknowledged either way, because a reschedule is a fresh message. Fatal errors
//! crash the process.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};

use bridge_contest::token::{AuthConfig, TokenCache};
use bridge_contest::{ContestClient, ContestConfig};
use bridge_core::event::BusEnvelope;
use bridge_core::pgqueue::PgBus;
use bridge_core::pgstore::{PgStore, PgUserDirectory};
use bridge_core::{BusMessage, ContestApi, Error, EventBus, SourceControl, Store, UserDirectory};
use bridge_engine::retry::{RetryConfig, RetryService};
use bridge_engine::{Engine, EngineConfig};

use crate::config::Config;
use crate::github::GithubClient;
use crate::gitlab::GitlabClient;

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .context("connect database")?;

    let bus: Arc<dyn EventBus> = Arc::new(PgBus::new(pool.clone()));
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let directory: Arc<dyn UserDirectory> = Arc::new(PgUserDirectory::new(pool));

    let http = reqwest::Client::new();
    let token = TokenCache::new(
        AuthConfig {
            token_url: cfg.contest_token_url.clone(),
            client_id: cfg.contest_client_id.clone(),
            client_secret: cfg.contest_client_secret.clone(),
            audience: cfg.contest_audience.clone(),
        },
        http.clone(),
    );
    let contest: Arc<dyn ContestApi> = Arc::new(ContestClient::new(
        ContestConfig::new(cfg.contest_api_base.clone()),
        http,
        token,
    ));

    let github: Arc<dyn SourceControl> = Arc::new(GithubClient::new(
        cfg.github_api_base.clone(),
        cfg.github_token.clone(),
    ));
    let gitlab: Arc<dyn SourceControl> = Arc::new(GitlabClient::new(
        cfg.gitlab_api_base.clone(),
        cfg.gitlab_token.clone(),
    ));

    let engine = Engine::new(
        store,
        directory,
        contest,
        github,
        gitlab,
        EngineConfig {
            labels: cfg.label_set(),
            challenge_web_base: cfg.contest_web_base.clone(),
        },
    );
    let retry = RetryService::new(
        bus.clone(),
        RetryConfig {
            originator: cfg.originator.clone(),
            notification_topic: cfg.notification_topic.clone(),
            retry_interval: Duration::from_secs(cfg.retry_interval_secs),
            max_retries: cfg.retry_max_count,
            notification_from: cfg.notification_from.clone(),
            sendgrid_template_id: cfg.sendgrid_template_id.clone(),
        },
    );

    let topics = [cfg.issue_topic.clone(), cfg.payment_topic.clone()];
    let poll_interval = Duration::from_millis(cfg.consumer_poll_ms);
    let visibility_timeout = Duration::from_secs(cfg.consumer_visibility_timeout_secs);
    let requeue_delay = Duration::from_millis(cfg.consumer_requeue_delay_ms);

    tracing::info!(
        event = "bridge.consumer.started",
        issue_topic = %cfg.issue_topic,
        payment_topic = %cfg.payment_topic,
        "consumer started"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(event = "bridge.consumer.shutdown", "consumer shutting down");
                return Ok(());
            }
            res = poll_once(&engine, &retry, bus.as_ref(), &topics, visibility_timeout, requeue_delay) => {
                if res? == 0 {
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }
}

async fn poll_once(
    engine: &Engine,
    retry: &RetryService,
    bus: &dyn EventBus,
    topics: &[String],
    visibility_timeout: Duration,
    requeue_delay: Duration,
) -> anyhow::Result<usize> {
    let mut processed = 0;
    for topic in topics {
        let messages = bus.receive(topic, 1, visibility_timeout).await?;
        for msg in messages {
            processed += 1;
            handle_message(engine, retry, bus, topic, msg, requeue_delay).await?;
        }
    }
    Ok(processed)
}

async fn handle_message(
    engine: &Engine,
    retry: &RetryService,
    bus: &dyn EventBus,
    topic: &str,
    msg: BusMessage,
    requeue_delay: Duration,
) -> anyhow::Result<()> {
    let ack_token = msg.ack_token.clone();
    let message_id = msg.message_id.clone();

    let envelope: BusEnvelope = match serde_json::from_value(msg.payload.clone()) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(
                event = "bridge.consumer.envelope.invalid",
                error = %err,
                message_id = %message_id,
                "invalid envelope; dropping"
            );
            bus.ack(&ack_token).await?;
            return Ok(());
        }
    };

    let mut event = match envelope.decode_event() {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(
                event = "bridge.consumer.event.invalid",
                error = %err,
                message_id = %message_id,
                "invalid inner event; dropping"
            );
            bus.ack(&ack_token).await?;
            return Ok(());
        }
    };

    match engine.handle(&mut event).await {
        Ok(()) => {
            bus.ack(&ack_token).await?;
            Ok(())
        }
        // Programmer error or invariant violation: crash loud rather than spin.
        Err(Error::Fatal(err)) => Err(err.context("fatal handler error")),
        Err(err) => {
            // The engine may have mutated the event (sticky payment flag); the retry service
            // republishes that mutated form.
            match retry.handle_failure(topic, event, &err).await {
                Ok(outcome) => {
                    tracing::info!(
                        event = "bridge.consumer.failure_handled",
                        message_id = %message_id,
                        outcome = ?outcome,
                        error = %err,
                        "handler failure routed through retry service"
                    );
                    bus.ack(&ack_token).await?;
                }
                Err(retry_err) => {
                    // Could not republish; make the original visible again instead.
                    tracing::warn!(
                        event = "bridge.consumer.retry_publish_failed",
                        message_id = %message_id,
                        error = %retry_err,
                        "reschedule failed; requeueing original message"
                    );
                    bus.requeue(&ack_token, requeue_delay).await?;
                }
            }
            Ok(())
        }
    }
}
