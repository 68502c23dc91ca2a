//! Issue state machine: the full lifecycle of a ticket↔challenge binding.
//!
//! Every handler here is written to be replayed: delivery is at-least-once, so each step either
//! observes durable state first (status gates) or is idempotent at the remote end (duplicate
//! resource adds succeed). The only transition that cannot be made idempotent remotely — the
//! challenge create — is serialized by the creation guard and fenced by the pending status.

use chrono::Utc;
use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

use bridge_core::event::IssueEvent;
use bridge_core::model::{Issue, IssueStatus, Provider};
use bridge_core::{ChallengePatch, ChallengeStatus, Error, NewChallenge, ResourceRole, Result, Winner};

use crate::comments;
use crate::dispatcher::IssueContext;
use crate::Engine;

static BID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/bid\s+\$([0-9]+)\s*$").expect("bid regex"));
static ACCEPT_BID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/accept_bid\s+@([^\s]+)\s+\$([0-9]+)\s*$").expect("accept_bid regex")
});

/// The single assignee the event is about: the explicit `data.assignee` when present, otherwise
/// the first entry of the issue's assignee list.
fn assignee_id(event: &IssueEvent) -> Option<i64> {
    event
        .data
        .assignee
        .as_ref()
        .map(|u| u.id)
        .or_else(|| event.data.issue.assignees.first().map(|u| u.id))
}

fn prizes_u64(prizes: &[i64]) -> Vec<u64> {
    prizes.iter().map(|p| (*p).max(0) as u64).collect()
}

fn replace_label(labels: &[String], from: &str, to: &str) -> Vec<String> {
    let mut out: Vec<String> = labels.iter().filter(|l| *l != from).cloned().collect();
    if !out.iter().any(|l| l == to) {
        out.push(to.to_string());
    }
    out
}

fn challenge_id_of(record: &Issue) -> Result<String> {
    record
        .challenge_id
        .clone()
        .ok_or_else(|| Error::fatal(anyhow::anyhow!("record {} has no challenge id", record.key())))
}

impl Engine {
    /// Look up the durable record, erasing a stale failed creation, optionally creating the
    /// challenge when absent. A pending creation forces the caller into a reschedule.
    pub(crate) async fn ensure_challenge_exists(
        &self,
        ctx: &IssueContext,
        event: &IssueEvent,
        create: bool,
    ) -> Result<Option<Issue>> {
        match self
            .store()
            .issue_by_key(ctx.provider, ctx.repository_id, ctx.number)
            .await?
        {
            Some(record) if record.status == IssueStatus::ChallengeCreationPending => {
                return Err(Error::internal_dependency(
                    "challenge creation pending, reschedule",
                ));
            }
            Some(record) if record.status == IssueStatus::ChallengeCreationFailed => {
                // Stale failure: erase and start over.
                self.store().delete_issue(record.id).await?;
            }
            Some(record) => return Ok(Some(record)),
            None => {}
        }

        if create {
            Box::pin(self.issue_create(ctx, event, false)).await?;
            return self
                .store()
                .issue_by_key(ctx.provider, ctx.repository_id, ctx.number)
                .await;
        }

        Ok(None)
    }

    /// `issue.created`: insert the record, create the challenge, announce it on the ticket.
    pub(crate) async fn issue_create(
        &self,
        ctx: &IssueContext,
        event: &IssueEvent,
        force_assign: bool,
    ) -> Result<()> {
        let key = ctx.key();

        if self
            .store()
            .issue_by_key(ctx.provider, ctx.repository_id, ctx.number)
            .await?
            .is_some()
        {
            return Err(Error::validation(format!(
                "ticket {key} already has a challenge record"
            )));
        }

        if !ctx.tcx_ready {
            tracing::debug!(
                event = "bridge.issue.create.not_ready",
                key = %key,
                "ticket has no readiness label; skipping challenge creation"
            );
            return Ok(());
        }

        let permit = self.guard().acquire(&key)?;

        let now = Utc::now();
        let record = Issue {
            id: Uuid::new_v4(),
            provider: ctx.provider,
            repository_id: ctx.repository_id,
            number: ctx.number,
            title: ctx.title.clone(),
            body: ctx.body_html.clone(),
            prizes: ctx.prizes.clone(),
            labels: ctx.labels.clone(),
            assignee: None,
            assigned_at: None,
            challenge_id: None,
            status: IssueStatus::ChallengeCreationPending,
            created_at: now,
            updated_at: now,
        };
        self.store().insert_issue(&record).await?;

        let res: Result<String> = async {
            let challenge_id = self
                .contest()
                .create_challenge(&NewChallenge {
                    name: ctx.title.clone(),
                    project_id: ctx.project.tc_direct_id,
                    description: ctx.body_html.clone(),
                    prizes: prizes_u64(&ctx.prizes),
                    copilot_payment: false,
                    submission_guidelines: Some(format!(
                        "{}/issues/{}",
                        ctx.repo_url, ctx.number
                    )),
                })
                .await?;

            let mut updated = record.clone();
            updated.challenge_id = Some(challenge_id.clone());
            updated.status = IssueStatus::ChallengeCreationSuccessful;
            self.store().update_issue(&updated).await?;

            self.source(ctx.provider)
                .create_comment(
                    &ctx.project,
                    ctx.number,
                    &comments::contest_created(&self.challenge_url(&challenge_id)),
                )
                .await?;

            Ok(challenge_id)
        }
        .await;

        match res {
            Ok(challenge_id) => {
                drop(permit);
                tracing::info!(
                    event = "bridge.issue.create.ok",
                    key = %key,
                    challenge_id = %challenge_id,
                    "challenge created"
                );

                let assign_now = ctx.provider == Provider::Gitlab || force_assign;
                if assign_now && assignee_id(event).is_some() {
                    Box::pin(self.issue_assign(ctx, event, true)).await?;
                }
                Ok(())
            }
            Err(err) => {
                // Never leak the pending record: the retry must start from a clean slate.
                if let Err(cleanup) = self.store().delete_issue(record.id).await {
                    tracing::error!(
                        event = "bridge.issue.create.cleanup_failed",
                        key = %key,
                        error = %cleanup,
                        "failed to erase pending record"
                    );
                }
                drop(permit);
                Err(err)
            }
        }
    }

    /// `issue.updated`: push title/body/prize changes to the challenge. A byte-identical update
    /// makes no remote call at all.
    pub(crate) async fn issue_update(&self, ctx: &IssueContext, event: &IssueEvent) -> Result<()> {
        let Some(mut record) = self.ensure_challenge_exists(ctx, event, true).await? else {
            if ctx.tcx_ready {
                return Err(Error::internal_dependency(
                    "challenge not created yet, reschedule",
                ));
            }
            return Ok(());
        };

        if record.title == ctx.title && record.body == ctx.body_html && record.prizes == ctx.prizes
        {
            tracing::debug!(
                event = "bridge.issue.update.unchanged",
                key = %ctx.key(),
                "no material changes; skipping remote update"
            );
            return Ok(());
        }

        let challenge_id = challenge_id_of(&record)?;
        self.contest()
            .update_challenge(
                &challenge_id,
                &ChallengePatch {
                    name: Some(ctx.title.clone()),
                    description: Some(ctx.body_html.clone()),
                    prizes: Some(prizes_u64(&ctx.prizes)),
                    ..Default::default()
                },
            )
            .await?;

        record.title = ctx.title.clone();
        record.body = ctx.body_html.clone();
        record.prizes = ctx.prizes.clone();
        record.labels = ctx.labels.clone();
        record.assignee = match assignee_id(event) {
            Some(id) => self
                .directory()
                .contest_handle(ctx.provider, id)
                .await?
                .or(record.assignee),
            None => None,
        };
        record.updated_at = Utc::now();
        self.store().update_issue(&record).await?;

        Ok(())
    }

    /// `issue.assigned`: bind the assignee to the challenge as a Submitter, gated on the
    /// pickup label unless forced.
    pub(crate) async fn issue_assign(
        &self,
        ctx: &IssueContext,
        event: &IssueEvent,
        force: bool,
    ) -> Result<()> {
        let Some(user_id) = assignee_id(event) else {
            return Ok(());
        };
        let sc = self.source(ctx.provider);
        let labels = self.labels();

        let Some(handle) = self.directory().contest_handle(ctx.provider, user_id).await? else {
            let username = sc.username_by_id(&ctx.project, user_id).await?;
            sc.create_comment(&ctx.project, ctx.number, &comments::signup_request(&username))
                .await?;
            sc.unassign_user(&ctx.project, ctx.number, &username).await?;
            return Ok(());
        };

        let Some(mut record) = self.ensure_challenge_exists(ctx, event, true).await? else {
            return Ok(());
        };

        if event.data.issue.assignees.len() >= 2 {
            sc.create_comment(&ctx.project, ctx.number, &comments::single_assignee_only())
                .await?;
            return Ok(());
        }

        if record.assignee.as_deref() == Some(handle.as_str()) {
            return Ok(());
        }
        if record.assignee.is_some() {
            // A different assignee is stored; the unassign-then-assign pair drives the rest.
            return Ok(());
        }

        let has_pickup = ctx.labels.iter().any(|l| *l == labels.open_for_pickup);
        if !has_pickup && !force {
            let username = sc.username_by_id(&ctx.project, user_id).await?;
            if record.assignee.is_none() {
                sc.add_labels(&ctx.project, ctx.number, &[labels.not_ready.clone()])
                    .await?;
                sc.create_comment(
                    &ctx.project,
                    ctx.number,
                    &comments::wait_for_pickup(&username, &labels.open_for_pickup),
                )
                .await?;
                sc.unassign_user(&ctx.project, ctx.number, &username).await?;
            } else if !ctx.labels.iter().any(|l| *l == labels.not_ready) {
                sc.create_comment(
                    &ctx.project,
                    ctx.number,
                    &comments::missing_label_unassign(&username, &labels.open_for_pickup),
                )
                .await?;
                sc.unassign_user(&ctx.project, ctx.number, &username).await?;
            } else {
                sc.create_comment(
                    &ctx.project,
                    ctx.number,
                    &comments::wait_for_pickup(&username, &labels.open_for_pickup),
                )
                .await?;
                sc.unassign_user(&ctx.project, ctx.number, &username).await?;
            }
            return Ok(());
        }

        let challenge_id = challenge_id_of(&record)?;
        self.contest()
            .add_resource(&challenge_id, &handle, ResourceRole::Submitter)
            .await?;

        let new_labels = replace_label(&ctx.labels, &labels.open_for_pickup, &labels.assigned);
        sc.replace_labels(&ctx.project, ctx.number, &new_labels).await?;

        record.assignee = Some(handle.clone());
        record.assigned_at = Some(Utc::now());
        record.labels = new_labels;
        self.store().update_issue(&record).await?;

        sc.create_comment(
            &ctx.project,
            ctx.number,
            &comments::contest_assigned(&self.challenge_url(&challenge_id), &handle),
        )
        .await?;

        tracing::info!(
            event = "bridge.issue.assign.ok",
            key = %ctx.key(),
            handle = %handle,
            "assignee bound to challenge"
        );
        Ok(())
    }

    /// `issue.unassigned`: detach the stored assignee from the challenge and restore the pickup
    /// label; a single remaining assignee is re-dispatched through `assign`.
    pub(crate) async fn issue_unassign(&self, ctx: &IssueContext, event: &IssueEvent) -> Result<()> {
        let Some(mut record) = self.ensure_challenge_exists(ctx, event, false).await? else {
            return Ok(());
        };
        let sc = self.source(ctx.provider);
        let labels = self.labels();

        if let Some(stored) = record.assignee.clone() {
            let challenge_id = challenge_id_of(&record)?;

            if let Some(source_id) = self.directory().source_user_id(ctx.provider, &stored).await? {
                if let Some(handle) = self.directory().contest_handle(ctx.provider, source_id).await?
                {
                    self.contest()
                        .remove_resource(&challenge_id, &handle, ResourceRole::Submitter)
                        .await?;
                }
            }

            let new_labels = replace_label(&ctx.labels, &labels.assigned, &labels.open_for_pickup);
            sc.replace_labels(&ctx.project, ctx.number, &new_labels).await?;
            record.labels = new_labels;

            sc.create_comment(
                &ctx.project,
                ctx.number,
                &comments::contest_unassigned(&self.challenge_url(&challenge_id), &stored),
            )
            .await?;
        }

        record.assignee = None;
        record.assigned_at = None;
        self.store().update_issue(&record).await?;

        match event.data.issue.assignees.len() {
            1 => {
                // Synthesize an assignment for the survivor; `data.assignee` on the inbound
                // event still names the user who was just removed.
                let mut synthesized = event.clone();
                synthesized.data.assignee = event.data.issue.assignees.first().cloned();
                Box::pin(self.issue_assign(ctx, &synthesized, false)).await
            }
            n if n >= 2 => {
                sc.create_comment(&ctx.project, ctx.number, &comments::single_assignee_only())
                    .await
            }
            _ => Ok(()),
        }
    }

    /// `issue.closed`: the payment pipeline. Ineligible tickets are acknowledged silently (with
    /// a comment where called for) and never error.
    pub(crate) async fn issue_close(&self, ctx: &IssueContext, event: &mut IssueEvent) -> Result<()> {
        let sc = self.source(ctx.provider);
        let labels = self.labels();

        let Some(mut record) = self.ensure_challenge_exists(ctx, event, false).await? else {
            if ctx.tcx_ready {
                return Err(Error::internal_dependency(
                    "closed ticket has no challenge record yet, reschedule",
                ));
            }
            return Ok(());
        };

        // The close already went through on an earlier attempt; only the label and
        // notification steps remain.
        if event.payment_successful {
            return self.finish_payment(ctx, event, &mut record).await;
        }

        if matches!(
            record.status,
            IssueStatus::ChallengePaymentSuccessful | IssueStatus::ChallengePaymentPending
        ) {
            return Ok(());
        }

        let fix_accepted = ctx.labels.iter().any(|l| *l == labels.fix_accepted);
        let canceled = ctx.labels.iter().any(|l| *l == labels.canceled);
        if !fix_accepted || canceled {
            sc.create_comment(&ctx.project, ctx.number, &comments::payment_skipped())
                .await?;
            return Ok(());
        }

        if ctx.prizes.first() == Some(&0) {
            sc.create_comment(&ctx.project, ctx.number, &comments::payment_skipped())
                .await?;
            return Ok(());
        }

        let Some(user_id) = assignee_id(event) else {
            return Ok(());
        };

        if ctx.labels.iter().any(|l| *l == labels.paid) {
            return Ok(());
        }

        let challenge_id = challenge_id_of(&record)?;
        let challenge = self.contest().get_challenge(&challenge_id).await?;
        if challenge.status == ChallengeStatus::Completed {
            return Ok(());
        }

        // Double-processing guard under at-least-once delivery.
        record.status = IssueStatus::ChallengePaymentPending;
        self.store().update_issue(&record).await?;

        let res: Result<String> = async {
            let Some(winner) = self.directory().contest_handle(ctx.provider, user_id).await?
            else {
                let username = sc.username_by_id(&ctx.project, user_id).await?;
                sc.unassign_user(&ctx.project, ctx.number, &username).await?;
                sc.reopen_issue(&ctx.project, ctx.number).await?;
                return Err(Error::validation(format!(
                    "winner {username} has no contest mapping"
                )));
            };

            let billing = self.contest().billing_account(ctx.project.tc_direct_id).await?;
            self.contest()
                .update_challenge(
                    &challenge_id,
                    &ChallengePatch {
                        billing_account_id: Some(billing),
                        prizes: Some(prizes_u64(&ctx.prizes)),
                        ..Default::default()
                    },
                )
                .await?;

            // The copilot is paid through a separate coalesced challenge when that flow is
            // enabled and they are also the winner; only then is the Copilot role skipped here.
            // An already-held role is a duplicate-add at the remote end, which counts as set.
            let copilot_is_winner = ctx.copilot == winner;
            if !(copilot_is_winner && ctx.project.create_copilot_payments) {
                self.contest()
                    .add_resource(&challenge_id, &ctx.copilot, ResourceRole::Copilot)
                    .await?;
            }
            self.contest()
                .add_resource(&challenge_id, &winner, ResourceRole::Submitter)
                .await?;

            if challenge.status == ChallengeStatus::Draft {
                self.contest().activate_challenge(&challenge_id).await?;
            }

            let winner_id = self.contest().member_id(&winner).await?;
            self.contest()
                .close_challenge(
                    &challenge_id,
                    &Winner {
                        user_id: winner_id,
                        handle: winner.clone(),
                        placement: 1,
                    },
                )
                .await?;

            Ok(winner)
        }
        .await;

        match res {
            Ok(winner) => {
                // Sticky from here on: transient failures below re-enter the label and
                // notification steps only.
                event.payment_successful = true;
                record.assignee.get_or_insert(winner);
                self.finish_payment(ctx, event, &mut record).await
            }
            Err(err) => {
                if !event.payment_successful {
                    record.status = IssueStatus::ChallengePaymentFailed;
                    if let Err(persist) = self.store().update_issue(&record).await {
                        tracing::error!(
                            event = "bridge.issue.close.stamp_failed",
                            key = %ctx.key(),
                            error = %persist,
                            "failed to stamp payment failure"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Post-payment bookkeeping: paid labels, paid comment, successful status.
    async fn finish_payment(
        &self,
        ctx: &IssueContext,
        event: &IssueEvent,
        record: &mut Issue,
    ) -> Result<()> {
        let sc = self.source(ctx.provider);
        let labels = self.labels();

        let handle = match record.assignee.clone() {
            Some(handle) => handle,
            None => match assignee_id(event) {
                Some(id) => self
                    .directory()
                    .contest_handle(ctx.provider, id)
                    .await?
                    .unwrap_or_default(),
                None => String::new(),
            },
        };

        let paid_labels =
            labels.swap_prefixed(&ctx.labels, &[labels.paid.as_str(), labels.assigned.as_str()]);
        sc.replace_labels(&ctx.project, ctx.number, &paid_labels).await?;

        let challenge_id = challenge_id_of(record)?;
        sc.mark_paid(
            &ctx.project,
            ctx.number,
            &self.challenge_url(&challenge_id),
            &handle,
        )
        .await?;

        record.labels = paid_labels;
        record.status = IssueStatus::ChallengePaymentSuccessful;
        self.store().update_issue(record).await?;

        tracing::info!(
            event = "bridge.issue.close.paid",
            key = %ctx.key(),
            handle = %handle,
            "payment completed"
        );
        Ok(())
    }

    /// `issue.labelUpdated`: persist the new label set.
    pub(crate) async fn issue_label_updated(
        &self,
        ctx: &IssueContext,
        event: &IssueEvent,
    ) -> Result<()> {
        let Some(mut record) = self.ensure_challenge_exists(ctx, event, true).await? else {
            return Ok(());
        };
        record.labels = ctx.labels.clone();
        self.store().update_issue(&record).await
    }

    /// `issue.recreated`: erase the binding and rebuild it from scratch, re-assigning the same
    /// user afterwards.
    pub(crate) async fn issue_recreate(&self, ctx: &IssueContext, event: &IssueEvent) -> Result<()> {
        let key = ctx.key();
        if let Some(record) = self
            .store()
            .issue_by_key(ctx.provider, ctx.repository_id, ctx.number)
            .await?
        {
            self.store().delete_issue(record.id).await?;
        }

        let sc = self.source(ctx.provider);
        let labels = self.labels();

        let stripped = labels.strip_prefixed(&ctx.labels);
        sc.replace_labels(&ctx.project, ctx.number, &stripped).await?;

        if let Some(user_id) = assignee_id(event) {
            let username = sc.username_by_id(&ctx.project, user_id).await?;
            sc.unassign_user(&ctx.project, ctx.number, &username).await?;
        }

        self.guard().clear(&key);

        sc.add_labels(
            &ctx.project,
            ctx.number,
            &[labels.open_for_pickup.clone()],
        )
        .await?;

        let mut fresh = ctx.clone();
        fresh.labels = stripped;
        fresh.labels.push(labels.open_for_pickup.clone());
        fresh.tcx_ready = true;

        tracing::info!(event = "bridge.issue.recreate", key = %key, "rebuilding challenge binding");
        Box::pin(self.issue_create(&fresh, event, true)).await
    }

    /// `comment.created` / `comment.updated`: `/bid` and `/accept_bid` commands.
    pub(crate) async fn issue_comment(&self, ctx: &IssueContext, event: &IssueEvent) -> Result<()> {
        let Some(comment) = &event.data.comment else {
            return Ok(());
        };
        let body = comment.body.trim();

        if let Some(caps) = BID_RE.captures(body) {
            tracing::info!(
                event = "bridge.issue.bid",
                key = %ctx.key(),
                amount = &caps[1],
                user_id = comment.user.id,
                "bid recorded"
            );
            return Ok(());
        }

        if body.starts_with("/accept_bid") {
            let caps = ACCEPT_BID_RE
                .captures(body)
                .ok_or_else(|| Error::validation("malformed /accept_bid command"))?;
            let user = caps[1].to_string();
            let amount = &caps[2];

            let sc = self.source(ctx.provider);
            let new_title = format!("[${amount}] {}", ctx.title);
            sc.update_title(&ctx.project, ctx.number, &new_title).await?;
            sc.assign_user(&ctx.project, ctx.number, &user).await?;

            tracing::info!(
                event = "bridge.issue.bid_accepted",
                key = %ctx.key(),
                user = %user,
                amount = %amount,
                "bid accepted"
            );
        }

        Ok(())
    }
}
