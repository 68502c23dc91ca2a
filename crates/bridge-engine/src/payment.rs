//! Copilot-payment state machine.
//!
//! Payment rows are inserted, edited and deleted by an upstream admin tool; the bridge reacts to
//! those mutations. All open rows for one (project, copilot) pair coalesce into a single
//! challenge: the first row creates it, later rows adopt its id and re-shape the prize to the
//! coalesced sum.

use chrono::{Datelike, NaiveDate, Utc};

use bridge_core::event::PaymentEvent;
use bridge_core::model::{PaymentStatus, Project};
use bridge_core::{ChallengePatch, ChallengeStatus, Error, NewChallenge, ResourceRole, Result};

use crate::Engine;

/// Challenge name for a copilot payment: long-form English date with the day suffix the
/// platform has always used (`3rd`, everything else `th` — including `1th` and `2th`).
pub fn copilot_challenge_name(project_title: &str, date: NaiveDate) -> String {
    let suffix = if date.day() == 3 { "rd" } else { "th" };
    format!(
        "Copilot payment for {project_title} {} {}{suffix}, {}",
        date.format("%B"),
        date.day(),
        date.year()
    )
}

impl Engine {
    /// `copilotPayment.add`: adopt an existing coalesced challenge, wait out a pending sibling,
    /// or create a fresh challenge for this row.
    pub(crate) async fn payment_add(&self, event: &PaymentEvent) -> Result<()> {
        let Some(payload) = &event.data.payment else {
            return Err(Error::validation("copilotPayment.add without payment data"));
        };

        let Some(mut row) = self.store().payment_by_id(payload.id).await? else {
            return Err(Error::not_found(format!(
                "copilot payment {} not found",
                payload.id
            )));
        };
        if row.closed {
            return Ok(());
        }

        let open = self.store().open_payments(row.project, &row.username).await?;

        // A sibling already carries the coalesced challenge: adopt its id and re-shape.
        if let Some(challenge_id) = open
            .iter()
            .filter(|p| p.id != row.id)
            .find_map(|p| p.challenge_id.clone())
        {
            row.challenge_id = Some(challenge_id.clone());
            row.status = PaymentStatus::ChallengeCreationSuccessful;
            self.store().update_payment(&row).await?;

            tracing::info!(
                event = "bridge.payment.add.adopted",
                payment_id = %row.id,
                challenge_id = %challenge_id,
                "payment adopted existing challenge"
            );
            return self.reshape_payment_challenge(&challenge_id).await;
        }

        // A sibling's creation is still in flight: wait our turn.
        if open
            .iter()
            .any(|p| p.id != row.id && p.status == PaymentStatus::ChallengeCreationPending)
        {
            return Err(Error::internal_dependency(
                "copilot payment challenge creation pending, reschedule",
            ));
        }

        let project = self.payment_project(&row.project).await?;

        row.status = PaymentStatus::ChallengeCreationPending;
        self.store().update_payment(&row).await?;

        let res: Result<String> = async {
            let challenge_id = self
                .contest()
                .create_challenge(&NewChallenge {
                    name: copilot_challenge_name(&project.title, Utc::now().date_naive()),
                    project_id: project.tc_direct_id,
                    description: row.description.clone(),
                    prizes: vec![row.amount.max(0) as u64],
                    copilot_payment: true,
                    submission_guidelines: None,
                })
                .await?;

            self.contest()
                .add_resource(&challenge_id, &row.username, ResourceRole::Copilot)
                .await?;
            self.contest().activate_challenge(&challenge_id).await?;

            Ok(challenge_id)
        }
        .await;

        match res {
            Ok(challenge_id) => {
                row.challenge_id = Some(challenge_id.clone());
                row.status = PaymentStatus::ChallengeCreationSuccessful;
                self.store().update_payment(&row).await?;

                tracing::info!(
                    event = "bridge.payment.add.ok",
                    payment_id = %row.id,
                    challenge_id = %challenge_id,
                    "copilot payment challenge created"
                );
                Ok(())
            }
            Err(err) => {
                row.status = PaymentStatus::ChallengeCreationRetried;
                if let Err(persist) = self.store().update_payment(&row).await {
                    tracing::error!(
                        event = "bridge.payment.add.stamp_failed",
                        payment_id = %row.id,
                        error = %persist,
                        "failed to stamp retried status"
                    );
                }
                Err(err)
            }
        }
    }

    /// `copilotPayment.update`: re-shape the coalesced challenge from the surviving rows; a row
    /// that never made it into a challenge goes through the add path instead.
    pub(crate) async fn payment_update(&self, event: &PaymentEvent) -> Result<()> {
        let Some(payload) = &event.data.payment else {
            return Err(Error::validation("copilotPayment.update without payment data"));
        };

        let challenge_id = match &payload.challenge_uuid {
            Some(id) => Some(id.clone()),
            None => self
                .store()
                .payment_by_id(payload.id)
                .await?
                .and_then(|row| row.challenge_id),
        };

        match challenge_id {
            Some(id) => self.reshape_payment_challenge(&id).await,
            None => self.payment_add(event).await,
        }
    }

    /// `copilotPayment.delete`: the row is gone upstream; re-shape whatever remains.
    pub(crate) async fn payment_delete(&self, event: &PaymentEvent) -> Result<()> {
        let Some(payload) = &event.data.payment else {
            return Err(Error::validation("copilotPayment.delete without payment data"));
        };

        match &payload.challenge_uuid {
            Some(id) => self.reshape_payment_challenge(id).await,
            None => Ok(()),
        }
    }

    /// `copilotPayment.checkUpdates`: close out every payment row whose challenge completed.
    pub(crate) async fn payment_check_updates(&self, event: &PaymentEvent) -> Result<()> {
        let Some(copilot) = &event.data.copilot else {
            return Err(Error::validation(
                "copilotPayment.checkUpdates without copilot data",
            ));
        };

        let projects = self.store().projects_for_user(&copilot.handle).await?;

        let mut challenge_ids = std::collections::BTreeSet::new();
        for project in &projects {
            for row in self.store().open_payments(project.id, &copilot.handle).await? {
                if let Some(id) = row.challenge_id {
                    challenge_ids.insert(id);
                }
            }
        }

        for challenge_id in challenge_ids {
            let challenge = self.contest().get_challenge(&challenge_id).await?;
            if challenge.status != ChallengeStatus::Completed {
                continue;
            }

            for mut row in self.store().payments_by_challenge(&challenge_id).await? {
                row.closed = true;
                self.store().update_payment(&row).await?;
            }

            tracing::info!(
                event = "bridge.payment.check_updates.closed",
                challenge_id = %challenge_id,
                copilot = %copilot.handle,
                "completed payment challenge closed out"
            );
        }

        Ok(())
    }

    /// Rebuild a coalesced challenge's description and prize from its surviving open rows. An
    /// empty survivor set cancels the challenge (a logged no-op at the remote end).
    async fn reshape_payment_challenge(&self, challenge_id: &str) -> Result<()> {
        let rows = self.store().payments_by_challenge(challenge_id).await?;

        if rows.is_empty() {
            return self.contest().cancel_challenge(challenge_id).await;
        }

        let total: i64 = rows.iter().map(|r| r.amount.max(0)).sum();
        let description = rows
            .iter()
            .map(|r| r.description.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        self.contest()
            .update_challenge(
                challenge_id,
                &ChallengePatch {
                    description: Some(description),
                    prizes: Some(vec![total as u64]),
                    copilot_payment: true,
                    ..Default::default()
                },
            )
            .await
    }

    async fn payment_project(&self, id: &uuid::Uuid) -> Result<Project> {
        self.store()
            .project_by_id(*id)
            .await?
            .ok_or_else(|| Error::not_found(format!("no project {id} for copilot payment")))
    }
}
