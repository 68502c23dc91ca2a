//! Dispatcher: routes parsed events onto the state machines.
//!
//! Issue events go through a common preprocessing pass first: project resolution, prize-token
//! parsing, title cleanup, markdown rendering and label readiness. A title with no prize tokens
//! is not a paid ticket; the event is dropped silently. Unknown event kinds are dropped, never
//! failed.

use pulldown_cmark::{html, Parser};
use regex::Regex;
use std::sync::LazyLock;

use bridge_core::event::{Event, IssueEvent};
use bridge_core::model::{issue_key, Project, Provider};
use bridge_core::{Error, Result};

use crate::Engine;

/// Everything the issue handlers need, resolved once per event.
#[derive(Debug, Clone)]
pub struct IssueContext {
    pub project: Project,
    pub provider: Provider,
    pub repository_id: i64,
    pub number: i64,
    /// Title with the leading `[...]` prize block stripped.
    pub title: String,
    /// Markdown body rendered to HTML.
    pub body_html: String,
    pub prizes: Vec<i64>,
    /// Labels as carried on the event.
    pub labels: Vec<String>,
    /// Whether any label carries the readiness prefix.
    pub tcx_ready: bool,
    pub repo_url: String,
    /// The repository copilot's contest handle.
    pub copilot: String,
}

impl IssueContext {
    pub fn key(&self) -> String {
        issue_key(self.provider, self.repository_id, self.number)
    }
}

static PRIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([0-9]+)").expect("prize regex"));
static TITLE_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[[^\]]*\]\s*").expect("title prefix regex"));

/// Prize tokens from a ticket title: every `$<n>` that is followed by a `]` later in the title.
/// No tokens means the ticket is unpaid.
pub fn parse_prizes(title: &str) -> Vec<i64> {
    let Some(last_bracket) = title.rfind(']') else {
        return Vec::new();
    };
    PRIZE_RE
        .captures_iter(title)
        .filter(|caps| caps.get(0).is_some_and(|m| m.end() <= last_bracket))
        .filter_map(|caps| caps[1].parse().ok())
        .collect()
}

/// Strip the leading `[...]` block (and the whitespace after it) from a title.
pub fn strip_prize_prefix(title: &str) -> String {
    TITLE_PREFIX_RE.replace(title, "").into_owned()
}

/// Render a markdown body to HTML.
pub fn render_markdown(source: &str) -> String {
    let mut out = String::with_capacity(source.len() * 2);
    html::push_html(&mut out, Parser::new(source));
    out
}

impl Engine {
    /// Handle one parsed event end to end. The event is mutable because the close pipeline
    /// stamps `paymentSuccessful` on it for retry stickiness.
    pub async fn handle(&self, event: &mut Event) -> Result<()> {
        let kind = event.kind();
        match event {
            Event::IssueCreated(e) => {
                let Some(ctx) = self.prepare(e, true).await? else {
                    return Ok(());
                };
                self.issue_create(&ctx, e, false).await
            }
            Event::IssueUpdated(e) => {
                let Some(ctx) = self.prepare(e, true).await? else {
                    return Ok(());
                };
                self.issue_update(&ctx, e).await
            }
            Event::IssueClosed(e) => {
                let Some(ctx) = self.prepare(e, true).await? else {
                    return Ok(());
                };
                self.issue_close(&ctx, e).await
            }
            Event::IssueRecreated(e) => {
                let Some(ctx) = self.prepare(e, true).await? else {
                    return Ok(());
                };
                self.issue_recreate(&ctx, e).await
            }
            Event::IssueAssigned(e) => {
                let Some(ctx) = self.prepare(e, true).await? else {
                    return Ok(());
                };
                self.issue_assign(&ctx, e, false).await
            }
            Event::IssueUnassigned(e) => {
                let Some(ctx) = self.prepare(e, true).await? else {
                    return Ok(());
                };
                self.issue_unassign(&ctx, e).await
            }
            Event::IssueLabelUpdated(e) => {
                let Some(ctx) = self.prepare(e, true).await? else {
                    return Ok(());
                };
                self.issue_label_updated(&ctx, e).await
            }
            Event::CommentCreated(e) | Event::CommentUpdated(e) => {
                // Comments may price an unpriced ticket (`/accept_bid`), so they skip the
                // paid-ticket gate.
                let Some(ctx) = self.prepare(e, false).await? else {
                    return Ok(());
                };
                self.issue_comment(&ctx, e).await
            }
            Event::CopilotPaymentAdd(e) => self.payment_add(e).await,
            Event::CopilotPaymentUpdate(e) => self.payment_update(e).await,
            Event::CopilotPaymentDelete(e) => self.payment_delete(e).await,
            Event::CopilotPaymentCheckUpdates(e) => self.payment_check_updates(e).await,
            Event::Unknown => {
                tracing::debug!(event = "bridge.dispatch.unknown", "unknown event kind dropped");
                Ok(())
            }
        }
        .map_err(|err| {
            tracing::debug!(
                event = "bridge.dispatch.failed",
                kind = %kind,
                error = %err,
                "handler failed"
            );
            err
        })
    }

    /// Common issue-event preprocessing. Returns `None` when the ticket is not a paid one.
    pub(crate) async fn prepare(
        &self,
        event: &IssueEvent,
        require_prizes: bool,
    ) -> Result<Option<IssueContext>> {
        let provider = event.provider;
        let repo_url = event.data.repository.url(provider);

        let project = self
            .store()
            .project_by_repo_url(&repo_url)
            .await?
            .ok_or_else(|| Error::not_found(format!("no project for {repo_url}")))?;

        let raw_title = &event.data.issue.title;
        let prizes = parse_prizes(raw_title);
        if require_prizes && prizes.is_empty() {
            tracing::debug!(
                event = "bridge.dispatch.unpaid",
                repo = %repo_url,
                number = event.data.issue.number,
                "no prize tokens in title; dropping"
            );
            return Ok(None);
        }

        let labels = event.data.issue.labels.clone();
        let tcx_ready = self.labels().ready(&labels);

        // The project registration carries the copilot's contest handle pre-resolved; the same
        // upstream tooling that maintains the user mappings writes it.
        let copilot = project.copilot.clone();

        Ok(Some(IssueContext {
            repository_id: event.data.repository.id.normalize(),
            number: event.data.issue.number,
            title: strip_prize_prefix(raw_title),
            body_html: render_markdown(event.data.issue.body.as_deref().unwrap_or_default()),
            prizes,
            labels,
            tcx_ready,
            repo_url,
            copilot,
            provider,
            project,
        }))
    }
}
