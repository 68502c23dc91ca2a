//! Event-processing engine.
//!
//! This crate is the bridge's core: the dispatcher from parsed bus events onto the issue and
//! copilot-payment state machines, the per-ticket creation guard, and the retry service. All
//! remote effects go through the seam traits in `bridge-core`, so the engine is driven the same
//! way in production and in the scenario tests.

use std::sync::Arc;

use bridge_core::model::{LabelSet, Provider};
use bridge_core::{ContestApi, SourceControl, Store, UserDirectory};

pub mod comments;
pub mod dispatcher;
pub mod guard;
pub mod issue;
pub mod payment;
pub mod retry;

use guard::CreationGuard;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub labels: LabelSet,
    /// Web base for challenge links in ticket comments, e.g. `https://contest.example.com`.
    pub challenge_web_base: String,
}

/// The engine context: one per process, shared across handler invocations.
pub struct Engine {
    store: Arc<dyn Store>,
    directory: Arc<dyn UserDirectory>,
    contest: Arc<dyn ContestApi>,
    github: Arc<dyn SourceControl>,
    gitlab: Arc<dyn SourceControl>,
    guard: CreationGuard,
    cfg: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        directory: Arc<dyn UserDirectory>,
        contest: Arc<dyn ContestApi>,
        github: Arc<dyn SourceControl>,
        gitlab: Arc<dyn SourceControl>,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            store,
            directory,
            contest,
            github,
            gitlab,
            guard: CreationGuard::new(),
            cfg,
        }
    }

    pub(crate) fn source(&self, provider: Provider) -> &dyn SourceControl {
        match provider {
            Provider::Github => self.github.as_ref(),
            Provider::Gitlab => self.gitlab.as_ref(),
        }
    }

    pub(crate) fn challenge_url(&self, challenge_id: &str) -> String {
        format!(
            "{}/challenges/{}",
            self.cfg.challenge_web_base.trim_end_matches('/'),
            challenge_id
        )
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub(crate) fn directory(&self) -> &dyn UserDirectory {
        self.directory.as_ref()
    }

    pub(crate) fn contest(&self) -> &dyn ContestApi {
        self.contest.as_ref()
    }

    pub(crate) fn guard(&self) -> &CreationGuard {
        &self.guard
    }

    pub(crate) fn labels(&self) -> &LabelSet {
        &self.cfg.labels
    }
}
