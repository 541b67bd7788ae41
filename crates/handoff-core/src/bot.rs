//! Thin bot-facing surface.
//!
//! Bots interact with the kernel through four calls: `request_command`,
//! `report_artifact`, `request_decision`, and `await_decision`.
//! [`BotSession`] binds a kernel handle, the bot's ambient identity, and a
//! project, and delegates — no logic of its own.

use crate::artifact::{ArtifactReport, Reported};
use crate::auth::Identity;
use crate::command::{Admitted, CommandRequest};
use crate::core::Core;
use crate::decision::{DecisionRequest, DecisionSnapshot};
use crate::error::CoreError;

/// A bot's bound view of one project.
pub struct BotSession<'a> {
    core: &'a Core,
    identity: Identity,
    project_id: String,
}

impl<'a> BotSession<'a> {
    /// Binds a bot identity to a project.
    #[must_use]
    pub fn new(core: &'a Core, identity: Identity, project_id: impl Into<String>) -> Self {
        Self {
            core,
            identity,
            project_id: project_id.into(),
        }
    }

    /// Enqueues a command. See [`Core::request_command`].
    ///
    /// # Errors
    ///
    /// Propagates the kernel's admission errors.
    pub fn request_command(&self, request: CommandRequest) -> Result<Admitted, CoreError> {
        self.core
            .request_command(&self.identity, &self.project_id, request)
    }

    /// Registers an artifact. See [`Core::report_artifact`].
    ///
    /// # Errors
    ///
    /// Propagates the kernel's registry errors.
    pub fn report_artifact(&self, report: ArtifactReport) -> Result<Reported, CoreError> {
        self.core
            .report_artifact(&self.identity, &self.project_id, report)
    }

    /// Requests a human decision. See [`Core::request_decision`].
    ///
    /// # Errors
    ///
    /// Propagates the kernel's decision errors.
    pub fn request_decision(&self, request: DecisionRequest) -> Result<String, CoreError> {
        self.core
            .request_decision(&self.identity, &self.project_id, request)
    }

    /// Snapshots a decision's state. See [`Core::await_decision`].
    ///
    /// A bot that cannot suspend on the job primitive's wake signal polls
    /// this instead; the snapshot is the same either way.
    ///
    /// # Errors
    ///
    /// Propagates the kernel's decision errors.
    pub fn await_decision(&self, decision_id: &str) -> Result<DecisionSnapshot, CoreError> {
        self.core
            .await_decision(&self.identity, &self.project_id, decision_id)
    }
}
