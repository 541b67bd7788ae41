//! Shared helpers for the in-crate test modules.

use std::sync::Arc;

use crate::artifact::InMemoryBlobStore;
use crate::auth::{Identity, Role};
use crate::command::{CommandConstraints, CommandRequest, CommandSpec};
use crate::config::CoreConfig;
use crate::core::Core;
use crate::decision::{DecisionOption, DecisionRequest, Urgency};
use crate::events::Scope;
use crate::jobs::InMemoryJobQueue;
use crate::ledger::Store;

pub(crate) const TENANT: &str = "tenant-a";
pub(crate) const PROJECT: &str = "proj-1";

/// A kernel with one project, an owner, a bot, an operator, and a viewer.
pub(crate) struct TestProject {
    pub core: Core,
    pub jobs: Arc<InMemoryJobQueue>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub owner: Identity,
    pub bot: Identity,
    pub operator: Identity,
    pub viewer: Identity,
}

impl TestProject {
    pub fn new() -> Self {
        let jobs = Arc::new(InMemoryJobQueue::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let core = Core::new(Store::in_memory().unwrap(), CoreConfig::default())
            .with_job_queue(jobs.clone())
            .with_blob_store(blobs.clone());
        let owner = Identity::new("user-owner", TENANT);
        core.init_project(&owner, PROJECT, "Project One").unwrap();

        let bot = Identity::new("bot-1", TENANT);
        let operator = Identity::new("op-1", TENANT);
        let viewer = Identity::new("viewer-1", TENANT);
        core.add_member(&owner, PROJECT, "bot-1", Role::Bot).unwrap();
        core.add_member(&owner, PROJECT, "op-1", Role::Operator)
            .unwrap();
        core.add_member(&owner, PROJECT, "viewer-1", Role::Viewer)
            .unwrap();

        Self {
            core,
            jobs,
            blobs,
            owner,
            bot,
            operator,
            viewer,
        }
    }

    pub fn scope(&self) -> Scope {
        Scope::new(TENANT, PROJECT)
    }

    /// Reads a card row straight from the store.
    pub fn card(&self, card_id: &str) -> crate::card::Card {
        self.core
            .store()
            .with_conn(|conn| crate::card::load(conn, &self.scope(), card_id))
            .unwrap()
            .expect("card exists")
    }

    /// Reads a decision row straight from the store.
    pub fn decision(&self, decision_id: &str) -> crate::decision::Decision {
        self.core
            .store()
            .with_conn(|conn| crate::decision::load(conn, &self.scope(), decision_id))
            .unwrap()
            .expect("decision exists")
    }

    /// Admits a command and returns `(command_id, card_id)`.
    pub fn admit(&self, command_type: &str) -> (String, String) {
        let admitted = self
            .core
            .request_command(&self.bot, PROJECT, command_request(command_type))
            .unwrap();
        (admitted.command_id, admitted.card_id)
    }

    /// Admits and starts a command; returns `(command_id, card_id, run_id)`.
    pub fn start_flow(&self, command_type: &str) -> (String, String, String) {
        let (command_id, card_id) = self.admit(command_type);
        let run_id = self
            .core
            .start_command(&self.scope(), &command_id, &card_id, Some("worker-1"), None)
            .unwrap();
        (command_id, card_id, run_id)
    }

    /// Starts a flow and requests a decision on it; returns
    /// `(command_id, card_id, run_id, decision_id)`.
    pub fn raise_decision(
        &self,
        urgency: Urgency,
        expires_at: Option<i64>,
        fallback: Option<&str>,
    ) -> (String, String, String, String) {
        let (command_id, card_id, run_id) = self.start_flow("digest.compile");
        let decision_id = self
            .core
            .request_decision(
                &self.bot,
                PROJECT,
                decision_request(&card_id, &command_id, &run_id, urgency, expires_at, fallback),
            )
            .unwrap();
        (command_id, card_id, run_id, decision_id)
    }
}

pub(crate) fn command_request(command_type: &str) -> CommandRequest {
    CommandRequest {
        spec: CommandSpec::new(command_type),
        title: format!("run {command_type}"),
        correlation_id: None,
        capabilities: None,
        idempotency_key: None,
    }
}

pub(crate) fn command_request_with(
    command_type: &str,
    constraints: CommandConstraints,
    idempotency_key: Option<&str>,
) -> CommandRequest {
    let mut spec = CommandSpec::new(command_type);
    spec.constraints = Some(constraints);
    CommandRequest {
        spec,
        title: format!("run {command_type}"),
        correlation_id: None,
        capabilities: None,
        idempotency_key: idempotency_key.map(ToString::to_string),
    }
}

pub(crate) fn decision_request(
    card_id: &str,
    command_id: &str,
    run_id: &str,
    urgency: Urgency,
    expires_at: Option<i64>,
    fallback: Option<&str>,
) -> DecisionRequest {
    DecisionRequest {
        card_id: card_id.to_string(),
        command_id: command_id.to_string(),
        run_id: run_id.to_string(),
        correlation_id: None,
        urgency,
        title: "Approve the digest?".to_string(),
        context_summary: None,
        options: vec![
            DecisionOption::new("approve", "Approve", "publishes the digest"),
            DecisionOption::new("edit", "Edit", "reopens for edits"),
            DecisionOption::new("reject", "Reject", "discards the digest"),
        ],
        artifact_refs: None,
        source_thread: None,
        expires_at,
        fallback_option: fallback.map(ToString::to_string),
    }
}
