//! Shared fixtures for the integration suites.

// Each integration binary uses a different slice of the fixture.
#![allow(dead_code)]

use std::sync::Arc;

use handoff_core::artifact::InMemoryBlobStore;
use handoff_core::auth::{Identity, Role};
use handoff_core::command::{CommandConstraints, CommandRequest, CommandSpec};
use handoff_core::decision::{DecisionOption, DecisionRequest, Urgency};
use handoff_core::jobs::InMemoryJobQueue;
use handoff_core::{Core, CoreConfig, Scope, Store};

pub const TENANT: &str = "tenant-a";
pub const PROJECT: &str = "proj-digest";

pub struct Fixture {
    pub core: Core,
    pub jobs: Arc<InMemoryJobQueue>,
    pub owner: Identity,
    pub bot: Identity,
    pub operator: Identity,
}

impl Fixture {
    pub fn new() -> Self {
        let jobs = Arc::new(InMemoryJobQueue::new());
        let core = Core::new(Store::in_memory().unwrap(), CoreConfig::default())
            .with_job_queue(jobs.clone())
            .with_blob_store(Arc::new(InMemoryBlobStore::new()));
        let owner = Identity::new("user-ada", TENANT);
        core.init_project(&owner, PROJECT, "Daily digest").unwrap();

        let bot = Identity::new("bot-digest", TENANT);
        let operator = Identity::new("op-grace", TENANT);
        core.add_member(&owner, PROJECT, "bot-digest", Role::Bot)
            .unwrap();
        core.add_member(&owner, PROJECT, "op-grace", Role::Operator)
            .unwrap();

        Self {
            core,
            jobs,
            owner,
            bot,
            operator,
        }
    }

    pub fn scope(&self) -> Scope {
        Scope::new(TENANT, PROJECT)
    }

    pub fn admit_with(
        &self,
        priority: Option<i64>,
        correlation_id: Option<&str>,
    ) -> (String, String) {
        let admitted = self
            .core
            .request_command(&self.bot, PROJECT, CommandRequest {
                spec: CommandSpec {
                    command_type: "digest.compile".into(),
                    command_version: None,
                    args: None,
                    context: None,
                    constraints: priority.map(|p| CommandConstraints {
                        priority: Some(p),
                        ..CommandConstraints::default()
                    }),
                },
                title: "Compile the daily digest".into(),
                correlation_id: correlation_id.map(ToString::to_string),
                capabilities: None,
                idempotency_key: None,
            })
            .unwrap();
        (admitted.command_id, admitted.card_id)
    }

    /// Admission plus `READY -> RUNNING`; returns the triple a bot holds.
    pub fn running_flow(&self) -> (String, String, String) {
        let (command_id, card_id) = self.admit_with(None, None);
        let run_id = self
            .core
            .start_command(&self.scope(), &command_id, &card_id, Some("worker-1"), None)
            .unwrap();
        (command_id, card_id, run_id)
    }

    pub fn decision_request(
        &self,
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
            title: "Approve the digest?".into(),
            context_summary: Some("Compiled from 12 sources".into()),
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

    /// Raises a decision on a fresh running flow.
    pub fn raise(
        &self,
        urgency: Urgency,
        expires_at: Option<i64>,
        fallback: Option<&str>,
    ) -> (String, String, String, String) {
        let (command_id, card_id, run_id) = self.running_flow();
        let decision_id = self
            .core
            .request_decision(
                &self.bot,
                PROJECT,
                self.decision_request(&card_id, &command_id, &run_id, urgency, expires_at, fallback),
            )
            .unwrap();
        (command_id, card_id, run_id, decision_id)
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
