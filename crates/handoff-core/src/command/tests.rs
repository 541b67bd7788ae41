//! Tests for command admission and the runner operations.

use super::*;
use crate::EventType;
use crate::card::CardState;
use crate::run::RunStatus;
use crate::testutil::{PROJECT, TestProject, command_request, command_request_with};

#[test]
fn admission_creates_command_and_ready_card() {
    let fixture = TestProject::new();
    let (command_id, card_id) = fixture.admit("digest.compile");

    let command = fixture
        .core
        .get_command(&fixture.bot, PROJECT, &command_id)
        .unwrap();
    assert_eq!(command.status, CommandStatus::Pending);
    assert_eq!(command.priority, 50);
    assert!(command.latest_run_id.is_none());

    let card = fixture.card(&card_id);
    assert_eq!(card.state, CardState::Ready);
    assert_eq!(card.attempt, 0);
    assert_eq!(card.command_id, command_id);
}

#[test]
fn admission_respects_spec_priority() {
    let fixture = TestProject::new();
    let admitted = fixture
        .core
        .request_command(
            &fixture.bot,
            PROJECT,
            command_request_with(
                "digest.compile",
                CommandConstraints {
                    priority: Some(30),
                    ..CommandConstraints::default()
                },
                None,
            ),
        )
        .unwrap();
    let command = fixture
        .core
        .get_command(&fixture.bot, PROJECT, &admitted.command_id)
        .unwrap();
    assert_eq!(command.priority, 30);
}

#[test]
fn admission_enqueues_a_dispatch_job() {
    let fixture = TestProject::new();
    let (_, card_id) = fixture.admit("digest.compile");
    let jobs = fixture.jobs.drain_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name, "card.dispatch");
    assert_eq!(jobs[0].pool, PROJECT);
    assert_eq!(jobs[0].payload["card_id"], card_id.as_str());
}

#[test]
fn concurrency_key_names_the_job_pool() {
    let fixture = TestProject::new();
    fixture
        .core
        .request_command(
            &fixture.bot,
            PROJECT,
            command_request_with(
                "digest.compile",
                CommandConstraints {
                    concurrency_key: Some("digest-pool".into()),
                    ..CommandConstraints::default()
                },
                None,
            ),
        )
        .unwrap();
    let jobs = fixture.jobs.drain_jobs();
    assert_eq!(jobs[0].pool, "digest-pool");
}

#[test]
fn duplicate_idempotency_key_returns_original_ids() {
    let fixture = TestProject::new();
    let first = fixture
        .core
        .request_command(
            &fixture.bot,
            PROJECT,
            command_request_with("digest.compile", CommandConstraints::default(), Some("k-1")),
        )
        .unwrap();
    let second = fixture
        .core
        .request_command(
            &fixture.bot,
            PROJECT,
            command_request_with("digest.compile", CommandConstraints::default(), Some("k-1")),
        )
        .unwrap();

    assert!(second.deduplicated);
    assert_eq!(second.command_id, first.command_id);
    assert_eq!(second.card_id, first.card_id);

    // The skip is itself recorded; the original chain has exactly one
    // CommandRequested and one CardCreated.
    let chain = fixture
        .core
        .events_by_correlation(&fixture.scope(), &first.command_id)
        .unwrap();
    let count = |t: EventType| chain.iter().filter(|e| e.event_type == t).count();
    assert_eq!(count(EventType::CommandRequested), 1);
    assert_eq!(count(EventType::CardCreated), 1);
    assert_eq!(count(EventType::CommandSkippedDuplicate), 1);
}

#[test]
fn start_command_mints_a_running_run() {
    let fixture = TestProject::new();
    let (command_id, card_id, run_id) = fixture.start_flow("digest.compile");

    let command = fixture
        .core
        .get_command(&fixture.bot, PROJECT, &command_id)
        .unwrap();
    assert_eq!(command.status, CommandStatus::Running);
    assert_eq!(command.latest_run_id.as_deref(), Some(run_id.as_str()));

    let run = fixture
        .core
        .get_run(&fixture.bot, PROJECT, &run_id)
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.attempt, 1);
    assert_eq!(run.executor.as_deref(), Some("worker-1"));

    let card = fixture.card(&card_id);
    assert_eq!(card.state, CardState::Running);
    assert_eq!(card.attempt, 1);
}

#[test]
fn start_requires_a_ready_card() {
    let fixture = TestProject::new();
    let (command_id, card_id, _) = fixture.start_flow("digest.compile");
    let err = fixture
        .core
        .start_command(&fixture.scope(), &command_id, &card_id, None, None)
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
}

#[test]
fn succeed_closes_run_command_and_card() {
    let fixture = TestProject::new();
    let (command_id, card_id, run_id) = fixture.start_flow("digest.compile");
    fixture
        .core
        .succeed_command(&fixture.scope(), &command_id, &card_id, &run_id, None, None)
        .unwrap();

    let command = fixture
        .core
        .get_command(&fixture.bot, PROJECT, &command_id)
        .unwrap();
    assert_eq!(command.status, CommandStatus::Succeeded);
    let run = fixture
        .core
        .get_run(&fixture.bot, PROJECT, &run_id)
        .unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.ended_ts.is_some());
}

#[test]
fn non_retryable_failure_fails_the_card() {
    let fixture = TestProject::new();
    let (command_id, card_id, run_id) = fixture.start_flow("digest.compile");
    fixture
        .core
        .fail_command(
            &fixture.scope(),
            &command_id,
            &card_id,
            &run_id,
            "boom",
            false,
            None,
        )
        .unwrap();

    let run = fixture
        .core
        .get_run(&fixture.bot, PROJECT, &run_id)
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("boom"));

    let chain = fixture
        .core
        .events_by_correlation(&fixture.scope(), &command_id)
        .unwrap();
    assert!(
        chain
            .iter()
            .any(|e| e.event_type == EventType::CardTransitioned
                && e.payload["to"] == "FAILED")
    );
    assert!(
        !chain
            .iter()
            .any(|e| e.event_type == EventType::CommandRetryScheduled)
    );
}

#[test]
fn retryable_failure_schedules_a_retry_within_budget() {
    let fixture = TestProject::new();
    let admitted = fixture
        .core
        .request_command(
            &fixture.bot,
            PROJECT,
            command_request_with(
                "digest.compile",
                CommandConstraints {
                    max_retries: Some(2),
                    ..CommandConstraints::default()
                },
                None,
            ),
        )
        .unwrap();
    let scope = fixture.scope();
    let run_id = fixture
        .core
        .start_command(&scope, &admitted.command_id, &admitted.card_id, None, None)
        .unwrap();
    fixture
        .core
        .fail_command(
            &scope,
            &admitted.command_id,
            &admitted.card_id,
            &run_id,
            "transient",
            true,
            None,
        )
        .unwrap();

    let chain = fixture
        .core
        .events_by_correlation(&scope, &admitted.command_id)
        .unwrap();
    let retry = chain
        .iter()
        .find(|e| e.event_type == EventType::CommandRetryScheduled)
        .expect("retry scheduled");
    assert!(retry.payload["retry_at_ts"].as_i64().unwrap() > 0);
    assert!(
        chain
            .iter()
            .any(|e| e.event_type == EventType::CardTransitioned
                && e.payload["to"] == "RETRY_SCHEDULED")
    );
}

#[test]
fn retryable_failure_without_budget_fails_terminally() {
    let fixture = TestProject::new();
    // Default constraints: max_retries = 0.
    let (command_id, card_id, run_id) = fixture.start_flow("digest.compile");
    fixture
        .core
        .fail_command(
            &fixture.scope(),
            &command_id,
            &card_id,
            &run_id,
            "transient",
            true,
            None,
        )
        .unwrap();
    let chain = fixture
        .core
        .events_by_correlation(&fixture.scope(), &command_id)
        .unwrap();
    assert!(
        !chain
            .iter()
            .any(|e| e.event_type == EventType::CommandRetryScheduled)
    );
}

#[test]
fn cancel_fails_a_running_card() {
    let fixture = TestProject::new();
    let (command_id, _card_id, _run_id) = fixture.start_flow("digest.compile");
    fixture
        .core
        .cancel_command(&fixture.operator, PROJECT, &command_id, "superseded")
        .unwrap();

    let command = fixture
        .core
        .get_command(&fixture.bot, PROJECT, &command_id)
        .unwrap();
    assert_eq!(command.status, CommandStatus::Canceled);

    let chain = fixture
        .core
        .events_by_correlation(&fixture.scope(), &command_id)
        .unwrap();
    assert!(
        chain
            .iter()
            .any(|e| e.event_type == EventType::CardTransitioned
                && e.payload["reason"] == "command canceled")
    );
}

#[test]
fn cancel_of_a_terminal_command_is_rejected() {
    let fixture = TestProject::new();
    let (command_id, card_id, run_id) = fixture.start_flow("digest.compile");
    fixture
        .core
        .succeed_command(&fixture.scope(), &command_id, &card_id, &run_id, None, None)
        .unwrap();
    let err = fixture
        .core
        .cancel_command(&fixture.operator, PROJECT, &command_id, "too late")
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
}

#[test]
fn bots_cannot_cancel() {
    let fixture = TestProject::new();
    let (command_id, _) = fixture.admit("digest.compile");
    let err = fixture
        .core
        .cancel_command(&fixture.bot, PROJECT, &command_id, "nope")
        .unwrap_err();
    assert_eq!(err.kind(), "insufficient_permissions");
}

#[test]
fn create_card_fans_out_an_existing_command() {
    let fixture = TestProject::new();
    let (command_id, first_card) = fixture.admit("digest.compile");
    let second_card = fixture
        .core
        .create_card(
            &fixture.bot,
            PROJECT,
            &command_id,
            "render the digest",
            crate::card::CardSpec {
                command_type: "digest.render".into(),
                args: None,
                constraints: None,
            },
        )
        .unwrap();
    assert_ne!(second_card, first_card);

    let chain = fixture
        .core
        .events_by_correlation(&fixture.scope(), &command_id)
        .unwrap();
    assert_eq!(
        chain
            .iter()
            .filter(|e| e.event_type == EventType::CardCreated)
            .count(),
        2
    );
}

#[test]
fn cross_project_command_is_not_found() {
    let fixture = TestProject::new();
    let (command_id, _) = fixture.admit("digest.compile");
    fixture
        .core
        .init_project(&fixture.owner, "proj-other", "Other")
        .unwrap();
    let err = fixture
        .core
        .get_command(&fixture.owner, "proj-other", &command_id)
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}
