//! Tests for the run read model.

use super::*;
use crate::testutil::{PROJECT, TestProject};

#[test]
fn status_round_trips_through_strings() {
    for status in [RunStatus::Running, RunStatus::Succeeded, RunStatus::Failed] {
        assert_eq!(RunStatus::parse(status.as_str()), Some(status));
    }
    assert_eq!(RunStatus::parse("PAUSED"), None);
}

#[test]
fn runs_accumulate_per_command_across_retries() {
    let fixture = TestProject::new();
    let admitted = fixture
        .core
        .request_command(
            &fixture.bot,
            PROJECT,
            crate::testutil::command_request_with(
                "digest.compile",
                crate::command::CommandConstraints {
                    max_retries: Some(1),
                    ..crate::command::CommandConstraints::default()
                },
                None,
            ),
        )
        .unwrap();
    let scope = fixture.scope();

    let first_run = fixture
        .core
        .start_command(&scope, &admitted.command_id, &admitted.card_id, None, None)
        .unwrap();
    fixture
        .core
        .fail_command(
            &scope,
            &admitted.command_id,
            &admitted.card_id,
            &first_run,
            "transient",
            true,
            None,
        )
        .unwrap();
    // Release the retry timer and run again.
    let later = chrono::Utc::now().timestamp_millis() + 2 * 60 * 60 * 1000;
    fixture.core.sweep(Some(later)).unwrap();
    let second_run = fixture
        .core
        .start_command(&scope, &admitted.command_id, &admitted.card_id, None, None)
        .unwrap();

    let runs = fixture
        .core
        .runs_for_command(&fixture.viewer, PROJECT, &admitted.command_id)
        .unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id, first_run);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[1].run_id, second_run);
    assert_eq!(runs[1].status, RunStatus::Running);
    assert_eq!(runs[1].attempt, 2);
}

#[test]
fn cross_project_run_is_not_found() {
    let fixture = TestProject::new();
    let (.., run_id) = fixture.start_flow("digest.compile");
    fixture
        .core
        .init_project(&fixture.owner, "proj-2", "Second")
        .unwrap();
    let err = fixture
        .core
        .get_run(&fixture.owner, "proj-2", &run_id)
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}
