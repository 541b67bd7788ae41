//! Tests for the decision lifecycle.

use super::*;
use crate::CoreError;
use crate::events::EventType;
use crate::jobs::WakeOutcome;
use crate::testutil::{PROJECT, TestProject, decision_request};

#[test]
fn request_validates_options_and_fallback() {
    let fixture = TestProject::new();
    let (command_id, card_id, run_id) = fixture.start_flow("digest.compile");

    let mut empty = decision_request(&card_id, &command_id, &run_id, Urgency::Today, None, None);
    empty.options.clear();
    let err = fixture
        .core
        .request_decision(&fixture.bot, PROJECT, empty)
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_options");

    let mut duped = decision_request(&card_id, &command_id, &run_id, Urgency::Today, None, None);
    duped.options.push(DecisionOption::new("approve", "x", "y"));
    let err = fixture
        .core
        .request_decision(&fixture.bot, PROJECT, duped)
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_options");

    let bad_fallback = decision_request(
        &card_id,
        &command_id,
        &run_id,
        Urgency::Today,
        None,
        Some("shrug"),
    );
    let err = fixture
        .core
        .request_decision(&fixture.bot, PROJECT, bad_fallback)
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidFallback { .. }));
}

#[test]
fn request_moves_the_card_to_needs_decision() {
    let fixture = TestProject::new();
    let (_, card_id, _, decision_id) = fixture.raise_decision(Urgency::Today, None, None);

    let decision = fixture.decision(&decision_id);
    assert_eq!(decision.state, DecisionState::Pending);
    assert_eq!(decision.card_id, card_id);

    let card = fixture.card(&card_id);
    assert_eq!(card.state, crate::card::CardState::NeedsDecision);
}

#[test]
fn request_requires_a_running_card() {
    let fixture = TestProject::new();
    let (command_id, card_id) = fixture.admit("digest.compile");
    let err = fixture
        .core
        .request_decision(
            &fixture.bot,
            PROJECT,
            decision_request(&card_id, &command_id, "run_x", Urgency::Today, None, None),
        )
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
}

#[test]
fn operators_cannot_request_decisions() {
    let fixture = TestProject::new();
    let (command_id, card_id, run_id) = fixture.start_flow("digest.compile");
    let err = fixture
        .core
        .request_decision(
            &fixture.operator,
            PROJECT,
            decision_request(&card_id, &command_id, &run_id, Urgency::Today, None, None),
        )
        .unwrap_err();
    assert_eq!(err.kind(), "insufficient_permissions");
}

#[test]
fn claim_grants_and_extends_the_lease() {
    let fixture = TestProject::new();
    let (.., decision_id) = fixture.raise_decision(Urgency::Today, None, None);

    let first = fixture
        .core
        .claim_decision(&fixture.operator, PROJECT, &decision_id)
        .unwrap();
    let ClaimOutcome::Claimed { claimed_until } = first else {
        panic!("expected a fresh claim");
    };

    // Re-claiming by the holder extends, not rejects.
    let second = fixture
        .core
        .claim_decision(&fixture.operator, PROJECT, &decision_id)
        .unwrap();
    let ClaimOutcome::Claimed {
        claimed_until: extended,
    } = second
    else {
        panic!("expected the holder to re-claim");
    };
    assert!(extended >= claimed_until);

    let decision = fixture.decision(&decision_id);
    assert_eq!(decision.state, DecisionState::Claimed);
    assert_eq!(decision.claimed_by.as_deref(), Some("op-1"));
}

#[test]
fn contending_claim_reports_the_holder() {
    let fixture = TestProject::new();
    let (.., decision_id) = fixture.raise_decision(Urgency::Today, None, None);
    fixture
        .core
        .add_member(&fixture.owner, PROJECT, "op-2", crate::auth::Role::Operator)
        .unwrap();
    let rival = Identity::new("op-2", "tenant-a");

    fixture
        .core
        .claim_decision(&fixture.operator, PROJECT, &decision_id)
        .unwrap();
    let outcome = fixture
        .core
        .claim_decision(&rival, PROJECT, &decision_id)
        .unwrap();
    match outcome {
        ClaimOutcome::AlreadyClaimed { claimed_by, .. } => assert_eq!(claimed_by, "op-1"),
        ClaimOutcome::Claimed { .. } => panic!("rival must not steal a live lease"),
    }
}

#[test]
fn renew_requires_the_current_holder() {
    let fixture = TestProject::new();
    let (.., decision_id) = fixture.raise_decision(Urgency::Today, None, None);

    // Not claimed yet.
    let err = fixture
        .core
        .renew_claim(&fixture.operator, PROJECT, &decision_id)
        .unwrap_err();
    assert!(matches!(err, CoreError::NotYourClaim));

    fixture
        .core
        .claim_decision(&fixture.operator, PROJECT, &decision_id)
        .unwrap();
    fixture
        .core
        .renew_claim(&fixture.operator, PROJECT, &decision_id)
        .unwrap();

    fixture
        .core
        .add_member(&fixture.owner, PROJECT, "op-2", crate::auth::Role::Operator)
        .unwrap();
    let rival = Identity::new("op-2", "tenant-a");
    let err = fixture
        .core
        .renew_claim(&rival, PROJECT, &decision_id)
        .unwrap_err();
    assert!(matches!(err, CoreError::NotYourClaim));
}

#[test]
fn renew_emits_no_event() {
    let fixture = TestProject::new();
    let (command_id, _, _, decision_id) = fixture.raise_decision(Urgency::Today, None, None);
    fixture
        .core
        .claim_decision(&fixture.operator, PROJECT, &decision_id)
        .unwrap();
    let before = fixture
        .core
        .events_by_correlation(&fixture.scope(), &command_id)
        .unwrap()
        .len();
    fixture
        .core
        .renew_claim(&fixture.operator, PROJECT, &decision_id)
        .unwrap();
    let after = fixture
        .core
        .events_by_correlation(&fixture.scope(), &command_id)
        .unwrap()
        .len();
    assert_eq!(before, after);
}

#[test]
fn render_records_the_selection_and_clears_the_claim() {
    let fixture = TestProject::new();
    let (.., decision_id) = fixture.raise_decision(Urgency::Today, None, None);
    fixture
        .core
        .claim_decision(&fixture.operator, PROJECT, &decision_id)
        .unwrap();
    let outcome = fixture
        .core
        .render_decision(&fixture.operator, PROJECT, &decision_id, "approve", Some("ok"))
        .unwrap();
    assert_eq!(outcome, RenderOutcome::Rendered {
        selected_option: "approve".into(),
    });

    let decision = fixture.decision(&decision_id);
    assert_eq!(decision.state, DecisionState::Rendered);
    assert_eq!(decision.rendered_option.as_deref(), Some("approve"));
    assert_eq!(decision.rendered_by.as_deref(), Some("op-1"));
    assert!(decision.claimed_by.is_none());
    assert!(decision.claimed_until.is_none());
}

#[test]
fn render_wakes_the_suspended_job() {
    let fixture = TestProject::new();
    let (.., decision_id) = fixture.raise_decision(Urgency::Today, None, None);
    fixture.jobs.drain_wakes();
    fixture
        .core
        .render_decision(&fixture.operator, PROJECT, &decision_id, "reject", None)
        .unwrap();
    let wakes = fixture.jobs.drain_wakes();
    assert_eq!(wakes.len(), 1);
    assert_eq!(wakes[0].0, decision_id);
    assert_eq!(wakes[0].1, WakeOutcome::Rendered {
        option: "reject".into(),
    });
}

#[test]
fn second_render_is_rejected_and_recorded() {
    let fixture = TestProject::new();
    let (command_id, _, _, decision_id) = fixture.raise_decision(Urgency::Today, None, None);
    fixture
        .core
        .render_decision(&fixture.operator, PROJECT, &decision_id, "approve", None)
        .unwrap();
    let outcome = fixture
        .core
        .render_decision(&fixture.operator, PROJECT, &decision_id, "reject", None)
        .unwrap();
    match outcome {
        RenderOutcome::Rejected { reason } => {
            assert_eq!(reason, "already resolved (RENDERED)");
        }
        RenderOutcome::Rendered { .. } => panic!("exactly one render may win"),
    }

    let chain = fixture
        .core
        .events_by_correlation(&fixture.scope(), &command_id)
        .unwrap();
    let count = |t: EventType| chain.iter().filter(|e| e.event_type == t).count();
    assert_eq!(count(EventType::DecisionRendered), 1);
    assert_eq!(count(EventType::DecisionRenderRejected), 1);

    // The row still carries the winner.
    let decision = fixture.decision(&decision_id);
    assert_eq!(decision.rendered_option.as_deref(), Some("approve"));
}

#[test]
fn render_by_non_claimant_is_rejected() {
    let fixture = TestProject::new();
    let (.., decision_id) = fixture.raise_decision(Urgency::Today, None, None);
    fixture
        .core
        .add_member(&fixture.owner, PROJECT, "op-2", crate::auth::Role::Operator)
        .unwrap();
    let rival = Identity::new("op-2", "tenant-a");

    fixture
        .core
        .claim_decision(&fixture.operator, PROJECT, &decision_id)
        .unwrap();
    let outcome = fixture
        .core
        .render_decision(&rival, PROJECT, &decision_id, "approve", None)
        .unwrap();
    match outcome {
        RenderOutcome::Rejected { reason } => assert_eq!(reason, "claimed_by_another"),
        RenderOutcome::Rendered { .. } => panic!("claimed decision renders only for its holder"),
    }
}

#[test]
fn unknown_option_is_an_error_not_a_rejection() {
    let fixture = TestProject::new();
    let (.., decision_id) = fixture.raise_decision(Urgency::Today, None, None);
    let err = fixture
        .core
        .render_decision(&fixture.operator, PROJECT, &decision_id, "shrug", None)
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidOption { .. }));
    // No render happened; the decision is still open.
    assert_eq!(fixture.decision(&decision_id).state, DecisionState::Pending);
}

#[test]
fn claim_after_render_is_not_claimable() {
    let fixture = TestProject::new();
    let (.., decision_id) = fixture.raise_decision(Urgency::Today, None, None);
    fixture
        .core
        .render_decision(&fixture.operator, PROJECT, &decision_id, "approve", None)
        .unwrap();
    let err = fixture
        .core
        .claim_decision(&fixture.operator, PROJECT, &decision_id)
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::NotClaimable {
            state: DecisionState::Rendered
        }
    ));
}

#[test]
fn pending_queue_sorts_by_urgency_then_age() {
    let fixture = TestProject::new();
    let (.., d_whenever) = fixture.raise_decision(Urgency::Whenever, None, None);
    let (.., d_now) = fixture.raise_decision(Urgency::Now, None, None);
    let (.., d_today) = fixture.raise_decision(Urgency::Today, None, None);
    let (.., d_now_later) = fixture.raise_decision(Urgency::Now, None, None);

    let queue = fixture
        .core
        .pending_decisions(&fixture.viewer, PROJECT, None)
        .unwrap();
    let ids: Vec<&str> = queue.iter().map(|d| d.decision_id.as_str()).collect();
    assert_eq!(ids, vec![
        d_now.as_str(),
        d_now_later.as_str(),
        d_today.as_str(),
        d_whenever.as_str(),
    ]);

    let only_now = fixture
        .core
        .pending_decisions(&fixture.viewer, PROJECT, Some(Urgency::Now))
        .unwrap();
    assert_eq!(only_now.len(), 2);
}

#[test]
fn detail_assembles_the_context_bundle() {
    let fixture = TestProject::new();
    let (command_id, card_id, run_id) = fixture.start_flow("digest.compile");
    let reported = fixture
        .core
        .report_artifact(&fixture.bot, PROJECT, crate::artifact::ArtifactReport {
            content: "# Digest".into(),
            encoding: crate::artifact::ArtifactEncoding::Utf8,
            media_type: "text/markdown".into(),
            logical_name: "digest.md".into(),
            labels: None,
            command_id: Some(command_id.clone()),
            run_id: Some(run_id.clone()),
            correlation_id: None,
            links: None,
        })
        .unwrap();
    let mut request =
        decision_request(&card_id, &command_id, &run_id, Urgency::Today, None, None);
    request.artifact_refs = Some(vec![reported.artifact_id.clone()]);
    let decision_id = fixture
        .core
        .request_decision(&fixture.bot, PROJECT, request)
        .unwrap();

    let detail = fixture
        .core
        .decision_detail(&fixture.viewer, PROJECT, &decision_id)
        .unwrap()
        .expect("bundle");
    assert_eq!(detail.decision.decision_id, decision_id);
    assert_eq!(
        detail.command_spec.as_ref().map(|s| s.command_type.as_str()),
        Some("digest.compile")
    );
    assert_eq!(detail.artifacts.len(), 1);
    assert_eq!(detail.artifacts[0].logical_name, "digest.md");
    assert!(
        detail
            .events
            .iter()
            .any(|e| e.event_type == EventType::DecisionRequested)
    );

    // Unknown ids resolve to None, same as cross-project ids.
    assert!(
        fixture
            .core
            .decision_detail(&fixture.viewer, PROJECT, "dec_missing")
            .unwrap()
            .is_none()
    );
}

#[test]
fn await_decision_snapshots_the_lifecycle() {
    let fixture = TestProject::new();
    let (.., decision_id) = fixture.raise_decision(Urgency::Today, None, None);

    let snapshot = fixture
        .core
        .await_decision(&fixture.bot, PROJECT, &decision_id)
        .unwrap();
    assert_eq!(snapshot.status, "pending");
    assert!(snapshot.selected_option.is_none());

    fixture
        .core
        .claim_decision(&fixture.operator, PROJECT, &decision_id)
        .unwrap();
    let snapshot = fixture
        .core
        .await_decision(&fixture.bot, PROJECT, &decision_id)
        .unwrap();
    assert_eq!(snapshot.status, "claimed");

    fixture
        .core
        .render_decision(&fixture.operator, PROJECT, &decision_id, "approve", None)
        .unwrap();
    let snapshot = fixture
        .core
        .await_decision(&fixture.bot, PROJECT, &decision_id)
        .unwrap();
    assert_eq!(snapshot.status, "rendered");
    assert_eq!(snapshot.selected_option.as_deref(), Some("approve"));
    assert_eq!(snapshot.rendered_by.as_deref(), Some("op-1"));
}

#[test]
fn bots_cannot_claim_or_render() {
    let fixture = TestProject::new();
    let (.., decision_id) = fixture.raise_decision(Urgency::Today, None, None);
    let err = fixture
        .core
        .claim_decision(&fixture.bot, PROJECT, &decision_id)
        .unwrap_err();
    assert_eq!(err.kind(), "insufficient_permissions");
    let err = fixture
        .core
        .render_decision(&fixture.bot, PROJECT, &decision_id, "approve", None)
        .unwrap_err();
    assert_eq!(err.kind(), "insufficient_permissions");
}
