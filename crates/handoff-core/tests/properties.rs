//! Property-based invariants over the kernel.

mod common;

use std::collections::HashMap;

use common::{Fixture, PROJECT, now_ms};
use handoff_core::EventType;
use handoff_core::auth::{Identity, Role};
use handoff_core::card::{CardState, TransitionRequest};
use handoff_core::command::{CommandRequest, CommandSpec};
use handoff_core::decision::{RenderOutcome, Urgency};
use handoff_core::ledger::TsRange;
use handoff_core::replay::ReadModel;
use proptest::prelude::*;

fn admit_keyed(fx: &Fixture, key: &str) -> (String, String, bool) {
    let admitted = fx
        .core
        .request_command(&fx.bot, PROJECT, CommandRequest {
            spec: CommandSpec::new("digest.compile"),
            title: "keyed admission".into(),
            correlation_id: None,
            capabilities: None,
            idempotency_key: Some(key.to_string()),
        })
        .unwrap();
    (admitted.command_id, admitted.card_id, admitted.deduplicated)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 16,
        ..ProptestConfig::default()
    })]

    /// Idempotency keys map injectively onto admissions: a repeated key
    /// always yields the original ids and never a second CommandRequested.
    #[test]
    fn idempotency_keys_are_injective(key_picks in prop::collection::vec(0u8..6, 1..24)) {
        let fx = Fixture::new();
        let mut first_admission: HashMap<String, (String, String)> = HashMap::new();

        for pick in &key_picks {
            let key = format!("key-{pick}");
            let (command_id, card_id, deduplicated) = admit_keyed(&fx, &key);
            match first_admission.get(&key) {
                None => {
                    prop_assert!(!deduplicated);
                    first_admission.insert(key, (command_id, card_id));
                }
                Some((original_command, original_card)) => {
                    prop_assert!(deduplicated);
                    prop_assert_eq!(&command_id, original_command);
                    prop_assert_eq!(&card_id, original_card);
                }
            }
        }

        let requested = fx
            .core
            .events_by_type(common::TENANT, EventType::CommandRequested, TsRange::default(), 1000)
            .unwrap();
        prop_assert_eq!(requested.len(), first_admission.len());

        let mut seen_keys = HashMap::new();
        for event in &requested {
            let key = event.idempotency_key.clone().unwrap();
            prop_assert!(seen_keys.insert(key, event.event_id.clone()).is_none());
        }
    }

    /// Any sequence of render attempts produces at most one DecisionRendered
    /// event; every further attempt is a recorded rejection.
    #[test]
    fn exactly_one_render_ever_wins(
        attempts in prop::collection::vec((0usize..2, 0usize..3), 1..12),
    ) {
        let fx = Fixture::new();
        fx.core
            .add_member(&fx.owner, PROJECT, "op-second", Role::Operator)
            .unwrap();
        let rival = Identity::new("op-second", common::TENANT);
        let (command_id, _, _, decision_id) = fx.raise(Urgency::Today, None, None);
        let options = ["approve", "edit", "reject"];

        let mut wins = 0usize;
        for (who, option) in &attempts {
            let operator = if *who == 0 { &fx.operator } else { &rival };
            let outcome = fx
                .core
                .render_decision(operator, PROJECT, &decision_id, options[*option], None)
                .unwrap();
            if matches!(outcome, RenderOutcome::Rendered { .. }) {
                wins += 1;
            }
        }
        prop_assert_eq!(wins, 1, "the first attempt wins, all others lose");

        let chain = fx.core.events_by_correlation(&fx.scope(), &command_id).unwrap();
        let rendered = chain.iter().filter(|e| e.event_type == EventType::DecisionRendered).count();
        let rejected = chain
            .iter()
            .filter(|e| e.event_type == EventType::DecisionRenderRejected)
            .count();
        prop_assert_eq!(rendered, 1);
        prop_assert_eq!(rejected, attempts.len() - 1);
    }

    /// A random walk over transition attempts never leaves the closed edge
    /// table, never escapes a terminal state, and keeps `attempt` equal to
    /// the number of entries into RUNNING.
    #[test]
    fn card_walk_respects_the_table(targets in prop::collection::vec(0usize..6, 0..16)) {
        let fx = Fixture::new();
        let (_, card_id) = fx.admit_with(None, None);
        let scope = fx.scope();
        let states = [
            CardState::Ready,
            CardState::Running,
            CardState::NeedsDecision,
            CardState::RetryScheduled,
            CardState::Done,
            CardState::Failed,
        ];

        let mut expected_state = CardState::Ready;
        let mut expected_attempts = 0u32;
        for target_idx in targets {
            let to = states[target_idx];
            let mut request = TransitionRequest::new(to, "walk");
            if to == CardState::RetryScheduled {
                request.retry_at_ts = Some(now_ms() + 60_000);
            }
            match fx.core.transition_card(&scope, &card_id, request) {
                Ok(card) => {
                    prop_assert!(expected_state.can_transition_to(to));
                    expected_state = to;
                    if to == CardState::Running {
                        expected_attempts += 1;
                    }
                    prop_assert_eq!(card.state, expected_state);
                    prop_assert_eq!(card.attempt, expected_attempts);
                    prop_assert_eq!(card.retry_at_ts.is_some(), to == CardState::RetryScheduled);
                }
                Err(handoff_core::CoreError::InvalidTransition { .. }) => {
                    prop_assert!(!expected_state.can_transition_to(to));
                }
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
        }

        let card = fx.core.get_card(&fx.bot, PROJECT, &card_id).unwrap();
        prop_assert_eq!(card.state, expected_state);
        let chain = fx.core.events_by_correlation(&scope, &card.command_id).unwrap();
        let running_entries = chain
            .iter()
            .filter(|e| {
                e.event_type == EventType::CardTransitioned && e.payload["to"] == "RUNNING"
            })
            .count();
        prop_assert_eq!(u32::try_from(running_entries).unwrap(), card.attempt);
    }

    /// Replaying the log into truncated read models reproduces exactly the
    /// rows live projection built, for any interleaving of operations.
    #[test]
    fn replay_reproduces_live_state(script in prop::collection::vec(0u8..8, 0..24)) {
        let fx = Fixture::new();
        let scope = fx.scope();
        let mut flows: Vec<(String, String, Option<String>, Option<String>)> = Vec::new();

        for op in script {
            match op {
                0 => {
                    let (command_id, card_id) = fx.admit_with(None, None);
                    flows.push((command_id, card_id, None, None));
                }
                1 => {
                    if let Some(flow) = flows.iter_mut().find(|f| {
                        f.2.is_none()
                            && fx.core.get_card(&fx.bot, PROJECT, &f.1).unwrap().state
                                == CardState::Ready
                    }) {
                        let run_id = fx
                            .core
                            .start_command(&scope, &flow.0, &flow.1, None, None)
                            .unwrap();
                        flow.2 = Some(run_id);
                    }
                }
                2 | 3 => {
                    if let Some(flow) = flows.iter().find(|f| {
                        f.2.is_some()
                            && fx.core.get_card(&fx.bot, PROJECT, &f.1).unwrap().state
                                == CardState::Running
                    }) {
                        let run_id = flow.2.as_ref().unwrap();
                        if op == 2 {
                            fx.core
                                .succeed_command(&scope, &flow.0, &flow.1, run_id, None, None)
                                .unwrap();
                        } else {
                            fx.core
                                .fail_command(&scope, &flow.0, &flow.1, run_id, "boom", false, None)
                                .unwrap();
                        }
                    }
                }
                4 => {
                    if let Some(flow) = flows.iter_mut().find(|f| {
                        f.3.is_none()
                            && f.2.is_some()
                            && fx.core.get_card(&fx.bot, PROJECT, &f.1).unwrap().state
                                == CardState::Running
                    }) {
                        let run_id = flow.2.clone().unwrap();
                        let request = fx.decision_request(
                            &flow.1,
                            &flow.0,
                            &run_id,
                            Urgency::Today,
                            None,
                            Some("reject"),
                        );
                        flow.3 = Some(
                            fx.core.request_decision(&fx.bot, PROJECT, request).unwrap(),
                        );
                    }
                }
                5 => {
                    if let Some(decision_id) = flows.iter().filter_map(|f| f.3.clone()).find(|d| {
                        fx.core.await_decision(&fx.bot, PROJECT, d).unwrap().status == "pending"
                    }) {
                        fx.core
                            .claim_decision(&fx.operator, PROJECT, &decision_id)
                            .unwrap();
                    }
                }
                6 => {
                    if let Some(decision_id) = flows.iter().filter_map(|f| f.3.clone()).find(|d| {
                        let status =
                            fx.core.await_decision(&fx.bot, PROJECT, d).unwrap().status;
                        status == "pending" || status == "claimed"
                    }) {
                        fx.core
                            .render_decision(&fx.operator, PROJECT, &decision_id, "approve", None)
                            .unwrap();
                    }
                }
                _ => {
                    fx.core.sweep(Some(now_ms() + 10 * 60 * 1000)).unwrap();
                }
            }
        }

        // Snapshot the live rows through the public surface.
        let live: Vec<serde_json::Value> = flows
            .iter()
            .map(|f| snapshot_flow(&fx, f))
            .collect::<Vec<_>>();

        for model in [
            ReadModel::Commands,
            ReadModel::Runs,
            ReadModel::Cards,
            ReadModel::Decisions,
            ReadModel::Artifacts,
        ] {
            fx.core.rebuild_model(&scope, model).unwrap();
        }

        let rebuilt: Vec<serde_json::Value> = flows
            .iter()
            .map(|f| snapshot_flow(&fx, f))
            .collect::<Vec<_>>();
        prop_assert_eq!(live, rebuilt);
    }
}

/// Serializes everything publicly visible about one flow.
fn snapshot_flow(
    fx: &Fixture,
    flow: &(String, String, Option<String>, Option<String>),
) -> serde_json::Value {
    let command = fx.core.get_command(&fx.bot, PROJECT, &flow.0).unwrap();
    let card = fx.core.get_card(&fx.bot, PROJECT, &flow.1).unwrap();
    let runs = fx.core.runs_for_command(&fx.bot, PROJECT, &flow.0).unwrap();
    let decision = flow.3.as_ref().map(|d| {
        fx.core
            .decision_detail(&fx.bot, PROJECT, d)
            .unwrap()
            .expect("decision exists")
            .decision
    });
    serde_json::json!({
        "command": command,
        "card": card,
        "runs": runs,
        "decision": decision,
    })
}
