//! Identifier minting.
//!
//! All entity identifiers are prefixed ULIDs: timestamp-prefixed,
//! random-suffixed, and lexicographically sortable, so ordering by id
//! approximates ordering by creation time and tie-breaks equal timestamps.
//!
//! Event ids are additionally *monotonic within the process*: two events
//! minted in the same millisecond still sort in mint order. The composite
//! `(ts, event_id)` replay cursor relies on this.

use std::sync::{LazyLock, Mutex};

use ulid::{Generator, Ulid};

static MONOTONIC: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

fn next_ulid() -> Ulid {
    let mut generator = MONOTONIC.lock().expect("ulid generator mutex poisoned");
    // Generation only fails when the per-millisecond random space overflows;
    // a fresh random ULID keeps ids unique at the cost of monotonicity.
    generator.generate().unwrap_or_else(|_| Ulid::new())
}

/// Mints an event id (`evt_` prefix).
#[must_use]
pub fn event_id() -> String {
    format!("evt_{}", next_ulid())
}

/// Mints a command id (`cmd_` prefix).
#[must_use]
pub fn command_id() -> String {
    format!("cmd_{}", next_ulid())
}

/// Mints a card id (`card_` prefix).
#[must_use]
pub fn card_id() -> String {
    format!("card_{}", next_ulid())
}

/// Mints a run id (`run_` prefix).
#[must_use]
pub fn run_id() -> String {
    format!("run_{}", next_ulid())
}

/// Mints a decision id (`dec_` prefix).
#[must_use]
pub fn decision_id() -> String {
    format!("dec_{}", next_ulid())
}

/// Mints an artifact id (`art_` prefix).
#[must_use]
pub fn artifact_id() -> String {
    format!("art_{}", next_ulid())
}

/// Extracts the millisecond timestamp embedded in a prefixed ULID id.
///
/// Returns `None` when the id has no `_` separator or the suffix is not a
/// valid ULID.
#[must_use]
pub fn embedded_timestamp_ms(id: &str) -> Option<i64> {
    let (_, suffix) = id.split_once('_')?;
    let ulid = Ulid::from_string(suffix).ok()?;
    i64::try_from(ulid.timestamp_ms()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        assert!(event_id().starts_with("evt_"));
        assert!(command_id().starts_with("cmd_"));
        assert!(card_id().starts_with("card_"));
        assert!(run_id().starts_with("run_"));
        assert!(decision_id().starts_with("dec_"));
        assert!(artifact_id().starts_with("art_"));
    }

    #[test]
    fn event_ids_sort_in_mint_order() {
        let ids: Vec<String> = (0..64).map(|_| event_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted, "same-millisecond ids must stay monotonic");
    }

    #[test]
    fn embedded_timestamp_is_recent() {
        let id = event_id();
        let ts = embedded_timestamp_ms(&id).expect("valid ulid suffix");
        let now = chrono::Utc::now().timestamp_millis();
        assert!((now - ts).abs() < 5_000);
    }

    #[test]
    fn embedded_timestamp_rejects_garbage() {
        assert!(embedded_timestamp_ms("not-an-id").is_none());
        assert!(embedded_timestamp_ms("evt_zzz").is_none());
    }
}
