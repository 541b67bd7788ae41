//! Append-only event ledger backed by `SQLite`.
//!
//! The ledger is the sole write path for state. One append primitive and
//! three read primitives:
//!
//! - **Append**: scan for secret patterns, apply the idempotency key, insert,
//!   and project into the read models — all in the caller's transaction.
//! - **`by_correlation`**: the chronologically ordered chain for one
//!   correlation id.
//! - **`by_type`**: cross-project within a tenant, optionally time-bounded.
//! - **`by_ts_range`**: the replay cursor, ordered `(ts ASC, event_id ASC)`
//!   with composite-cursor exclusion.
//!
//! `SQLite` runs in WAL mode behind a single serialized connection; that is
//! the "serializable, per-row transactional writes" primitive the
//! concurrency model assumes. Appends are serialized by the unique indexes
//! on `event_id` and `idempotency_key`: a second writer observes the first
//! writer's row and returns its id.

mod store;

#[cfg(test)]
mod tests;

pub use store::{Append, LedgerError, Store, TsRange};
pub(crate) use store::{append, by_correlation, by_ts_range, by_type};
