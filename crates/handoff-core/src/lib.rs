//! # handoff-core
//!
//! Coordination kernel for bot workflows that occasionally block on a human
//! decision.
//!
//! Bots enqueue commands, report artifacts, and request decisions; human
//! operators claim and render those decisions; a periodic sweeper enforces
//! liveness (retry release, decision expiration, claim reclamation, load
//! shedding). Every state-changing fact is appended to an event ledger whose
//! inline projections form the live read models.
//!
//! ## Architecture
//!
//! ```text
//! bots ---> admission ---> ledger (append-only) ---> projectors ---> read models
//!                             ^                                        |
//! operators -> decisions -----+                                        v
//!                             ^                                    queries
//! sweeper --------------------+
//! ```
//!
//! - **Ledger**: the sole write path. Appends are idempotency-keyed, scanned
//!   for secret patterns, and projected into the read models in the same
//!   transaction.
//! - **Cards**: the work-item state machine (`READY` → `RUNNING` →
//!   `NEEDS_DECISION`/`RETRY_SCHEDULED`/`DONE`/`FAILED`) with a closed edge
//!   table.
//! - **Decisions**: compare-and-set rendering with an advisory claim lease;
//!   exactly one `DecisionRendered` event per decision, ever.
//! - **Sweeper**: the periodic control loop that guarantees progress under
//!   failure, expiry, and backlog pressure.
//!
//! ## Example
//!
//! ```rust,no_run
//! use handoff_core::auth::Identity;
//! use handoff_core::command::CommandSpec;
//! use handoff_core::{Core, CoreConfig, Store};
//!
//! # fn example() -> Result<(), handoff_core::CoreError> {
//! let core = Core::new(Store::in_memory()?, CoreConfig::default());
//!
//! let owner = Identity::new("user-ada", "tenant-a");
//! core.init_project(&owner, "proj-digest", "Daily digest")?;
//!
//! let admitted = core.request_command(
//!     &owner,
//!     "proj-digest",
//!     handoff_core::command::CommandRequest {
//!         spec: CommandSpec::new("digest.compile"),
//!         title: "Compile the daily digest".into(),
//!         correlation_id: None,
//!         capabilities: None,
//!         idempotency_key: None,
//!     },
//! )?;
//! println!("card {} is READY", admitted.card_id);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod artifact;
pub mod auth;
pub mod bot;
pub mod card;
pub mod command;
mod config;
mod core;
pub mod decision;
mod error;
pub mod events;
pub mod ids;
pub mod jobs;
pub mod ledger;
pub mod projection;
pub mod replay;
pub mod run;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod testutil;

pub use self::core::Core;
pub use config::CoreConfig;
pub use error::CoreError;
pub use events::{Event, EventType, Producer, Scope};
pub use ledger::Store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::artifact::{ArtifactEncoding, ArtifactReport, BlobStore};
    pub use crate::auth::{Identity, Role};
    pub use crate::bot::BotSession;
    pub use crate::card::CardState;
    pub use crate::command::{CommandRequest, CommandSpec};
    pub use crate::decision::{ClaimOutcome, DecisionRequest, RenderOutcome, Urgency};
    pub use crate::{Core, CoreConfig, CoreError, Scope, Store};
}
