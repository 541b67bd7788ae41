//! Kernel error taxonomy.
//!
//! Every error surfaces with a stable discriminator (see [`CoreError::kind`])
//! and a human-readable message. Contention signals that the UI must be able
//! to observe (`already_claimed`, render rejection) are *not* errors; they
//! are structured outcomes on the decision operations.

use thiserror::Error;

use crate::artifact::BlobError;
use crate::auth::Role;
use crate::decision::DecisionState;
use crate::ledger::LedgerError;

/// Errors surfaced by the kernel's public operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// No caller identity on the call.
    #[error("unauthenticated: no caller identity")]
    Unauthenticated,

    /// The caller exists but is not a member of the project.
    #[error("user {user_id} is not a member of project {project_id}")]
    NotAMember {
        /// The caller's user id.
        user_id: String,
        /// The project that was addressed.
        project_id: String,
    },

    /// The caller's role does not permit the operation.
    #[error("role {actual} lacks permission (requires one of {required:?})")]
    InsufficientPermissions {
        /// Roles that would have been accepted.
        required: Vec<Role>,
        /// The caller's actual role.
        actual: Role,
    },

    /// Entity absent, or present under a different project (cross-project
    /// lookups are reported as absent to avoid oracle leakage).
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind ("command", "card", "decision", "artifact", "run").
        kind: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// The card edge is not in the transition table.
    #[error("invalid card transition {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Decision options failed validation.
    #[error("invalid decision options: {detail}")]
    InvalidOptions {
        /// What was wrong with the option list.
        detail: String,
    },

    /// The fallback option does not match any option key.
    #[error("fallback option {fallback:?} is not among the option keys")]
    InvalidFallback {
        /// The offending fallback key.
        fallback: String,
    },

    /// The rendered option key is not among the decision's options.
    #[error("option {option_key:?} is not among the decision's options")]
    InvalidOption {
        /// The offending option key.
        option_key: String,
    },

    /// The decision is not in a claimable state.
    #[error("decision is not claimable in state {state}")]
    NotClaimable {
        /// The decision's current state.
        state: DecisionState,
    },

    /// Claim renewal by someone other than the current claimant, or on a
    /// decision that is not claimed.
    #[error("claim is not held by the caller")]
    NotYourClaim,

    /// The project already exists.
    #[error("project already exists: {project_id}")]
    ProjectExists {
        /// The duplicate project id.
        project_id: String,
    },

    /// The user is already a member of the project.
    #[error("user {user_id} is already a member")]
    DuplicateMember {
        /// The duplicate member's user id.
        user_id: String,
    },

    /// Removing this member would leave the project without an owner.
    #[error("cannot remove the last owner of a project")]
    CannotRemoveLastOwner,

    /// Artifact payload could not be decoded with the declared encoding.
    #[error("invalid artifact encoding: {detail}")]
    InvalidEncoding {
        /// Decoder detail.
        detail: String,
    },

    /// Error from the event ledger (includes secret-pattern rejection).
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Error from the NDJSON event archive.
    #[error(transparent)]
    Archive(#[from] crate::replay::ArchiveError),

    /// Error from the blob store.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// Underlying database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON (de)serialization error on a read-model column or payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Stable machine-readable discriminator for this error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::NotAMember { .. } => "not_a_member",
            Self::InsufficientPermissions { .. } => "insufficient_permissions",
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidOptions { .. } => "invalid_options",
            Self::InvalidFallback { .. } => "invalid_fallback",
            Self::InvalidOption { .. } => "invalid_option",
            Self::NotClaimable { .. } => "not_claimable",
            Self::NotYourClaim => "not_your_claim",
            Self::ProjectExists { .. } => "project_exists",
            Self::DuplicateMember { .. } => "duplicate_member",
            Self::CannotRemoveLastOwner => "cannot_remove_last_owner",
            Self::InvalidEncoding { .. } => "invalid_encoding",
            Self::Ledger(LedgerError::SecretInPayload { .. }) => "secret_in_payload",
            Self::Ledger(_) => "ledger",
            Self::Archive(_) => "archive",
            Self::Blob(_) => "blob",
            Self::Database(_) => "database",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Shorthand for a [`CoreError::NotFound`].
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}
