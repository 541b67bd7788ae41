//! Kernel configuration.

use serde::{Deserialize, Serialize};

/// Milliseconds in one minute.
const MINUTE_MS: i64 = 60 * 1000;

/// Tunable parameters for the coordination kernel.
///
/// `Default` carries the operational defaults: claim TTL 5 minutes, sweep
/// interval 2 minutes, defer threshold 2, emergency threshold 5, load-shed
/// deferral 24 hours, command timeout 10 minutes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// How long a decision claim lease lasts before it can be reclaimed.
    pub claim_ttl_ms: i64,

    /// Interval at which the external scheduler is expected to invoke
    /// [`Core::sweep`](crate::Core::sweep). Informational for drivers; the
    /// kernel itself never sleeps.
    pub sweep_interval_ms: i64,

    /// Number of `now`-urgency decisions in a project's backlog above which
    /// the sweeper starts deferring `whenever`-urgency decisions.
    pub defer_threshold: u32,

    /// Backlog size above which the sweeper emits an `SloBreached` event for
    /// external alerting.
    pub emergency_threshold: u32,

    /// How far `expires_at` is pushed out when a `whenever` decision without
    /// a fallback is deferred under load.
    pub load_shed_deferral_ms: i64,

    /// Per-command execution timeout enforced by the external job primitive.
    pub command_timeout_ms: i64,

    /// Base delay before a failed command's first retry; doubles per attempt.
    pub retry_backoff_base_ms: i64,

    /// Upper bound on the retry backoff.
    pub retry_backoff_cap_ms: i64,

    /// Number of events the replay engine applies per batch.
    pub replay_batch_size: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            claim_ttl_ms: 5 * MINUTE_MS,
            sweep_interval_ms: 2 * MINUTE_MS,
            defer_threshold: 2,
            emergency_threshold: 5,
            load_shed_deferral_ms: 24 * 60 * MINUTE_MS,
            command_timeout_ms: 10 * MINUTE_MS,
            retry_backoff_base_ms: MINUTE_MS,
            retry_backoff_cap_ms: 60 * MINUTE_MS,
            replay_batch_size: 100,
        }
    }
}

impl CoreConfig {
    /// Computes the retry delay for a given (1-based) attempt number.
    ///
    /// Exponential: `base * 2^(attempt-1)`, capped at
    /// [`retry_backoff_cap_ms`](Self::retry_backoff_cap_ms).
    #[must_use]
    pub fn retry_backoff_ms(&self, attempt: u32) -> i64 {
        let shift = attempt.saturating_sub(1).min(16);
        self.retry_backoff_base_ms
            .saturating_mul(1_i64 << shift)
            .min(self.retry_backoff_cap_ms)
    }
}
