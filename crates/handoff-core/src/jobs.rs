//! Background-job primitive seam.
//!
//! The kernel never schedules work itself; it hands named jobs to an external
//! primitive that guarantees at-least-once execution and bounds concurrency
//! per named pool. The decision pause/resume pattern rides the same seam: a
//! suspended job waits on a signal keyed by decision id, and the render or
//! expiry path sends the wake.
//!
//! Two implementations ship with the crate: [`NoopJobQueue`] (embedded
//! read-only use) and [`InMemoryJobQueue`] (tests and single-process
//! drivers, which poll the recorded queue).

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named job handed to the external primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Job name (e.g. `"card.dispatch"`).
    pub name: String,
    /// Named pool bounding concurrency (maps to the card's
    /// `concurrency_key`, falling back to the project id).
    pub pool: String,
    /// Job parameters.
    pub payload: Value,
}

/// The outcome delivered with a decision wake signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum WakeOutcome {
    /// The decision was rendered (interactively or via fallback).
    Rendered {
        /// The selected option key.
        option: String,
    },
    /// The decision expired without a fallback.
    Expired {
        /// The fallback that would have applied, if any.
        fallback: Option<String>,
    },
}

/// The background-job primitive the kernel delegates scheduling to.
///
/// Implementations must tolerate duplicate enqueues (at-least-once) and
/// wakes for unknown signals (a job may have resumed by polling already).
pub trait JobQueue: Send + Sync {
    /// Enqueues a named job into its pool.
    fn enqueue(&self, job: JobRequest);

    /// Wakes a job suspended on `signal` (a decision id), delivering the
    /// outcome it was waiting for.
    fn wake(&self, signal: &str, outcome: WakeOutcome);
}

/// A job queue that drops everything. For embedded read-only use.
#[derive(Debug, Default)]
pub struct NoopJobQueue;

impl JobQueue for NoopJobQueue {
    fn enqueue(&self, _job: JobRequest) {}

    fn wake(&self, _signal: &str, _outcome: WakeOutcome) {}
}

/// A recording job queue for tests and single-process drivers.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    enqueued: Mutex<Vec<JobRequest>>,
    wakes: Mutex<Vec<(String, WakeOutcome)>>,
}

impl InMemoryJobQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains and returns all enqueued jobs.
    #[must_use]
    pub fn drain_jobs(&self) -> Vec<JobRequest> {
        std::mem::take(&mut *self.enqueued.lock().expect("job queue mutex poisoned"))
    }

    /// Drains and returns all delivered wakes.
    #[must_use]
    pub fn drain_wakes(&self) -> Vec<(String, WakeOutcome)> {
        std::mem::take(&mut *self.wakes.lock().expect("job queue mutex poisoned"))
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: JobRequest) {
        self.enqueued
            .lock()
            .expect("job queue mutex poisoned")
            .push(job);
    }

    fn wake(&self, signal: &str, outcome: WakeOutcome) {
        self.wakes
            .lock()
            .expect("job queue mutex poisoned")
            .push((signal.to_string(), outcome));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn in_memory_queue_records_and_drains() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(JobRequest {
            name: "card.dispatch".into(),
            pool: "proj-1".into(),
            payload: json!({"card_id": "card_1"}),
        });
        queue.wake("dec_1", WakeOutcome::Rendered {
            option: "approve".into(),
        });

        let jobs = queue.drain_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "card.dispatch");
        assert!(queue.drain_jobs().is_empty());

        let wakes = queue.drain_wakes();
        assert_eq!(wakes.len(), 1);
        assert_eq!(wakes[0].0, "dec_1");
    }
}
