//! The kernel facade.

use std::sync::Arc;

use rusqlite::Transaction;

use crate::artifact::{BlobStore, InMemoryBlobStore};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::events::{Event, EventType, Producer, Scope};
use crate::jobs::{JobQueue, NoopJobQueue};
use crate::ledger::{self, Append, Store, TsRange};
use crate::projection::ProjectionMode;

/// The coordination kernel.
///
/// Owns the store and the external seams (blob store, job primitive) and
/// exposes the operations surface: admission, artifacts, decisions,
/// membership, the card transition primitive, the sweeper, and replay.
/// Operation groups live in their respective modules; this type is the
/// single handle.
pub struct Core {
    store: Store,
    config: CoreConfig,
    blobs: Arc<dyn BlobStore>,
    jobs: Arc<dyn JobQueue>,
    producer: Producer,
}

impl Core {
    /// Creates a kernel over a store with a no-op job queue and an in-memory
    /// blob store. Swap the seams with [`with_job_queue`](Self::with_job_queue)
    /// and [`with_blob_store`](Self::with_blob_store).
    #[must_use]
    pub fn new(store: Store, config: CoreConfig) -> Self {
        Self {
            store,
            config,
            blobs: Arc::new(InMemoryBlobStore::new()),
            jobs: Arc::new(NoopJobQueue),
            producer: Producer::kernel(),
        }
    }

    /// Replaces the blob store seam.
    #[must_use]
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = blobs;
        self
    }

    /// Replaces the job-primitive seam.
    #[must_use]
    pub fn with_job_queue(mut self, jobs: Arc<dyn JobQueue>) -> Self {
        self.jobs = jobs;
        self
    }

    /// The kernel configuration.
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    pub(crate) fn jobs(&self) -> &dyn JobQueue {
        self.jobs.as_ref()
    }

    pub(crate) fn producer(&self) -> Producer {
        self.producer.clone()
    }

    /// Current wall-clock time in ms since the Unix epoch.
    pub(crate) fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Builds an event with this kernel's producer identity.
    pub(crate) fn event(
        &self,
        scope: &Scope,
        event_type: EventType,
        correlation_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Event {
        Event::new(scope, event_type, correlation_id, payload, self.producer())
    }

    /// Appends an event on the live write path (projectors + effects).
    pub(crate) fn append_live(
        &self,
        tx: &Transaction<'_>,
        event: &Event,
    ) -> Result<Append, CoreError> {
        ledger::append(tx, event, &ProjectionMode::Live {
            jobs: self.jobs.as_ref(),
        })
    }

    /// Reads the event chain for a correlation id, oldest first.
    ///
    /// System-facing read; the guarded operator surface goes through
    /// [`decision_detail`](Self::decision_detail).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn events_by_correlation(
        &self,
        scope: &Scope,
        correlation_id: &str,
    ) -> Result<Vec<Event>, CoreError> {
        self.store
            .with_conn(|conn| ledger::by_correlation(conn, &scope.project_id, correlation_id))
    }

    /// Reads events of one type across the tenant's projects, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn events_by_type(
        &self,
        tenant_id: &str,
        event_type: EventType,
        range: TsRange,
        limit: u32,
    ) -> Result<Vec<Event>, CoreError> {
        self.store
            .with_conn(|conn| ledger::by_type(conn, tenant_id, event_type, range, limit))
    }

    /// Reads a replay batch with the composite `(ts, event_id)` cursor.
    ///
    /// Events at `since_ts` with `event_id <= after_event_id` are excluded
    /// when the cursor is present; ordering is `(ts ASC, event_id ASC)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn events_by_ts_range(
        &self,
        scope: &Scope,
        since_ts: i64,
        until_ts: Option<i64>,
        after_event_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Event>, CoreError> {
        self.store.with_conn(|conn| {
            ledger::by_ts_range(
                conn,
                &scope.project_id,
                since_ts,
                until_ts,
                after_event_id,
                limit,
            )
        })
    }
}
