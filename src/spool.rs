//! Durable spool abstractions and backends.
//!
//! The spool is the sole owner of envelope content. A record is written to
//! it before `publish` returns, and it stays there through every delivery
//! attempt until it reaches a terminal state. After a crash, everything that
//! is not known to be delivered is replayed from it.
//!
//! ## Components
//!
//! - [`SpoolStore`]: the storage contract used by the publisher
//! - [`SpoolRecord`]: an envelope plus its bookkeeping as stored
//! - [`RetentionPolicy`]: how long delivered records are kept
//!
//! Backends live in [`fs`] (durable, one file per record) and [`inmemory`]
//! (volatile, for tests and local pipelines).

pub mod fs;
pub mod inmemory;
pub mod sweeper;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

use crate::envelope::{DeliveryState, Envelope, EnvelopeId};

pub use fs::FileSpool;
pub use inmemory::InMemorySpool;
pub use sweeper::RetentionSweeper;

/// Storage contract for the spool.
///
/// Implementations must make `persist` durable before returning `Ok`, must
/// never hand back a torn record as valid, and must refuse transitions out of
/// a terminal state.
#[async_trait::async_trait]
pub trait SpoolStore: Send + Sync + 'static {
    /// Durably write a new record.
    async fn persist(&self, envelope: &Envelope) -> Result<(), SpoolError>;

    /// Move a `Pending` record to `InFlight`, counting the attempt.
    ///
    /// Returns the updated envelope, or `None` when the record is not
    /// `Pending` (already in flight or terminal).
    async fn mark_in_flight(&self, id: EnvelopeId) -> Result<Option<Envelope>, SpoolError>;

    /// Return an `InFlight` record to `Pending` after a failed attempt.
    async fn mark_pending(&self, id: EnvelopeId) -> Result<(), SpoolError>;

    /// Move a record to `Delivered`. Marking a delivered record again is a
    /// no-op.
    async fn mark_delivered(&self, id: EnvelopeId) -> Result<(), SpoolError>;

    /// Move a record to `Failed`, keeping `reason` for operators.
    async fn mark_failed(&self, id: EnvelopeId, reason: &str) -> Result<(), SpoolError>;

    /// All `Pending` and `InFlight` records, ordered by creation time, with
    /// `InFlight` downgraded to `Pending`.
    async fn load_pending(&self) -> Result<Vec<Envelope>, SpoolError>;

    /// `Pending` records in replay order, read without changing anything.
    ///
    /// Used while running to pick up records written by other processes.
    async fn pending(&self) -> Result<Vec<Envelope>, SpoolError>;

    /// Remove `Delivered` records older than the policy horizon. Returns the
    /// number of records removed. `Failed` records are never touched.
    async fn retention_sweep(&self, policy: &RetentionPolicy) -> Result<usize, SpoolError>;

    /// Look up a single record.
    async fn get(&self, id: EnvelopeId) -> Result<Option<SpoolRecord>, SpoolError>;

    /// Every `Failed` record, oldest first.
    async fn failed(&self) -> Result<Vec<SpoolRecord>, SpoolError>;

    /// Delete a `Failed` record on operator request. Returns `false` if the
    /// record is not in the `Failed` state.
    async fn purge_failed(&self, id: EnvelopeId) -> Result<bool, SpoolError>;

    /// Record counts per state.
    async fn stats(&self) -> Result<SpoolStats, SpoolError>;
}

/// An envelope as stored in the spool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolRecord {
    pub envelope: Envelope,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SpoolRecord {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            updated_at: envelope.created_at(),
            envelope,
            failure_reason: None,
        }
    }

    pub(crate) fn apply(&mut self, next: DeliveryState, reason: Option<&str>) -> Transition {
        let current = self.envelope.state();
        if current == next && current.is_terminal() {
            return Transition::Unchanged;
        }
        if !current.can_transition_to(next) {
            return Transition::Refused(current);
        }

        if next == DeliveryState::InFlight {
            self.envelope.record_attempt();
        }
        if next == DeliveryState::Failed {
            self.failure_reason = reason.map(str::to_owned);
        }
        self.envelope.set_state(next);
        self.updated_at = Utc::now();
        Transition::Applied
    }

    /// Prepare a record read back at startup for replay.
    pub(crate) fn recover(&mut self) -> bool {
        match self.envelope.state() {
            DeliveryState::Pending => true,
            DeliveryState::InFlight => {
                self.envelope.set_state(DeliveryState::Pending);
                true
            }
            DeliveryState::Delivered | DeliveryState::Failed => false,
        }
    }
}

/// Result of applying a state change to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Applied,
    Unchanged,
    Refused(DeliveryState),
}

/// Retention rules applied by [`SpoolStore::retention_sweep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Delivered records last updated longer ago than this are removed.
    pub delivered_horizon: Duration,
}

impl RetentionPolicy {
    pub fn new(delivered_horizon: Duration) -> Self {
        Self { delivered_horizon }
    }

    pub(crate) fn expired(&self, record: &SpoolRecord, now: DateTime<Utc>) -> bool {
        let horizon = chrono::Duration::from_std(self.delivered_horizon)
            .unwrap_or(chrono::Duration::MAX);
        record.envelope.state() == DeliveryState::Delivered
            && now.signed_duration_since(record.updated_at) > horizon
    }
}

/// Number of spool records in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpoolStats {
    pub pending: usize,
    pub in_flight: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl SpoolStats {
    pub(crate) fn count(&mut self, state: DeliveryState) {
        match state {
            DeliveryState::Pending => self.pending += 1,
            DeliveryState::InFlight => self.in_flight += 1,
            DeliveryState::Delivered => self.delivered += 1,
            DeliveryState::Failed => self.failed += 1,
        }
    }
}

/// Replay order: creation time, then id to keep ties stable.
pub(crate) fn replay_order(envelopes: &mut [Envelope]) {
    envelopes.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.id().cmp(&b.id()))
    });
}

pub(crate) fn log_refused(id: EnvelopeId, from: DeliveryState, to: DeliveryState) {
    tracing::warn!(envelope_id = %id, %from, %to, "Refused spool state transition");
}

/// Error returned by spool operations.
///
/// Captures a tracing span backtrace alongside the failure.
#[derive(Debug)]
pub struct SpoolError {
    context: SpanTrace,
    kind: SpoolErrorKind,
}

/// Spool error kinds.
#[derive(Debug)]
pub enum SpoolErrorKind {
    /// Writing, flushing, renaming or reading the spool failed.
    IoFailure(std::io::Error),
    /// A record could not be encoded.
    Encode(serde_json::Error),
    /// No record with this id exists.
    NotFound(EnvelopeId),
}

impl SpoolError {
    pub fn io(err: std::io::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SpoolErrorKind::IoFailure(err),
        }
    }

    pub fn encode(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SpoolErrorKind::Encode(err),
        }
    }

    pub fn not_found(id: EnvelopeId) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SpoolErrorKind::NotFound(id),
        }
    }

    pub fn kind(&self) -> &SpoolErrorKind {
        &self.kind
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, SpoolErrorKind::NotFound(_))
    }
}

impl std::fmt::Display for SpoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SpoolErrorKind::IoFailure(err) => writeln!(f, "Spool I/O failure: {err}"),
            SpoolErrorKind::Encode(err) => writeln!(f, "Spool encode error: {err}"),
            SpoolErrorKind::NotFound(id) => writeln!(f, "Spool record {id} not found"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SpoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SpoolErrorKind::IoFailure(err) => Some(err),
            SpoolErrorKind::Encode(err) => Some(err),
            SpoolErrorKind::NotFound(_) => None,
        }
    }
}

impl From<std::io::Error> for SpoolError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err)
    }
}

impl From<serde_json::Error> for SpoolError {
    fn from(err: serde_json::Error) -> Self {
        Self::encode(err)
    }
}
