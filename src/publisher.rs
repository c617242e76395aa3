//! Publisher engine.
//!
//! The [`Publisher`] accepts envelopes from producers, makes them durable in a
//! [`SpoolStore`] and hands them to drain workers that deliver them through a
//! [`Connector`]:
//!
//! - `publish` returns once the envelope is flushed to the spool, never waiting
//!   for the broker
//! - drain workers take entries from the [`DeliveryQueue`], mark them in
//!   flight, send them and record the acknowledgment
//! - transport failures are retried with capped exponential backoff until
//!   `max_attempts` is reached, after which the envelope is marked failed and
//!   reported on the operator channel ([`Publisher::failures`])
//!
//! Durability failures are returned to the caller of `publish`; transport
//! failures never are.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use tokio::{
    sync::{Notify, broadcast, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tokio_stream::{
    StreamExt as _,
    wrappers::{BroadcastStream, UnboundedReceiverStream, errors::BroadcastStreamRecvError},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;
use tracing_error::SpanTrace;

use crate::{
    backoff::Backoff,
    config::{ConfigError, PublisherConfig},
    envelope::{DeliveryState, Envelope, EnvelopeId, MessageKind},
    queue::{DeliveryQueue, QueueEntry},
    spool::{SpoolError, SpoolStore},
    transport::{Connector, Sender, Transport, TransportError, TransportFailure},
};

const OUTCOME_CAPACITY: usize = 1024;

/// Handle to a running publisher engine.
///
/// Cloning is cheap; every clone drives the same engine. Dropping the handles
/// does not stop the drain workers, [`shutdown`](Publisher::shutdown) does.
pub struct Publisher<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Publisher<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<S> {
    spool: S,
    config: PublisherConfig,
    backoff: Backoff,
    hook: Arc<dyn PublisherHook>,
    queue: Mutex<DeliveryQueue>,
    wake: Notify,
    accepting: AtomicBool,
    cancel: CancellationToken,
    reconnect_epoch: AtomicU64,
    unsettled: Mutex<HashMap<EnvelopeId, Unsettled>>,
    outcomes: broadcast::Sender<DeliveryOutcome>,
    failures_tx: mpsc::UnboundedSender<EnvelopeFailed>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<EnvelopeFailed>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Configures and starts a [`Publisher`].
pub struct PublisherBuilder<S, C, HK> {
    spool: S,
    connector: C,
    config: PublisherConfig,
    hook: HK,
}

impl<S, C, HK> PublisherBuilder<S, C, HK>
where
    S: SpoolStore,
    C: Connector,
    HK: PublisherHook,
{
    /// Replace the lifecycle hook.
    pub fn with_hook<HK2: PublisherHook>(self, hook: HK2) -> PublisherBuilder<S, C, HK2> {
        PublisherBuilder {
            spool: self.spool,
            connector: self.connector,
            config: self.config,
            hook,
        }
    }

    /// Recover the spool and spawn the drain workers.
    ///
    /// Every record not known to be delivered or failed is replayed: in-flight
    /// records are downgraded to pending and queued in creation order.
    #[tracing::instrument(skip_all, fields(broker = %self.config.broker_address))]
    pub async fn start(self) -> Result<Publisher<S>, StartError> {
        self.config.validate().map_err(StartError::config)?;
        let recovered = self.spool.load_pending().await.map_err(StartError::spool)?;

        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            backoff: self.config.backoff(),
            queue: Mutex::new(DeliveryQueue::new(self.config.retry_ordering)),
            spool: self.spool,
            config: self.config,
            hook: Arc::new(self.hook),
            wake: Notify::new(),
            accepting: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            reconnect_epoch: AtomicU64::new(0),
            unsettled: Mutex::new(HashMap::new()),
            outcomes,
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
            workers: tokio::sync::Mutex::new(Vec::new()),
        });

        for envelope in &recovered {
            shared.admit(envelope);
        }
        shared.hook.on_startup(recovered.len());

        let connector = Arc::new(self.connector);
        let mut workers = shared.workers.lock().await;
        for worker in 0..shared.config.drain_workers {
            let drain = Drain {
                shared: Arc::clone(&shared),
                connector: Arc::clone(&connector),
                worker,
            };
            workers.push(tokio::spawn(
                drain
                    .run()
                    .instrument(tracing::info_span!("drain", worker)),
            ));
        }
        drop(workers);

        Ok(Publisher { shared })
    }
}

impl<S: SpoolStore> Publisher<S> {
    /// Prepare a publisher over `spool`, delivering through `connector`.
    pub fn builder<C: Connector>(
        spool: S,
        connector: C,
        config: PublisherConfig,
    ) -> PublisherBuilder<S, C, DefaultPublisherHook> {
        PublisherBuilder {
            spool,
            connector,
            config,
            hook: DefaultPublisherHook,
        }
    }

    /// Start a publisher with the default hook.
    pub async fn start<C: Connector>(
        spool: S,
        connector: C,
        config: PublisherConfig,
    ) -> Result<Self, StartError> {
        Self::builder(spool, connector, config).start().await
    }

    /// Durably enqueue a new envelope.
    ///
    /// Resolves once the envelope is flushed to the spool; delivery happens in
    /// the background.
    pub async fn publish(
        &self,
        kind: MessageKind,
        destination: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<EnvelopeId, PublishError> {
        self.publish_envelope(Envelope::new(kind, destination, payload.into()))
            .await
    }

    /// Like [`publish`](Publisher::publish), tagging the envelope with the
    /// caller's correlation id.
    pub async fn publish_with(
        &self,
        kind: MessageKind,
        destination: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        correlation_id: EnvelopeId,
    ) -> Result<EnvelopeId, PublishError> {
        self.publish_envelope(
            Envelope::new(kind, destination, payload.into()).with_correlation_id(correlation_id),
        )
        .await
    }

    /// Durably enqueue an envelope that must not be sent before `delay` has
    /// elapsed. The hold survives restarts.
    pub async fn publish_delayed(
        &self,
        kind: MessageKind,
        destination: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        delay: Duration,
    ) -> Result<EnvelopeId, PublishError> {
        let not_before = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .ok_or_else(|| PublishError::rejected(format!("delay {delay:?} is out of range")))?;
        self.publish_envelope(
            Envelope::new(kind, destination, payload.into()).with_not_before(not_before),
        )
        .await
    }

    /// Durably enqueue a prepared envelope.
    ///
    /// The envelope must be fresh: pending and never attempted.
    #[tracing::instrument(
        skip_all,
        fields(envelope_id = %envelope.id(), destination = envelope.destination(), kind = %envelope.kind())
    )]
    pub async fn publish_envelope(&self, envelope: Envelope) -> Result<EnvelopeId, PublishError> {
        let shared = &self.shared;
        if !shared.accepting.load(Ordering::SeqCst) {
            return Err(PublishError::shutting_down());
        }
        shared.check(&envelope)?;

        shared.spool.persist(&envelope).await.map_err(|err| {
            shared.hook.on_spool_error(envelope.id(), &err);
            PublishError::spool_unavailable(err)
        })?;

        shared.admit(&envelope);
        shared.wake.notify_waiters();
        shared.hook.on_published(&envelope);
        Ok(envelope.id())
    }

    /// Queue `Pending` spool records this publisher does not know about yet,
    /// such as those written by another process sharing the spool. Returns
    /// how many were added.
    #[tracing::instrument(skip_all)]
    pub async fn rescan(&self) -> Result<usize, SpoolError> {
        let shared = &self.shared;
        if !shared.accepting.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let pending = shared.spool.pending().await?;
        let admitted = pending
            .iter()
            .filter(|envelope| shared.admit(envelope))
            .count();
        if admitted > 0 {
            tracing::debug!(admitted, "Picked up spooled envelopes");
            shared.wake.notify_waiters();
        }
        Ok(admitted)
    }

    /// Ask every drain worker to close its connection and open a fresh one
    /// before its next send.
    pub fn reconnect(&self) {
        self.shared.reconnect_epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
    }

    /// Reconnects requested so far.
    pub fn reconnect_requests(&self) -> u64 {
        self.shared.reconnect_epoch.load(Ordering::SeqCst)
    }

    /// Stream of delivery outcomes from now on.
    ///
    /// Slow subscribers skip events rather than stall delivery; use
    /// [`failures`](Publisher::failures) where losing an event is not
    /// acceptable.
    pub fn outcomes(&self) -> BoxStream<'static, DeliveryOutcome> {
        let stream = BroadcastStream::new(self.shared.outcomes.subscribe()).filter_map(|event| {
            match event {
                Ok(outcome) => Some(outcome),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Delivery outcome subscriber lagged");
                    None
                }
            }
        });
        Box::pin(stream)
    }

    /// Take the operator failure channel.
    ///
    /// Every envelope that exhausts its attempts appears on it exactly once.
    /// The channel is unbounded and can be taken only once; later calls
    /// return `None`.
    pub fn failures(&self) -> Option<BoxStream<'static, EnvelopeFailed>> {
        let receiver = lock(&self.shared.failures_rx).take()?;
        Some(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    pub fn spool(&self) -> &S {
        &self.shared.spool
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.shared.config
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Envelopes waiting in the delivery queue, excluding those mid-attempt.
    pub fn queued(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Stop accepting envelopes and wind down the drain workers.
    ///
    /// Attempts already under way get up to `timeout` to resolve; workers
    /// still busy after that are aborted. Nothing is acknowledged that the
    /// broker did not acknowledge, and everything undelivered stays in the
    /// spool for the next start.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let shared = &self.shared;
        shared.accepting.store(false, Ordering::SeqCst);
        shared.cancel.cancel();
        shared.wake.notify_waiters();

        let workers = std::mem::take(&mut *shared.workers.lock().await);
        let deadline = Instant::now() + timeout;
        let mut aborted = 0;
        for mut handle in workers {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }

        let report = ShutdownReport {
            aborted_workers: aborted,
            queued: lock(&shared.queue).len(),
        };
        shared.hook.on_shutdown(&report);
        report
    }
}

impl<S: SpoolStore> Shared<S> {
    fn check(&self, envelope: &Envelope) -> Result<(), PublishError> {
        if envelope.destination().trim().is_empty() {
            return Err(PublishError::rejected("destination must not be empty"));
        }
        if envelope.payload().len() > self.config.max_payload_size {
            return Err(PublishError::rejected(format!(
                "payload of {} bytes exceeds the {} byte limit",
                envelope.payload().len(),
                self.config.max_payload_size
            )));
        }
        if envelope.state() != DeliveryState::Pending || envelope.attempt_count() != 0 {
            return Err(PublishError::rejected("envelope was already attempted"));
        }
        Ok(())
    }

    /// Queue an envelope unless it is already known. Returns whether it was
    /// added.
    fn admit(&self, envelope: &Envelope) -> bool {
        let mut queue = lock(&self.queue);
        if queue.contains(envelope.id()) {
            return false;
        }
        match due_at(envelope.not_before()) {
            Some(due) => queue.enqueue_at(envelope.id(), envelope.destination(), due),
            None => {
                queue.enqueue(envelope.id(), envelope.destination());
            }
        }
        true
    }

    fn emit(&self, outcome: DeliveryOutcome) {
        // No subscribers is fine.
        let _ = self.outcomes.send(outcome);
    }

    fn finish(&self, entry: &QueueEntry) {
        lock(&self.queue).finish(entry);
        self.wake.notify_waiters();
    }

    fn retry(&self, entry: QueueEntry, delay: Duration) {
        lock(&self.queue).retry(entry, Instant::now() + delay);
        self.wake.notify_waiters();
    }

    async fn next_entry(&self) -> Option<QueueEntry> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut queue = lock(&self.queue);
                queue.promote_due(Instant::now());
                if let Some(entry) = queue.checkout() {
                    return Some(entry);
                }
                queue.next_due()
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {}
            }
        }
    }
}

/// One drain worker: owns a single broker connection and processes one
/// queue entry at a time.
struct Drain<S, C: Connector> {
    shared: Arc<Shared<S>>,
    connector: Arc<C>,
    worker: usize,
}

/// A failed attempt whose spool transition has not been recorded yet.
struct Unsettled {
    envelope: Envelope,
    error: TransportError,
}

struct Link<T> {
    sender: Option<T>,
    epoch: u64,
}

impl<S: SpoolStore, C: Connector> Drain<S, C> {
    async fn run(self) {
        let mut link = Link {
            sender: None,
            epoch: self.shared.reconnect_epoch.load(Ordering::SeqCst),
        };

        while let Some(entry) = self.shared.next_entry().await {
            self.attempt(entry, &mut link).await;
        }

        self.disconnect(&mut link).await;
    }

    #[tracing::instrument(skip_all, fields(envelope_id = %entry.id, destination = %entry.destination))]
    async fn attempt(&self, entry: QueueEntry, link: &mut Link<C::Sender>) {
        let shared = &self.shared;

        let owed = lock(&shared.unsettled).remove(&entry.id);
        if let Some(Unsettled { envelope, error }) = owed {
            self.attempt_failed(entry, &envelope, error).await;
            return;
        }

        let envelope = match shared.spool.mark_in_flight(entry.id).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                tracing::debug!("Envelope is no longer pending, dropping queue entry");
                shared.finish(&entry);
                return;
            }
            Err(err) if err.is_not_found() => {
                shared.hook.on_spool_error(entry.id, &err);
                shared.finish(&entry);
                return;
            }
            Err(err) => {
                shared.hook.on_spool_error(entry.id, &err);
                shared.retry(entry, shared.backoff.delay(0));
                return;
            }
        };

        shared.hook.on_attempt(&envelope);
        match self.send(&envelope, link).await {
            Ok(()) => self.delivered(entry, &envelope).await,
            Err(err) => {
                self.disconnect(link).await;
                self.attempt_failed(entry, &envelope, err).await;
            }
        }
    }

    async fn send(
        &self,
        envelope: &Envelope,
        link: &mut Link<C::Sender>,
    ) -> Result<(), TransportError> {
        let ack_timeout = self.shared.config.ack_timeout;
        let sender = self.connection(link).await?;
        Transport::new(sender)
            .with_ack_timeout(ack_timeout)
            .send(envelope.clone())
            .await
    }

    async fn connection(&self, link: &mut Link<C::Sender>) -> Result<C::Sender, TransportError> {
        let epoch = self.shared.reconnect_epoch.load(Ordering::SeqCst);
        if link.epoch != epoch {
            link.epoch = epoch;
            self.shared.hook.on_reconnect(self.worker);
            self.disconnect(link).await;
        }

        if let Some(sender) = &link.sender {
            return Ok(sender.clone());
        }

        let config = &self.shared.config;
        let sender = tokio::time::timeout(
            config.ack_timeout,
            self.connector.connect(&config.broker_address),
        )
        .await
        .map_err(|_| {
            TransportError::connect(format!("no connection within {:?}", config.ack_timeout))
        })?
        .map_err(TransportError::connect)?;
        link.sender = Some(sender.clone());
        Ok(sender)
    }

    async fn disconnect(&self, link: &mut Link<C::Sender>) {
        if let Some(mut sender) = link.sender.take() {
            if let Err(err) = sender.close().await {
                let err: tower::BoxError = err.into();
                tracing::debug!(error = %err, "Error closing broker connection");
            }
        }
    }

    async fn delivered(&self, entry: QueueEntry, envelope: &Envelope) {
        let shared = &self.shared;
        // An unrecorded acknowledgment means a redelivery after restart, which
        // at-least-once permits.
        if let Err(err) = shared.spool.mark_delivered(envelope.id()).await {
            shared.hook.on_spool_error(envelope.id(), &err);
        }
        shared.hook.on_delivered(envelope);
        shared.emit(DeliveryOutcome::Delivered {
            id: envelope.id(),
            kind: envelope.kind(),
            destination: envelope.destination().to_owned(),
            attempt: envelope.attempt_count(),
        });
        shared.finish(&entry);
    }

    async fn attempt_failed(&self, entry: QueueEntry, envelope: &Envelope, err: TransportError) {
        let shared = &self.shared;
        let attempt = envelope.attempt_count();

        if attempt >= shared.config.max_attempts {
            let reason = format!("{} after {attempt} attempts", err.kind());
            if let Err(spool_err) = shared.spool.mark_failed(envelope.id(), &reason).await {
                self.settle_later(entry, envelope, err, &spool_err);
                return;
            }

            let failed = EnvelopeFailed {
                envelope: envelope.clone(),
                reason,
                failed_at: Utc::now(),
            };
            shared.hook.on_failed(&failed);
            shared.emit(DeliveryOutcome::Failed {
                id: envelope.id(),
                kind: envelope.kind(),
                destination: envelope.destination().to_owned(),
                attempt,
                failure: err.failure(),
            });
            let _ = shared.failures_tx.send(failed);
            shared.finish(&entry);
            return;
        }

        if let Err(spool_err) = shared.spool.mark_pending(envelope.id()).await {
            self.settle_later(entry, envelope, err, &spool_err);
            return;
        }

        let delay = shared.backoff.delay(attempt);
        shared.hook.on_retry_scheduled(envelope, &err, delay);
        shared.emit(DeliveryOutcome::AttemptFailed {
            id: envelope.id(),
            kind: envelope.kind(),
            destination: envelope.destination().to_owned(),
            attempt,
            failure: err.failure(),
            retry_in: delay,
        });
        shared.retry(entry, delay);
    }

    /// Keep the entry queued so the spool transition is tried again; the
    /// record stays in flight until then.
    fn settle_later(
        &self,
        entry: QueueEntry,
        envelope: &Envelope,
        error: TransportError,
        spool_err: &SpoolError,
    ) {
        let shared = &self.shared;
        shared.hook.on_spool_error(envelope.id(), spool_err);
        let delay = shared.backoff.delay(envelope.attempt_count());
        lock(&shared.unsettled).insert(
            envelope.id(),
            Unsettled {
                envelope: envelope.clone(),
                error,
            },
        );
        shared.retry(entry, delay);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn due_at(not_before: Option<DateTime<Utc>>) -> Option<Instant> {
    let wait = (not_before? - Utc::now()).to_std().ok()?;
    (!wait.is_zero()).then(|| Instant::now() + wait)
}

/// What happened to one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The broker acknowledged the envelope.
    Delivered {
        id: EnvelopeId,
        kind: MessageKind,
        destination: String,
        attempt: u32,
    },
    /// The attempt failed and another is scheduled after `retry_in`.
    AttemptFailed {
        id: EnvelopeId,
        kind: MessageKind,
        destination: String,
        attempt: u32,
        failure: TransportFailure,
        retry_in: Duration,
    },
    /// The last allowed attempt failed; the envelope is marked failed.
    Failed {
        id: EnvelopeId,
        kind: MessageKind,
        destination: String,
        attempt: u32,
        failure: TransportFailure,
    },
}

impl DeliveryOutcome {
    pub fn id(&self) -> EnvelopeId {
        match self {
            Self::Delivered { id, .. } | Self::AttemptFailed { id, .. } | Self::Failed { id, .. } => {
                *id
            }
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Delivered { kind, .. }
            | Self::AttemptFailed { kind, .. }
            | Self::Failed { kind, .. } => *kind,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// An envelope that exhausted its delivery attempts.
///
/// The record stays in the spool as failed until an operator purges it.
#[derive(Debug, Clone)]
pub struct EnvelopeFailed {
    pub envelope: Envelope,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Summary of a completed [`Publisher::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that did not finish within the grace period.
    pub aborted_workers: usize,
    /// Envelopes still queued; they remain pending in the spool.
    pub queued: usize,
}

/// Error returned by [`Publisher::publish`] and its variants.
#[derive(Debug)]
pub struct PublishError {
    context: SpanTrace,
    kind: PublishErrorKind,
}

/// Publish errors kind.
#[derive(Debug)]
pub enum PublishErrorKind {
    /// The envelope is invalid; nothing was written.
    Rejected(String),
    /// The envelope could not be made durable; the caller must not assume it
    /// will be delivered.
    SpoolUnavailable(SpoolError),
    /// The publisher no longer accepts envelopes.
    ShuttingDown,
}

impl PublishError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::Rejected(reason.into()),
        }
    }

    pub fn spool_unavailable(err: SpoolError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::SpoolUnavailable(err),
        }
    }

    pub fn shutting_down() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::ShuttingDown,
        }
    }

    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            PublishErrorKind::Rejected(reason) => writeln!(f, "Envelope rejected: {reason}"),
            PublishErrorKind::SpoolUnavailable(err) => writeln!(f, "Spool unavailable: {err}"),
            PublishErrorKind::ShuttingDown => writeln!(f, "Publisher is shutting down"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PublishErrorKind::SpoolUnavailable(err) => Some(err),
            PublishErrorKind::Rejected(_) | PublishErrorKind::ShuttingDown => None,
        }
    }
}

/// Error returned when a publisher cannot start.
#[derive(Debug)]
pub struct StartError {
    context: SpanTrace,
    kind: StartErrorKind,
}

#[derive(Debug)]
pub enum StartErrorKind {
    Config(ConfigError),
    /// Recovery could not read the spool.
    Spool(SpoolError),
}

impl StartError {
    fn config(err: ConfigError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StartErrorKind::Config(err),
        }
    }

    fn spool(err: SpoolError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StartErrorKind::Spool(err),
        }
    }

    pub fn kind(&self) -> &StartErrorKind {
        &self.kind
    }
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            StartErrorKind::Config(err) => writeln!(f, "Configuration error: {err}"),
            StartErrorKind::Spool(err) => writeln!(f, "Spool recovery error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            StartErrorKind::Config(err) => Some(err),
            StartErrorKind::Spool(err) => Some(err),
        }
    }
}

/// Hook trait for observing publisher lifecycle events.
///
/// Hooks are invoked synchronously from producer calls and drain workers and
/// should avoid heavy or blocking work.
pub trait PublisherHook: Send + Sync + 'static {
    fn on_startup(&self, recovered: usize);
    fn on_shutdown(&self, report: &ShutdownReport);
    fn on_published(&self, envelope: &Envelope);
    fn on_attempt(&self, envelope: &Envelope);
    fn on_delivered(&self, envelope: &Envelope);
    fn on_retry_scheduled(&self, envelope: &Envelope, error: &TransportError, delay: Duration);
    fn on_failed(&self, failure: &EnvelopeFailed);
    fn on_spool_error(&self, id: EnvelopeId, error: &SpoolError);
    fn on_reconnect(&self, worker: usize);
}

/// Default publisher hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultPublisherHook;

impl PublisherHook for DefaultPublisherHook {
    fn on_startup(&self, recovered: usize) {
        tracing::info!(recovered, "Publisher is starting up");
    }

    fn on_shutdown(&self, report: &ShutdownReport) {
        tracing::info!(
            aborted_workers = report.aborted_workers,
            queued = report.queued,
            "Publisher shut down"
        );
    }

    fn on_published(&self, _envelope: &Envelope) {
        tracing::debug!("Envelope spooled");
    }

    fn on_attempt(&self, envelope: &Envelope) {
        tracing::debug!(attempt = envelope.attempt_count(), "Attempting delivery");
    }

    fn on_delivered(&self, envelope: &Envelope) {
        tracing::info!(attempt = envelope.attempt_count(), "Envelope delivered");
    }

    fn on_retry_scheduled(&self, envelope: &Envelope, error: &TransportError, delay: Duration) {
        tracing::warn!(
            attempt = envelope.attempt_count(),
            error = %error.kind(),
            ?delay,
            "Delivery attempt failed, retry scheduled"
        );
    }

    fn on_failed(&self, failure: &EnvelopeFailed) {
        tracing::error!(
            envelope_id = %failure.envelope.id(),
            destination = failure.envelope.destination(),
            reason = %failure.reason,
            "Envelope failed"
        );
    }

    fn on_spool_error(&self, id: EnvelopeId, error: &SpoolError) {
        tracing::error!(envelope_id = %id, ?error, "Spool error");
    }

    fn on_reconnect(&self, worker: usize) {
        tracing::info!(worker, "Reconnecting to broker");
    }
}
