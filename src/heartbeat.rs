//! Broker liveness probing.
//!
//! The [`HeartbeatMonitor`] publishes a [`MessageKind::Heartbeat`] envelope on
//! a fixed interval through the ordinary publish path and watches how those
//! envelopes fare. When enough consecutive heartbeats fail to get through,
//! the connection is unhealthy and the monitor asks the publisher to
//! reconnect. Each heartbeat counts once however often it is retried.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{DEFAULT_HEARTBEAT_DESTINATION, HeartbeatConfig},
    envelope::{EnvelopeId, MessageKind},
    publisher::{DeliveryOutcome, PublishErrorKind, Publisher},
    spool::SpoolStore,
};

/// Body of a heartbeat envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Increments by one per emitted heartbeat, starting at 1.
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
}

/// Heartbeats remembered while awaiting a final outcome.
const TRACKED_HEARTBEATS: u64 = 1024;

pub struct HeartbeatMonitor {
    interval: Duration,
    destination: String,
    failure_threshold: u32,
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::from_config(&HeartbeatConfig::default())
    }
}

impl HeartbeatMonitor {
    /// Emit to `destination` every `interval`, reconnecting after five
    /// consecutive heartbeats fail.
    pub fn new(interval: Duration, destination: impl Into<String>) -> Self {
        Self {
            interval,
            destination: destination.into(),
            failure_threshold: 5,
        }
    }

    pub fn from_config(config: &HeartbeatConfig) -> Self {
        Self::new(config.interval, config.destination.clone())
            .with_failure_threshold(config.failure_threshold)
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Start emitting in the background until `cancel` fires or the
    /// publisher shuts down.
    ///
    /// The first heartbeat is emitted immediately.
    pub fn start<S>(self, publisher: Publisher<S>, cancel: CancellationToken) -> JoinHandle<()>
    where
        S: SpoolStore,
    {
        let Self {
            interval,
            destination,
            failure_threshold,
        } = self;

        tokio::spawn(async move {
            let mut outcomes = publisher.outcomes();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut sequence = 0u64;
            let mut health = Health::new(failure_threshold);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        sequence += 1;
                        let beat = HeartbeatPayload { sequence, emitted_at: Utc::now() };
                        let payload = match serde_json::to_vec(&beat) {
                            Ok(payload) => payload,
                            Err(error) => {
                                tracing::error!(%error, "Failed to encode heartbeat");
                                continue;
                            }
                        };
                        match publisher.publish(MessageKind::Heartbeat, destination.as_str(), payload).await {
                            Ok(id) => {
                                health.emitted(id, sequence);
                                tracing::trace!(envelope_id = %id, sequence, "Heartbeat emitted");
                            }
                            Err(error) if matches!(error.kind(), PublishErrorKind::ShuttingDown) => return,
                            Err(error) => tracing::warn!(?error, sequence, "Heartbeat could not be spooled"),
                        }
                    }
                    outcome = outcomes.next() => {
                        let Some(outcome) = outcome else { return };
                        if outcome.kind() != MessageKind::Heartbeat {
                            continue;
                        }
                        if health.observe(&outcome) {
                            tracing::warn!(
                                failed_heartbeats = failure_threshold,
                                "Broker connection unhealthy, requesting reconnect"
                            );
                            publisher.reconnect();
                        }
                    }
                }
            }
        })
    }
}

/// Consecutive heartbeat failures, one count per heartbeat.
struct Health {
    threshold: u32,
    awaiting: HashMap<EnvelopeId, u64>,
    last_failed: u64,
    consecutive: u32,
}

impl Health {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            awaiting: HashMap::new(),
            last_failed: 0,
            consecutive: 0,
        }
    }

    fn emitted(&mut self, id: EnvelopeId, sequence: u64) {
        self.awaiting.insert(id, sequence);
        if self.awaiting.len() as u64 > TRACKED_HEARTBEATS {
            let oldest = sequence.saturating_sub(TRACKED_HEARTBEATS);
            self.awaiting.retain(|_, seq| *seq > oldest);
        }
    }

    /// Record an outcome. Returns `true` when the threshold is reached, after
    /// which counting starts over.
    fn observe(&mut self, outcome: &DeliveryOutcome) -> bool {
        let id = outcome.id();
        let Some(&sequence) = self.awaiting.get(&id) else {
            return false;
        };

        match outcome {
            DeliveryOutcome::Delivered { .. } => {
                self.awaiting.remove(&id);
                if sequence >= self.last_failed {
                    self.consecutive = 0;
                }
                false
            }
            DeliveryOutcome::AttemptFailed { failure, .. } | DeliveryOutcome::Failed { failure, .. } => {
                if matches!(outcome, DeliveryOutcome::Failed { .. }) {
                    self.awaiting.remove(&id);
                }
                // retries of a heartbeat already counted, or of an older one
                if sequence <= self.last_failed {
                    return false;
                }
                self.last_failed = sequence;
                self.consecutive += 1;
                tracing::debug!(sequence, consecutive = self.consecutive, %failure, "Heartbeat failed");
                if self.consecutive >= self.threshold {
                    self.consecutive = 0;
                    return true;
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PublisherConfig, spool::InMemorySpool, transport::InMemory};

    fn config() -> PublisherConfig {
        PublisherConfig::default()
            .with_backoff(Duration::from_millis(10), Duration::from_millis(100))
            .with_backoff_jitter(false)
            .with_ack_timeout(Duration::from_millis(200))
            .with_max_attempts(1)
    }

    async fn heartbeat_attempts(broker: &InMemory) -> usize {
        broker
            .attempts()
            .await
            .iter()
            .filter(|envelope| envelope.kind() == MessageKind::Heartbeat)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_consecutive_failures() {
        let broker = InMemory::default();
        broker.fail_destination(DEFAULT_HEARTBEAT_DESTINATION).await;
        let publisher = Publisher::start(InMemorySpool::default(), broker.clone(), config())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = HeartbeatMonitor::new(Duration::from_secs(1), DEFAULT_HEARTBEAT_DESTINATION)
            .with_failure_threshold(5)
            .start(publisher.clone(), cancel.clone());

        tokio::time::timeout(Duration::from_secs(30), async {
            while publisher.reconnect_requests() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no reconnect requested");

        // Requested before the sixth heartbeat went out.
        assert_eq!(heartbeat_attempts(&broker).await, 5);
        assert_eq!(publisher.reconnect_requests(), 1);

        cancel.cancel();
        handle.await.unwrap();
        publisher.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_of_one_heartbeat_count_once() {
        let broker = InMemory::default();
        broker.fail_destination("beats").await;
        let publisher = Publisher::start(
            InMemorySpool::default(),
            broker.clone(),
            config().with_max_attempts(5),
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = HeartbeatMonitor::new(Duration::from_secs(5), "beats")
            .with_failure_threshold(5)
            .start(publisher.clone(), cancel.clone());

        // the first heartbeat exhausts all five attempts well within 2s
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(heartbeat_attempts(&broker).await, 5);
        assert_eq!(publisher.reconnect_requests(), 0);

        tokio::time::timeout(Duration::from_secs(60), async {
            while publisher.reconnect_requests() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no reconnect requested");

        let distinct: std::collections::HashSet<_> = broker
            .attempts()
            .await
            .iter()
            .map(|envelope| envelope.id())
            .collect();
        assert_eq!(distinct.len(), 5);

        cancel.cancel();
        handle.await.unwrap();
        publisher.shutdown(Duration::from_millis(50)).await;
    }

    fn attempt_failed(id: EnvelopeId) -> DeliveryOutcome {
        DeliveryOutcome::AttemptFailed {
            id,
            kind: MessageKind::Heartbeat,
            destination: "beats".into(),
            attempt: 1,
            failure: crate::transport::TransportFailure::SendFailed,
            retry_in: Duration::from_millis(10),
        }
    }

    fn delivered(id: EnvelopeId) -> DeliveryOutcome {
        DeliveryOutcome::Delivered {
            id,
            kind: MessageKind::Heartbeat,
            destination: "beats".into(),
            attempt: 2,
        }
    }

    #[test]
    fn late_delivery_of_an_older_heartbeat_keeps_the_count() {
        let mut health = Health::new(3);
        let ids: Vec<_> = (1..=3).map(|_| EnvelopeId::new()).collect();
        for (seq, id) in ids.iter().enumerate() {
            health.emitted(*id, seq as u64 + 1);
        }

        assert!(!health.observe(&attempt_failed(ids[0])));
        assert!(!health.observe(&attempt_failed(ids[1])));
        // heartbeat 1 finally gets through, but 2 is still failing
        assert!(!health.observe(&delivered(ids[0])));
        assert!(health.observe(&attempt_failed(ids[2])));
    }

    #[test]
    fn newer_delivery_resets_the_count() {
        let mut health = Health::new(2);
        let ids: Vec<_> = (1..=3).map(|_| EnvelopeId::new()).collect();
        for (seq, id) in ids.iter().enumerate() {
            health.emitted(*id, seq as u64 + 1);
        }

        assert!(!health.observe(&attempt_failed(ids[0])));
        assert!(!health.observe(&delivered(ids[1])));
        assert!(!health.observe(&attempt_failed(ids[2])));
        // a retry of the same heartbeat is not a new failure
        assert!(!health.observe(&attempt_failed(ids[2])));
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_heartbeats_never_reconnect() {
        let broker = InMemory::default();
        let publisher = Publisher::start(InMemorySpool::default(), broker.clone(), config())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = HeartbeatMonitor::new(Duration::from_secs(1), "beats")
            .with_failure_threshold(2)
            .start(publisher.clone(), cancel.clone());

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        cancel.cancel();
        handle.await.unwrap();

        let sent = broker.sent().await;
        assert!(sent.len() >= 10);
        assert!(sent.iter().all(|envelope| envelope.destination() == "beats"));
        let sequences: Vec<u64> = sent
            .iter()
            .map(|envelope| {
                serde_json::from_slice::<HeartbeatPayload>(envelope.payload())
                    .unwrap()
                    .sequence
            })
            .collect();
        assert_eq!(sequences, (1..=sent.len() as u64).collect::<Vec<_>>());
        assert_eq!(publisher.reconnect_requests(), 0);
        publisher.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn stops_when_publisher_shuts_down() {
        let publisher = Publisher::start(InMemorySpool::default(), InMemory::default(), config())
            .await
            .unwrap();
        publisher.shutdown(Duration::from_millis(50)).await;

        let handle = HeartbeatMonitor::default().start(publisher, CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor kept running")
            .unwrap();
    }
}
