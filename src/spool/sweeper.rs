use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::spool::{RetentionPolicy, SpoolStore};

/// A background task that periodically applies a [`RetentionPolicy`].
///
/// Sweep errors are logged and the next tick tries again; the task only stops
/// on cancellation.
pub struct RetentionSweeper {
    policy: RetentionPolicy,
    interval: Duration,
}

impl RetentionSweeper {
    /// Create a sweeper running `policy` every `interval`.
    pub fn new(policy: RetentionPolicy, interval: Duration) -> Self {
        Self { policy, interval }
    }

    /// Start sweeping `spool` in the background until `cancel` fires.
    ///
    /// The first sweep runs immediately.
    pub fn start<S>(self, spool: S, cancel: CancellationToken) -> JoinHandle<()>
    where
        S: SpoolStore,
    {
        let Self { policy, interval } = self;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match spool.retention_sweep(&policy).await {
                            Ok(0) => tracing::debug!("Retention sweep found nothing to remove"),
                            Ok(removed) => tracing::info!(removed, "Retention sweep removed delivered records"),
                            Err(error) => tracing::error!(%error, "Retention sweep failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::{Envelope, MessageKind},
        spool::InMemorySpool,
    };

    #[tokio::test]
    async fn sweeps_until_cancelled() {
        let spool = InMemorySpool::default();
        let envelope = Envelope::new(MessageKind::Event, "audit", vec![]);
        spool.persist(&envelope).await.unwrap();
        spool.mark_in_flight(envelope.id()).await.unwrap();
        spool.mark_delivered(envelope.id()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let cancel = CancellationToken::new();
        let handle = RetentionSweeper::new(
            RetentionPolicy::new(Duration::from_millis(1)),
            Duration::from_millis(10),
        )
        .start(spool.clone(), cancel.clone());

        tokio::time::timeout(Duration::from_secs(2), async {
            while spool.get(envelope.id()).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("delivered record was not swept");

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(spool.stats().await.unwrap().delivered, 0);
    }
}
