//! Pickup of envelopes spooled by other processes.
//!
//! A producer that shares the spool directory can write records with its own
//! [`FileSpool`](crate::spool::FileSpool) handle. The [`SpoolIntake`] rescans
//! the spool on an interval and queues every `Pending` record the publisher
//! does not know about yet.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{publisher::Publisher, spool::SpoolStore};

pub struct SpoolIntake {
    interval: Duration,
}

impl SpoolIntake {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Start rescanning in the background until `cancel` fires or the
    /// publisher stops accepting envelopes.
    ///
    /// Scan errors are logged and retried on the next tick.
    pub fn start<S>(self, publisher: Publisher<S>, cancel: CancellationToken) -> JoinHandle<()>
    where
        S: SpoolStore,
    {
        let interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if !publisher.is_accepting() {
                            return;
                        }
                        match publisher.rescan().await {
                            Ok(0) => {}
                            Ok(admitted) => tracing::info!(admitted, "Queued envelopes found in the spool"),
                            Err(error) => tracing::error!(%error, "Spool rescan failed"),
                        }
                    }
                }
            }
        })
    }
}
