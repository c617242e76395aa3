use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{
        Arc, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    envelope::{DeliveryState, Envelope, EnvelopeId},
    spool::{
        RetentionPolicy, SpoolError, SpoolRecord, SpoolStats, SpoolStore, Transition,
        log_refused, replay_order,
    },
};

/// An in-memory spool for testing or local usage.
///
/// Nothing survives the process. Clones share the same records, so a test
/// can hand one clone to the publisher and inspect through another.
#[derive(Clone, Default)]
pub struct InMemorySpool {
    records: Arc<Mutex<HashMap<EnvelopeId, SpoolRecord>>>,
    fail_writes: Arc<AtomicBool>,
    fail_transitions: Arc<std::sync::Mutex<HashMap<DeliveryState, usize>>>,
}

impl InMemorySpool {
    /// Make every subsequent write fail with an I/O error, as a full or
    /// unmounted disk would.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `times` transitions into `state` fail with an I/O error.
    pub fn fail_transitions(&self, state: DeliveryState, times: usize) {
        self.fail_transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state, times);
    }

    /// Snapshot the records into an independent spool, as a restarted
    /// process would find them.
    pub async fn crash_copy(&self) -> Self {
        let records = self.records.lock().await.clone();
        Self {
            records: Arc::new(Mutex::new(records)),
            ..Self::default()
        }
    }

    fn check_writable(&self) -> Result<(), SpoolError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SpoolError::io(std::io::Error::other(
                "in-memory spool configured to fail writes",
            )));
        }
        Ok(())
    }

    fn check_transition(&self, next: DeliveryState) -> Result<(), SpoolError> {
        let mut failing = self
            .fail_transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match failing.get_mut(&next) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(SpoolError::io(std::io::Error::other(format!(
                    "in-memory spool configured to fail moving to {next}"
                ))))
            }
            _ => Ok(()),
        }
    }

    async fn transition(
        &self,
        id: EnvelopeId,
        next: DeliveryState,
        reason: Option<&str>,
    ) -> Result<Option<Envelope>, SpoolError> {
        self.check_writable()?;
        self.check_transition(next)?;
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| SpoolError::not_found(id))?;
        match record.apply(next, reason) {
            Transition::Applied => Ok(Some(record.envelope.clone())),
            Transition::Unchanged => Ok(None),
            Transition::Refused(from) => {
                log_refused(id, from, next);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl SpoolStore for InMemorySpool {
    async fn persist(&self, envelope: &Envelope) -> Result<(), SpoolError> {
        self.check_writable()?;
        match self.records.lock().await.entry(envelope.id()) {
            Entry::Occupied(_) => Err(SpoolError::io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("spool record {} already exists", envelope.id()),
            ))),
            Entry::Vacant(slot) => {
                slot.insert(SpoolRecord::new(envelope.clone()));
                Ok(())
            }
        }
    }

    async fn mark_in_flight(&self, id: EnvelopeId) -> Result<Option<Envelope>, SpoolError> {
        self.transition(id, DeliveryState::InFlight, None).await
    }

    async fn mark_pending(&self, id: EnvelopeId) -> Result<(), SpoolError> {
        self.transition(id, DeliveryState::Pending, None).await?;
        Ok(())
    }

    async fn mark_delivered(&self, id: EnvelopeId) -> Result<(), SpoolError> {
        self.transition(id, DeliveryState::Delivered, None).await?;
        Ok(())
    }

    async fn mark_failed(&self, id: EnvelopeId, reason: &str) -> Result<(), SpoolError> {
        self.transition(id, DeliveryState::Failed, Some(reason))
            .await?;
        Ok(())
    }

    async fn load_pending(&self) -> Result<Vec<Envelope>, SpoolError> {
        let mut records = self.records.lock().await;
        let mut pending: Vec<_> = records
            .values_mut()
            .filter_map(|record| record.recover().then(|| record.envelope.clone()))
            .collect();
        replay_order(&mut pending);
        Ok(pending)
    }

    async fn pending(&self) -> Result<Vec<Envelope>, SpoolError> {
        let mut pending: Vec<_> = self
            .records
            .lock()
            .await
            .values()
            .filter(|record| record.envelope.state() == DeliveryState::Pending)
            .map(|record| record.envelope.clone())
            .collect();
        replay_order(&mut pending);
        Ok(pending)
    }

    async fn retention_sweep(&self, policy: &RetentionPolicy) -> Result<usize, SpoolError> {
        self.check_writable()?;
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !policy.expired(record, now));
        Ok(before - records.len())
    }

    async fn get(&self, id: EnvelopeId) -> Result<Option<SpoolRecord>, SpoolError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn failed(&self) -> Result<Vec<SpoolRecord>, SpoolError> {
        let records = self.records.lock().await;
        let mut failed: Vec<_> = records
            .values()
            .filter(|record| record.envelope.state() == DeliveryState::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|record| record.updated_at);
        Ok(failed)
    }

    async fn purge_failed(&self, id: EnvelopeId) -> Result<bool, SpoolError> {
        self.check_writable()?;
        let mut records = self.records.lock().await;
        match records.get(&id) {
            Some(record) if record.envelope.state() == DeliveryState::Failed => {
                records.remove(&id);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(SpoolError::not_found(id)),
        }
    }

    async fn stats(&self) -> Result<SpoolStats, SpoolError> {
        let mut stats = SpoolStats::default();
        for record in self.records.lock().await.values() {
            stats.count(record.envelope.state());
        }
        Ok(stats)
    }
}
