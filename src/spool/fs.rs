//! File-backed spool driver.
//!
//! ```text
//! <root>/records/<id>.rec   live record, any state
//! <root>/records/<id>.tmp   write in progress (discarded at open)
//! <root>/corrupt/<id>.rec   record that failed validation, kept for operators
//! ```
//!
//! Every write goes to `<id>.tmp`, is flushed with `sync_all`, renamed over
//! `<id>.rec` and followed by an `fsync` of the directory. A record file is
//! framed as `AOR1 | u64 BE body length | JSON body | SHA-256(body)`; a frame
//! that fails any check is treated as absent.
//!
//! Durability is only as good as the filesystem's `fsync`.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::{
    envelope::{DeliveryState, Envelope, EnvelopeId},
    spool::{
        RetentionPolicy, SpoolError, SpoolRecord, SpoolStats, SpoolStore, Transition,
        log_refused, replay_order,
    },
};

/// Default spool location.
pub const DEFAULT_SPOOL_DIR: &str = "/var/spool/aorta";

const MAGIC: &[u8; 4] = b"AOR1";
const LEN_BYTES: usize = 8;
const DIGEST_BYTES: usize = 32;
const HEADER_BYTES: usize = MAGIC.len() + LEN_BYTES;

const RECORD_EXT: &str = "rec";
const TMP_EXT: &str = "tmp";

/// Durable spool storing one file per envelope.
#[derive(Clone)]
pub struct FileSpool {
    inner: Arc<Inner>,
}

struct Inner {
    records: PathBuf,
    corrupt: PathBuf,
    // Serializes read-modify-write of existing records.
    write_lock: Arc<Mutex<()>>,
}

impl FileSpool {
    /// Open (creating if needed) the spool rooted at `root`.
    ///
    /// Leftover `.tmp` files from interrupted writes are deleted.
    #[tracing::instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, SpoolError> {
        let root = root.as_ref().to_path_buf();
        let records = root.join("records");
        let corrupt = root.join("corrupt");

        let (records, corrupt) = blocking(move || {
            fs::create_dir_all(&records)?;
            fs::create_dir_all(&corrupt)?;
            let removed = remove_leftovers(&records)?;
            if removed > 0 {
                tracing::warn!(removed, "Discarded interrupted spool writes");
            }
            Ok((records, corrupt))
        })
        .await?;

        Ok(Self {
            inner: Arc::new(Inner {
                records,
                corrupt,
                write_lock: Arc::new(Mutex::new(())),
            }),
        })
    }

    /// Directory holding live records.
    pub fn records_dir(&self) -> &Path {
        &self.inner.records
    }

    async fn transition(
        &self,
        id: EnvelopeId,
        next: DeliveryState,
        reason: Option<String>,
    ) -> Result<Option<Envelope>, SpoolError> {
        let guard = self.inner.write_lock.clone().lock_owned().await;
        let records = self.inner.records.clone();

        blocking(move || {
            let _guard = guard;
            let mut record = match read_record(&records, id)? {
                Some(record) => record,
                None => return Err(SpoolError::not_found(id)),
            };

            match record.apply(next, reason.as_deref()) {
                Transition::Applied => {
                    write_record(&records, &record)?;
                    Ok(Some(record.envelope))
                }
                Transition::Unchanged => Ok(None),
                Transition::Refused(from) => {
                    log_refused(id, from, next);
                    Ok(None)
                }
            }
        })
        .await
    }

    /// Read every valid record, quarantining the ones that fail validation.
    fn scan(records: &Path, corrupt: &Path) -> Result<Vec<SpoolRecord>, SpoolError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(records)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            match decode_file(&path)? {
                Ok(record) => out.push(record),
                Err(reason) => quarantine(&path, corrupt, &reason)?,
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl SpoolStore for FileSpool {
    #[tracing::instrument(skip_all, fields(envelope_id = %envelope.id()))]
    async fn persist(&self, envelope: &Envelope) -> Result<(), SpoolError> {
        let record = SpoolRecord::new(envelope.clone());
        let records = self.inner.records.clone();

        blocking(move || {
            let path = record_path(&records, record.envelope.id());
            if path.exists() {
                return Err(SpoolError::io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("spool record {} already exists", record.envelope.id()),
                )));
            }
            write_record(&records, &record)
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn mark_in_flight(&self, id: EnvelopeId) -> Result<Option<Envelope>, SpoolError> {
        self.transition(id, DeliveryState::InFlight, None).await
    }

    #[tracing::instrument(skip(self))]
    async fn mark_pending(&self, id: EnvelopeId) -> Result<(), SpoolError> {
        self.transition(id, DeliveryState::Pending, None).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn mark_delivered(&self, id: EnvelopeId) -> Result<(), SpoolError> {
        self.transition(id, DeliveryState::Delivered, None).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn mark_failed(&self, id: EnvelopeId, reason: &str) -> Result<(), SpoolError> {
        self.transition(id, DeliveryState::Failed, Some(reason.to_owned()))
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn load_pending(&self) -> Result<Vec<Envelope>, SpoolError> {
        let guard = self.inner.write_lock.clone().lock_owned().await;
        let records = self.inner.records.clone();
        let corrupt = self.inner.corrupt.clone();

        let pending = blocking(move || {
            let _guard = guard;
            let mut pending = Vec::new();
            for mut record in Self::scan(&records, &corrupt)? {
                let was_in_flight = record.envelope.state() == DeliveryState::InFlight;
                if !record.recover() {
                    continue;
                }
                if was_in_flight {
                    // the attempt outcome is unknown, replay it
                    write_record(&records, &record)?;
                }
                pending.push(record.envelope);
            }
            replay_order(&mut pending);
            Ok(pending)
        })
        .await?;

        tracing::info!(count = pending.len(), "Loaded pending spool records");
        Ok(pending)
    }

    #[tracing::instrument(skip_all)]
    async fn pending(&self) -> Result<Vec<Envelope>, SpoolError> {
        let guard = self.inner.write_lock.clone().lock_owned().await;
        let records = self.inner.records.clone();
        let corrupt = self.inner.corrupt.clone();

        blocking(move || {
            let _guard = guard;
            let mut pending: Vec<_> = Self::scan(&records, &corrupt)?
                .into_iter()
                .map(|record| record.envelope)
                .filter(|envelope| envelope.state() == DeliveryState::Pending)
                .collect();
            replay_order(&mut pending);
            Ok(pending)
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn retention_sweep(&self, policy: &RetentionPolicy) -> Result<usize, SpoolError> {
        let guard = self.inner.write_lock.clone().lock_owned().await;
        let records = self.inner.records.clone();
        let corrupt = self.inner.corrupt.clone();
        let policy = *policy;

        blocking(move || {
            let _guard = guard;
            let now = Utc::now();
            let mut removed = 0;
            for record in Self::scan(&records, &corrupt)? {
                if policy.expired(&record, now) {
                    fs::remove_file(record_path(&records, record.envelope.id()))?;
                    removed += 1;
                }
            }
            if removed > 0 {
                sync_dir(&records)?;
            }
            Ok(removed)
        })
        .await
    }

    async fn get(&self, id: EnvelopeId) -> Result<Option<SpoolRecord>, SpoolError> {
        let records = self.inner.records.clone();
        blocking(move || read_record(&records, id)).await
    }

    async fn failed(&self) -> Result<Vec<SpoolRecord>, SpoolError> {
        let records = self.inner.records.clone();
        let corrupt = self.inner.corrupt.clone();

        blocking(move || {
            let mut failed: Vec<_> = Self::scan(&records, &corrupt)?
                .into_iter()
                .filter(|record| record.envelope.state() == DeliveryState::Failed)
                .collect();
            failed.sort_by_key(|record| record.updated_at);
            Ok(failed)
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn purge_failed(&self, id: EnvelopeId) -> Result<bool, SpoolError> {
        let guard = self.inner.write_lock.clone().lock_owned().await;
        let records = self.inner.records.clone();

        blocking(move || {
            let _guard = guard;
            let record = read_record(&records, id)?.ok_or_else(|| SpoolError::not_found(id))?;
            if record.envelope.state() != DeliveryState::Failed {
                return Ok(false);
            }
            fs::remove_file(record_path(&records, id))?;
            sync_dir(&records)?;
            tracing::info!(envelope_id = %id, "Purged failed spool record");
            Ok(true)
        })
        .await
    }

    async fn stats(&self) -> Result<SpoolStats, SpoolError> {
        let records = self.inner.records.clone();
        let corrupt = self.inner.corrupt.clone();

        blocking(move || {
            let mut stats = SpoolStats::default();
            for record in Self::scan(&records, &corrupt)? {
                stats.count(record.envelope.state());
            }
            Ok(stats)
        })
        .await
    }
}

/// Run blocking disk work off the reactor, inside the caller's span.
///
/// The closure runs to completion even if the awaiting future is dropped, so
/// a flush is never cut short.
async fn blocking<T, F>(f: F) -> Result<T, SpoolError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SpoolError> + Send + 'static,
{
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(f))
        .await
        .map_err(|e| SpoolError::io(io::Error::other(e)))?
}

fn record_path(records: &Path, id: EnvelopeId) -> PathBuf {
    records.join(format!("{id}.{RECORD_EXT}"))
}

fn write_record(records: &Path, record: &SpoolRecord) -> Result<(), SpoolError> {
    let id = record.envelope.id();
    let body = serde_json::to_vec(record)?;
    let tmp = records.join(format!("{id}.{TMP_EXT}"));

    {
        let mut file = File::create(&tmp)?;
        file.write_all(&encode_frame(&body))?;
        file.sync_all()?;
    }
    fs::rename(&tmp, record_path(records, id))?;
    sync_dir(records)?;
    Ok(())
}

/// Read one record by id. Missing and invalid records are both absent.
fn read_record(records: &Path, id: EnvelopeId) -> Result<Option<SpoolRecord>, SpoolError> {
    let path = record_path(records, id);
    if !path.exists() {
        return Ok(None);
    }
    match decode_file(&path)? {
        Ok(record) => Ok(Some(record)),
        Err(reason) => {
            tracing::warn!(envelope_id = %id, %reason, "Ignoring unreadable spool record");
            Ok(None)
        }
    }
}

/// Outer error is I/O, inner error is a validation failure.
fn decode_file(path: &Path) -> Result<Result<SpoolRecord, FrameError>, SpoolError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(Err(FrameError::Vanished));
        }
        Err(err) => return Err(err.into()),
    };

    let body = match decode_frame(&bytes) {
        Ok(body) => body,
        Err(err) => return Ok(Err(err)),
    };
    let record: SpoolRecord = match serde_json::from_slice(body) {
        Ok(record) => record,
        Err(err) => return Ok(Err(FrameError::Body(err.to_string()))),
    };

    let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or_default();
    if stem != record.envelope.id().to_string() {
        return Ok(Err(FrameError::IdMismatch));
    }
    Ok(Ok(record))
}

fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_BYTES + body.len() + DIGEST_BYTES);
    frame.extend_from_slice(MAGIC);
    frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
    frame.extend_from_slice(body);
    frame.extend_from_slice(&Sha256::digest(body));
    frame
}

fn decode_frame(bytes: &[u8]) -> Result<&[u8], FrameError> {
    if bytes.len() < HEADER_BYTES + DIGEST_BYTES {
        return Err(FrameError::Truncated);
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(FrameError::BadMagic);
    }

    let mut len = [0u8; LEN_BYTES];
    len.copy_from_slice(&bytes[MAGIC.len()..HEADER_BYTES]);
    let len = usize::try_from(u64::from_be_bytes(len)).map_err(|_| FrameError::Truncated)?;
    let expected = HEADER_BYTES
        .checked_add(len)
        .and_then(|n| n.checked_add(DIGEST_BYTES))
        .ok_or(FrameError::Truncated)?;
    if bytes.len() != expected {
        return Err(FrameError::Truncated);
    }

    let body = &bytes[HEADER_BYTES..HEADER_BYTES + len];
    let digest = &bytes[HEADER_BYTES + len..];
    if Sha256::digest(body).as_slice() != digest {
        return Err(FrameError::Checksum);
    }
    Ok(body)
}

#[derive(Debug)]
enum FrameError {
    Truncated,
    BadMagic,
    Checksum,
    Body(String),
    IdMismatch,
    Vanished,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "truncated frame"),
            FrameError::BadMagic => write!(f, "bad magic"),
            FrameError::Checksum => write!(f, "checksum mismatch"),
            FrameError::Body(err) => write!(f, "undecodable body: {err}"),
            FrameError::IdMismatch => write!(f, "file name does not match envelope id"),
            FrameError::Vanished => write!(f, "file removed while reading"),
        }
    }
}

fn quarantine(path: &Path, corrupt: &Path, reason: &FrameError) -> Result<(), SpoolError> {
    if matches!(reason, FrameError::Vanished) {
        return Ok(());
    }
    let Some(name) = path.file_name() else {
        return Ok(());
    };
    tracing::warn!(path = %path.display(), %reason, "Quarantining corrupt spool record");
    fs::rename(path, corrupt.join(name))?;
    Ok(())
}

fn remove_leftovers(records: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(records)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(TMP_EXT) {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        sync_dir(records)?;
    }
    Ok(removed)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn spool() -> (TempDir, FileSpool) {
        let dir = TempDir::new().unwrap();
        let spool = FileSpool::open(dir.path()).await.unwrap();
        (dir, spool)
    }

    #[tokio::test]
    async fn persisted_record_survives_reopen() {
        let (dir, spool) = spool().await;
        let envelope = Envelope::new(MessageKind::Command, "orders", b"P1".to_vec());
        spool.persist(&envelope).await.unwrap();
        drop(spool);

        let reopened = FileSpool::open(dir.path()).await.unwrap();
        let pending = reopened.load_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload(), b"P1");
        assert_eq!(pending[0].state(), DeliveryState::Pending);
    }

    #[tokio::test]
    async fn in_flight_is_replayed_as_pending() {
        let (dir, spool) = spool().await;
        let envelope = Envelope::new(MessageKind::Task, "jobs", vec![7]);
        spool.persist(&envelope).await.unwrap();
        spool.mark_in_flight(envelope.id()).await.unwrap().unwrap();
        drop(spool);

        let reopened = FileSpool::open(dir.path()).await.unwrap();
        let pending = reopened.load_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state(), DeliveryState::Pending);
        assert_eq!(pending[0].attempt_count(), 1);

        // the downgrade is on disk, so the next attempt can start
        let next = reopened.mark_in_flight(envelope.id()).await.unwrap().unwrap();
        assert_eq!(next.attempt_count(), 2);
    }

    #[tokio::test]
    async fn torn_writes_are_treated_as_absent() {
        let (dir, spool) = spool().await;
        let good = Envelope::new(MessageKind::Event, "audit", b"ok".to_vec());
        spool.persist(&good).await.unwrap();

        // a write interrupted before its rename
        let torn = Envelope::new(MessageKind::Event, "audit", b"torn".to_vec());
        let records = spool.records_dir().to_path_buf();
        fs::write(records.join(format!("{}.tmp", torn.id())), b"AOR1\0\0").unwrap();

        // a renamed file whose contents never fully reached the disk
        let record = SpoolRecord::new(torn.clone());
        let frame = encode_frame(&serde_json::to_vec(&record).unwrap());
        fs::write(record_path(&records, torn.id()), &frame[..frame.len() - 10]).unwrap();
        drop(spool);

        let reopened = FileSpool::open(dir.path()).await.unwrap();
        let pending = reopened.load_pending().await.unwrap();
        assert_eq!(pending.iter().map(Envelope::id).collect::<Vec<_>>(), vec![good.id()]);
        assert!(reopened.get(torn.id()).await.unwrap().is_none());
        assert!(!records.join(format!("{}.tmp", torn.id())).exists());
        assert!(dir.path().join("corrupt").join(format!("{}.rec", torn.id())).exists());
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let record = SpoolRecord::new(Envelope::new(MessageKind::Notify, "mail", vec![1, 2]));
        let mut frame = encode_frame(&serde_json::to_vec(&record).unwrap());
        let middle = frame.len() / 2;
        frame[middle] ^= 0xff;
        assert!(matches!(decode_frame(&frame), Err(FrameError::Checksum)));
    }

    #[tokio::test]
    async fn mark_delivered_is_idempotent() {
        let (_dir, spool) = spool().await;
        let envelope = Envelope::new(MessageKind::Command, "orders", vec![]);
        spool.persist(&envelope).await.unwrap();
        spool.mark_in_flight(envelope.id()).await.unwrap();

        spool.mark_delivered(envelope.id()).await.unwrap();
        let first = spool.get(envelope.id()).await.unwrap().unwrap();
        spool.mark_delivered(envelope.id()).await.unwrap();
        let second = spool.get(envelope.id()).await.unwrap().unwrap();
        assert_eq!(first, second);

        // delivered never reverts
        spool.mark_failed(envelope.id(), "late failure").await.unwrap();
        let after = spool.get(envelope.id()).await.unwrap().unwrap();
        assert_eq!(after.envelope.state(), DeliveryState::Delivered);
    }

    #[tokio::test]
    async fn duplicate_persist_is_rejected() {
        let (_dir, spool) = spool().await;
        let envelope = Envelope::new(MessageKind::Command, "orders", vec![]);
        spool.persist(&envelope).await.unwrap();
        assert!(spool.persist(&envelope).await.is_err());
    }

    #[tokio::test]
    async fn sweep_keeps_failed_and_recent_records() {
        let (_dir, spool) = spool().await;
        let delivered = Envelope::new(MessageKind::Event, "a", vec![]);
        let failed = Envelope::new(MessageKind::Event, "a", vec![]);
        let pending = Envelope::new(MessageKind::Event, "a", vec![]);
        for envelope in [&delivered, &failed, &pending] {
            spool.persist(envelope).await.unwrap();
        }
        spool.mark_in_flight(delivered.id()).await.unwrap();
        spool.mark_delivered(delivered.id()).await.unwrap();
        spool.mark_in_flight(failed.id()).await.unwrap();
        spool.mark_failed(failed.id(), "exhausted").await.unwrap();

        let keep_all = RetentionPolicy::new(Duration::from_secs(3600));
        assert_eq!(spool.retention_sweep(&keep_all).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let sweep_all = RetentionPolicy::new(Duration::from_millis(1));
        assert_eq!(spool.retention_sweep(&sweep_all).await.unwrap(), 1);

        let stats = spool.stats().await.unwrap();
        assert_eq!(
            stats,
            SpoolStats {
                pending: 1,
                in_flight: 0,
                delivered: 0,
                failed: 1,
            }
        );
        let failed_records = spool.failed().await.unwrap();
        assert_eq!(failed_records.len(), 1);
        assert_eq!(failed_records[0].failure_reason.as_deref(), Some("exhausted"));
    }

    #[tokio::test]
    async fn replay_follows_creation_order() {
        let (_dir, spool) = spool().await;
        let mut ids = Vec::new();
        for n in 0..5u8 {
            let envelope = Envelope::new(MessageKind::Task, "jobs", vec![n]);
            ids.push(envelope.id());
            spool.persist(&envelope).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let loaded: Vec<_> = spool
            .load_pending()
            .await
            .unwrap()
            .iter()
            .map(Envelope::id)
            .collect();
        assert_eq!(loaded, ids);
    }

    #[tokio::test]
    async fn pending_scan_leaves_in_flight_records_alone() {
        let (_dir, spool) = spool().await;
        let waiting = Envelope::new(MessageKind::Event, "audit", vec![1]);
        let sending = Envelope::new(MessageKind::Event, "audit", vec![2]);
        spool.persist(&waiting).await.unwrap();
        spool.persist(&sending).await.unwrap();
        spool.mark_in_flight(sending.id()).await.unwrap().unwrap();

        let pending = spool.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), waiting.id());
        let record = spool.get(sending.id()).await.unwrap().unwrap();
        assert_eq!(record.envelope.state(), DeliveryState::InFlight);
    }

    #[tokio::test]
    async fn records_from_another_handle_are_visible() {
        let (dir, spool) = spool().await;
        let producer = FileSpool::open(dir.path()).await.unwrap();
        let envelope = Envelope::new(MessageKind::Notify, "alerts", b"disk".to_vec());
        producer.persist(&envelope).await.unwrap();

        let pending = spool.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload(), b"disk");
    }
}
