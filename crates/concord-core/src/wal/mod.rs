//! Write-ahead log
//!
//! Every coordinator and participant state transition is appended here
//! before it is acted on. A single writer per log is enforced by the
//! inner mutex; appends are assigned strictly increasing sequence numbers
//! and are durable when [`Wal::append`] returns.
//!
//! Appended records are also published on a broadcast channel so the
//! replication manager can stream them to standbys in append order.

pub mod log_file;
pub mod record;

pub use log_file::LogFile;
pub use record::{StateTag, TxnTransition, WalRecord};

use crate::config::WalConfig;
use crate::metrics::Metrics;
use crate::{Error, Result, now_ms};
use concord_protocol::TxnId;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Capacity of the append notification channel
const UPDATE_CHANNEL_CAPACITY: usize = 4096;

struct WalInner {
    file: Option<LogFile<WalRecord>>,
    records: VecDeque<WalRecord>,
    next_sequence: u64,
}

/// Durable, append-only transition log
pub struct Wal {
    name: String,
    config: WalConfig,
    inner: Mutex<WalInner>,
    durable: AtomicU64,
    fenced: AtomicBool,
    updates: broadcast::Sender<WalRecord>,
    metrics: Option<Arc<Metrics>>,
}

impl Wal {
    /// Open a file-backed log, replaying whatever survived on disk
    pub fn open(path: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let path = path.as_ref();
        let (file, records) =
            LogFile::<WalRecord>::open(path, config.sync_on_append, config.max_record_bytes)?;

        let mut last = file.base();
        for record in &records {
            if record.sequence <= last {
                return Err(Error::wal(format!(
                    "sequence {} out of order after {} in {}",
                    record.sequence,
                    last,
                    path.display()
                )));
            }
            last = record.sequence;
        }

        tracing::info!(
            "Opened WAL {} with {} records (durable sequence {})",
            path.display(),
            records.len(),
            last
        );

        Ok(Self::build(
            path.display().to_string(),
            config,
            Some(file),
            records.into(),
            last,
        ))
    }

    /// A log kept only in memory
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::build(name.into(), WalConfig::default(), None, VecDeque::new(), 0)
    }

    fn build(
        name: String,
        config: WalConfig,
        file: Option<LogFile<WalRecord>>,
        records: VecDeque<WalRecord>,
        last: u64,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            name,
            config,
            inner: Mutex::new(WalInner {
                file,
                records,
                next_sequence: last + 1,
            }),
            durable: AtomicU64::new(last),
            fenced: AtomicBool::new(false),
            updates,
            metrics: None,
        }
    }

    /// Count appends in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a transition for `txn`, returning its sequence number
    pub fn append(&self, txn: TxnId, transition: TxnTransition) -> Result<u64> {
        self.append_with(|_| (txn, transition)).map(|r| r.sequence)
    }

    /// Append a record whose transaction id depends on its sequence number
    pub fn append_with<F>(&self, build: F) -> Result<WalRecord>
    where
        F: FnOnce(u64) -> (TxnId, TxnTransition),
    {
        self.check_fenced()?;

        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence;
        let (txn, transition) = build(sequence);
        let record = WalRecord {
            sequence,
            txn,
            transition,
            timestamp_ms: now_ms(),
        };

        self.persist(&mut inner, record.clone())?;
        Ok(record)
    }

    /// Apply a record produced by a primary, keeping its sequence number.
    ///
    /// Returns `false` for a record already applied.
    pub fn append_replicated(&self, record: WalRecord) -> Result<bool> {
        let previous = record.sequence.saturating_sub(1);
        self.append_replicated_after(previous, record)
    }

    /// Like [`Wal::append_replicated`], where `previous` is the sequence of
    /// the primary record preceding this one. Sequences between the two
    /// were compacted away on the primary and are skipped.
    pub fn append_replicated_after(&self, previous: u64, record: WalRecord) -> Result<bool> {
        self.check_fenced()?;

        let mut inner = self.inner.lock();
        if record.sequence < inner.next_sequence {
            return Ok(false);
        }
        if previous >= inner.next_sequence {
            return Err(Error::replication(format!(
                "gap in {}: expected sequence {}, got {} after {}",
                self.name, inner.next_sequence, record.sequence, previous
            )));
        }

        self.persist(&mut inner, record)?;
        Ok(true)
    }

    fn persist(&self, inner: &mut WalInner, record: WalRecord) -> Result<()> {
        if let Some(file) = inner.file.as_mut() {
            if let Err(e) = file.append(&record) {
                self.fence(&format!("append of sequence {} failed: {}", record.sequence, e));
                return Err(Error::wal(format!("{}: {}", self.name, e)));
            }
        }

        let sequence = record.sequence;
        inner.next_sequence = sequence + 1;
        inner.records.push_back(record.clone());
        self.durable.store(sequence, Ordering::Release);
        if let Some(metrics) = &self.metrics {
            Metrics::incr(&metrics.wal_appends);
        }

        // Sent under the lock so subscribers observe append order
        let _ = self.updates.send(record);
        Ok(())
    }

    /// Records with `sequence >= from`, in append order
    pub fn replay(&self, from: u64) -> Result<Vec<WalRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .iter()
            .filter(|r| r.sequence >= from)
            .cloned()
            .collect())
    }

    /// Drop records below `before` that belong to retired transactions.
    ///
    /// A transaction is retired once its `Completed` (coordinator) or
    /// `Applied` (participant) record is itself below `before` and older
    /// than the configured retention. Returns the number of records removed.
    pub fn compact(&self, before: u64) -> Result<usize> {
        self.compact_retaining(before, |_| false)
    }

    /// Like [`Wal::compact`], but a transaction whose retiring record
    /// satisfies `retain` keeps all of its records.
    pub fn compact_retaining<F>(&self, before: u64, retain: F) -> Result<usize>
    where
        F: Fn(&WalRecord) -> bool,
    {
        self.check_fenced()?;

        let mut inner = self.inner.lock();
        let retention_ms = self.config.retention.as_millis() as u64;
        let cutoff_ms = now_ms().saturating_sub(retention_ms);

        let retired: HashSet<TxnId> = inner
            .records
            .iter()
            .filter(|r| r.sequence < before && r.retires() && r.timestamp_ms <= cutoff_ms)
            .filter(|r| !retain(r))
            .map(|r| r.txn)
            .collect();
        if retired.is_empty() {
            return Ok(0);
        }

        let kept: VecDeque<WalRecord> = inner
            .records
            .iter()
            .filter(|r| !(r.sequence < before && retired.contains(&r.txn)))
            .cloned()
            .collect();
        let removed = inner.records.len() - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let base = inner.next_sequence - 1;
        if let Some(file) = inner.file.as_mut() {
            let kept_slice: Vec<WalRecord> = kept.iter().cloned().collect();
            if let Err(e) = file.rewrite(base, &kept_slice) {
                self.fence(&format!("compaction failed: {}", e));
                return Err(e);
            }
        }
        inner.records = kept;

        tracing::info!(
            "Compacted {}: removed {} records of {} retired transactions",
            self.name,
            removed,
            retired.len()
        );
        Ok(removed)
    }

    /// Discard every record and continue numbering after `base`.
    ///
    /// Used when a node rejoins as a standby and must re-replicate from
    /// the current primary.
    pub fn reset(&self, base: u64) -> Result<()> {
        self.check_fenced()?;

        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.as_mut() {
            file.rewrite(base, &[])?;
        }
        inner.records.clear();
        inner.next_sequence = base + 1;
        self.durable.store(base, Ordering::Release);
        tracing::info!("Reset {} to base sequence {}", self.name, base);
        Ok(())
    }

    /// Highest sequence number that is durable
    pub fn durable_sequence(&self) -> u64 {
        self.durable.load(Ordering::Acquire)
    }

    /// Sequence of the oldest retained record, or the next sequence if empty
    pub fn first_sequence(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .records
            .front()
            .map(|r| r.sequence)
            .unwrap_or(inner.next_sequence)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream of records appended from now on
    pub fn subscribe(&self) -> broadcast::Receiver<WalRecord> {
        self.updates.subscribe()
    }

    /// Refuse every further write
    pub fn fence(&self, reason: &str) {
        if !self.fenced.swap(true, Ordering::AcqRel) {
            tracing::error!("WAL {} fenced: {}", self.name, reason);
        }
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::Acquire)
    }

    fn check_fenced(&self) -> Result<()> {
        if self.is_fenced() {
            return Err(Error::fenced(self.name.clone()));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_append(&self) {
        if let Some(file) = self.inner.lock().file.as_mut() {
            file.fail_next_append();
        }
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("name", &self.name)
            .field("durable", &self.durable_sequence())
            .field("fenced", &self.is_fenced())
            .finish()
    }
}
