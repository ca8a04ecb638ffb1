//! Append-only audit log
//!
//! [`AuditLog`] subscribes to the engine's event bus and turns every
//! transaction outcome, conflict, recovery action, breaker transition and
//! health alert into an [`AuditRecord`]. Records are kept in a bounded
//! in-memory window and, when the log was opened on a file, appended to it
//! as checksummed frames.
//!
//! File writes happen on a dedicated writer thread. Appending only encodes
//! the frame and queues it, so an event callback never waits on `flush` or
//! `fsync`. [`AuditLog::sync`] waits for everything queued so far to reach
//! the disk; dropping the log drains the queue.
//!
//! Reopening a file resumes after the last intact record. A damaged tail
//! (torn write, flipped bits) is cut off before new records are appended.

use crate::record::{decode_frames, AuditPayload, AuditRecord, Recovered};
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use hotswap_engine::{
    CircuitEvent, ConflictEvent, EventSubscriber, HealthEvent, Record, RecoveryEvent,
    TransactionEvent,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Records kept in memory (0 = unlimited)
    pub max_in_memory: usize,
    /// fsync the file every N records (0 = flush only)
    pub sync_every: usize,
    /// Record conflict events
    pub record_conflicts: bool,
    /// Record breaker transitions and health alerts
    pub record_signals: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_in_memory: 10_000,
            sync_every: 1,
            record_conflicts: true,
            record_signals: true,
        }
    }
}

impl AuditConfig {
    pub fn from_ron_str(s: &str) -> Result<Self> {
        ron::from_str(s).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Counters for an audit log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    /// Records appended since the log was opened
    pub appended: u64,
    /// Records read back from an existing file
    pub recovered: u64,
    /// Bytes of a damaged tail cut off on open
    pub truncated_bytes: u64,
    pub bytes_written: u64,
    pub write_errors: u64,
    /// Records dropped from the in-memory window
    pub evicted: u64,
}

enum Command {
    Frame(Vec<u8>),
    Sync(Sender<Result<()>>),
}

struct FileSink {
    writer: BufWriter<File>,
    unsynced: usize,
}

impl FileSink {
    fn write(&mut self, frame: &[u8], sync_every: usize) -> Result<()> {
        self.writer.write_all(frame)?;
        self.writer.flush()?;
        self.unsynced += 1;
        if sync_every > 0 && self.unsynced >= sync_every {
            self.sync()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.unsynced = 0;
        Ok(())
    }
}

/// Handle on the thread that owns the file
struct Writer {
    path: PathBuf,
    tx: Sender<Command>,
    handle: JoinHandle<()>,
}

impl Writer {
    fn spawn(
        path: PathBuf,
        file: File,
        sync_every: usize,
        stats: Arc<Mutex<AuditStats>>,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = FileSink {
            writer: BufWriter::new(file),
            unsynced: 0,
        };
        let name = path.display().to_string();
        let handle = std::thread::Builder::new()
            .name("audit-writer".into())
            .spawn(move || write_loop(sink, rx, sync_every, stats, name))?;
        Ok(Self { path, tx, handle })
    }
}

fn write_loop(
    mut sink: FileSink,
    rx: Receiver<Command>,
    sync_every: usize,
    stats: Arc<Mutex<AuditStats>>,
    path: String,
) {
    for command in rx.iter() {
        match command {
            Command::Frame(frame) => match sink.write(&frame, sync_every) {
                Ok(()) => stats.lock().bytes_written += frame.len() as u64,
                Err(e) => {
                    stats.lock().write_errors += 1;
                    warn!(%path, error = %e, "audit write failed");
                }
            },
            Command::Sync(reply) => {
                let _ = reply.send(sink.sync());
            }
        }
    }
    if let Err(e) = sink.sync() {
        warn!(%path, error = %e, "final audit sync failed");
    }
    debug!(%path, "audit writer stopped");
}

struct Inner {
    entries: VecDeque<AuditRecord>,
    next_lsn: u64,
}

/// Audit log of engine events
pub struct AuditLog {
    config: AuditConfig,
    inner: Mutex<Inner>,
    stats: Arc<Mutex<AuditStats>>,
    writer: Option<Writer>,
}

impl AuditLog {
    /// Log kept only in memory
    pub fn in_memory(config: AuditConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_lsn: 1,
            }),
            stats: Arc::new(Mutex::new(AuditStats::default())),
            writer: None,
        }
    }

    /// Open or create a file-backed log
    pub fn open(path: impl AsRef<Path>, config: AuditConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut stats = AuditStats::default();
        let mut entries = VecDeque::new();
        let mut next_lsn = 1;

        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let recovered = decode_frames(&bytes);
            if let Some(damage) = &recovered.damage {
                warn!(
                    path = %path.display(),
                    valid_len = recovered.valid_len,
                    file_len = bytes.len(),
                    error = %damage,
                    "audit log has a damaged tail; truncating"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(recovered.valid_len)?;
                file.sync_all()?;
                stats.truncated_bytes = bytes.len() as u64 - recovered.valid_len;
            }
            stats.recovered = recovered.records.len() as u64;
            if let Some(last) = recovered.records.last() {
                next_lsn = last.lsn + 1;
            }
            entries.extend(recovered.records);
            while config.max_in_memory > 0 && entries.len() > config.max_in_memory {
                entries.pop_front();
                stats.evicted += 1;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(
            path = %path.display(),
            recovered = stats.recovered,
            next_lsn,
            "audit log opened"
        );

        let stats = Arc::new(Mutex::new(stats));
        let writer = Writer::spawn(path, file, config.sync_every, Arc::clone(&stats))?;
        Ok(Self {
            config,
            inner: Mutex::new(Inner { entries, next_lsn }),
            stats,
            writer: Some(writer),
        })
    }

    /// Read every intact record of a log file without opening it for writing
    pub fn read_file(path: impl AsRef<Path>) -> Result<Recovered> {
        let bytes = std::fs::read(path)?;
        Ok(decode_frames(&bytes))
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Append a record and return its lsn
    ///
    /// For a file-backed log the frame is queued for the writer thread and
    /// frames reach the file in lsn order. Write failures are counted in
    /// [`AuditStats::write_errors`]; the record stays in memory either way.
    pub fn append(&self, event_seq: u64, payload: AuditPayload) -> Result<u64> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        let record = AuditRecord::new(lsn, event_seq, payload)?;
        if let Some(writer) = &self.writer {
            let frame = record.encode_frame()?;
            writer
                .tx
                .send(Command::Frame(frame))
                .map_err(|_| Error::WriterStopped)?;
        }
        inner.next_lsn += 1;
        inner.entries.push_back(record);

        let mut stats = self.stats.lock();
        stats.appended += 1;
        if self.config.max_in_memory > 0 && inner.entries.len() > self.config.max_in_memory {
            inner.entries.pop_front();
            stats.evicted += 1;
        }
        debug!(lsn, "audit record appended");
        Ok(lsn)
    }

    /// Snapshot of the in-memory window, oldest first
    pub fn entries(&self) -> Vec<AuditRecord> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Lsn the next record will get
    pub fn next_lsn(&self) -> u64 {
        self.inner.lock().next_lsn
    }

    pub fn stats(&self) -> AuditStats {
        *self.stats.lock()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.writer.as_ref().map(|w| w.path.clone())
    }

    /// Wait until every queued record is written, then fsync the file
    pub fn sync(&self) -> Result<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };
        let (reply, done) = crossbeam_channel::bounded(1);
        writer
            .tx
            .send(Command::Sync(reply))
            .map_err(|_| Error::WriterStopped)?;
        done.recv().map_err(|_| Error::WriterStopped)?
    }

    fn record(&self, event_seq: u64, payload: AuditPayload) {
        let kind = payload.kind();
        if let Err(e) = self.append(event_seq, payload) {
            warn!(seq = event_seq, %kind, error = %e, "failed to persist audit record");
        }
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        if let Some(Writer { path, tx, handle }) = self.writer.take() {
            drop(tx);
            if handle.join().is_err() {
                warn!(path = %path.display(), "audit writer panicked");
            }
        }
    }
}

impl EventSubscriber for AuditLog {
    fn on_transaction(&self, record: &Record<TransactionEvent>) {
        self.record(record.seq, AuditPayload::Transaction(record.event.clone()));
    }

    fn on_conflict(&self, record: &Record<ConflictEvent>) {
        if self.config.record_conflicts {
            self.record(record.seq, AuditPayload::Conflict(record.event.clone()));
        }
    }

    fn on_recovery(&self, record: &Record<RecoveryEvent>) {
        self.record(record.seq, AuditPayload::Recovery(record.event.action.clone()));
    }

    fn on_circuit(&self, record: &Record<CircuitEvent>) {
        if self.config.record_signals {
            self.record(record.seq, AuditPayload::Circuit(record.event.clone()));
        }
    }

    fn on_health(&self, record: &Record<HealthEvent>) {
        if self.config.record_signals {
            self.record(record.seq, AuditPayload::Health(record.event.clone()));
        }
    }
}
