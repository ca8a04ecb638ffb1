//! Self-describing audit records and their framing
//!
//! Every record names its kind, carries a wall-clock timestamp and the
//! checksum of its payload. On disk records are framed WAL-style:
//!
//! ```text
//! +-------------+------------------+-------------------+
//! | len: u32 LE | record (bincode) | crc32: u32 LE     |
//! +-------------+------------------+-------------------+
//! ```
//!
//! A reader stops at the first frame that is short or fails its checksum;
//! everything before it is intact.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use hotswap_core::{ModuleId, TxnId};
use hotswap_engine::{CircuitEvent, ConflictEvent, HealthEvent, RecoveryAction, TransactionEvent};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes of framing around each record
pub const FRAME_OVERHEAD: usize = 8;

/// Frames claiming more than this are treated as corrupt
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// What an audit record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuditKind {
    Transaction,
    Conflict,
    Recovery,
    Circuit,
    Health,
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditKind::Transaction => "transaction",
            AuditKind::Conflict => "conflict",
            AuditKind::Recovery => "recovery",
            AuditKind::Circuit => "circuit",
            AuditKind::Health => "health",
        };
        f.write_str(name)
    }
}

/// Body of an audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuditPayload {
    Transaction(TransactionEvent),
    Conflict(ConflictEvent),
    Recovery(RecoveryAction),
    Circuit(CircuitEvent),
    Health(HealthEvent),
}

impl AuditPayload {
    pub fn kind(&self) -> AuditKind {
        match self {
            AuditPayload::Transaction(_) => AuditKind::Transaction,
            AuditPayload::Conflict(_) => AuditKind::Conflict,
            AuditPayload::Recovery(_) => AuditKind::Recovery,
            AuditPayload::Circuit(_) => AuditKind::Circuit,
            AuditPayload::Health(_) => AuditKind::Health,
        }
    }

    /// Transaction the record concerns, if any
    pub fn txn(&self) -> Option<TxnId> {
        match self {
            AuditPayload::Transaction(event) => Some(event.txn()),
            AuditPayload::Conflict(event) => Some(event.txn),
            AuditPayload::Recovery(action) => action.txn,
            AuditPayload::Circuit(_) | AuditPayload::Health(_) => None,
        }
    }

    /// Modules the record names
    pub fn modules(&self) -> Vec<ModuleId> {
        match self {
            AuditPayload::Transaction(TransactionEvent::Committed { modules, .. }) => {
                modules.clone()
            }
            AuditPayload::Transaction(_) => Vec::new(),
            AuditPayload::Conflict(event) => vec![event.module],
            AuditPayload::Recovery(action) => vec![action.module],
            AuditPayload::Circuit(event) => vec![event.module],
            AuditPayload::Health(event) => vec![event.module],
        }
    }

    pub fn touches(&self, module: ModuleId) -> bool {
        self.modules().contains(&module)
    }

    /// One-line human description
    pub fn summary(&self) -> String {
        match self {
            AuditPayload::Transaction(event) => match event {
                TransactionEvent::Started { txn, kind } => format!("{} started ({:?})", txn, kind),
                TransactionEvent::Committed {
                    txn,
                    modules,
                    commit_ts,
                    duration_us,
                } => format!(
                    "{} committed {} module(s) at ts {} in {}us",
                    txn,
                    modules.len(),
                    commit_ts,
                    duration_us
                ),
                TransactionEvent::Aborted { txn, reason } => {
                    format!("{} aborted: {}", txn, reason)
                }
                TransactionEvent::Failed {
                    txn,
                    reason,
                    rolled_back,
                } => format!("{} failed (rolled back: {}): {}", txn, rolled_back, reason),
            },
            AuditPayload::Conflict(event) => format!(
                "{} {:?} {:?} conflict on {} (auto: {})",
                event.conflict,
                event.severity,
                event.conflict_type,
                event.module,
                event.auto_resolvable
            ),
            AuditPayload::Recovery(action) => format!(
                "{} {:?} on {} for {:?}/{:?}: {} in {}us",
                action.id,
                action.strategy,
                action.module,
                action.category,
                action.severity,
                if action.success { "ok" } else { "failed" },
                action.duration_us
            ),
            AuditPayload::Circuit(event) => {
                format!("circuit {} {} -> {}", event.module, event.from, event.to)
            }
            AuditPayload::Health(event) => format!(
                "{} {:?} -> {:?} (p={:.2}): {}",
                event.module,
                event.previous,
                event.status,
                event.failure_probability,
                event.message
            ),
        }
    }
}

/// One entry of the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Log sequence number, dense and increasing per log
    pub lsn: u64,
    pub kind: AuditKind,
    pub timestamp: DateTime<Utc>,
    /// Sequence number the engine gave the event
    pub event_seq: u64,
    pub payload: AuditPayload,
    /// crc32 of the encoded payload
    pub checksum: u32,
}

impl AuditRecord {
    /// Build a record stamped with the current time
    pub fn new(lsn: u64, event_seq: u64, payload: AuditPayload) -> Result<Self> {
        Self::at(lsn, event_seq, Utc::now(), payload)
    }

    pub fn at(
        lsn: u64,
        event_seq: u64,
        timestamp: DateTime<Utc>,
        payload: AuditPayload,
    ) -> Result<Self> {
        Ok(Self {
            lsn,
            kind: payload.kind(),
            timestamp,
            event_seq,
            checksum: payload_checksum(&payload)?,
            payload,
        })
    }

    /// Whether kind and checksum still agree with the payload
    pub fn verify(&self) -> bool {
        self.kind == self.payload.kind()
            && payload_checksum(&self.payload).is_ok_and(|crc| crc == self.checksum)
    }

    /// Encode as one length-prefixed, checksummed frame
    pub fn encode_frame(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))?;
        if body.len() > MAX_RECORD_LEN {
            return Err(Error::Serialization(format!(
                "record {} is {} bytes, limit is {}",
                self.lsn,
                body.len(),
                MAX_RECORD_LEN
            )));
        }
        let mut frame = Vec::with_capacity(body.len() + FRAME_OVERHEAD);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        Ok(frame)
    }
}

fn payload_checksum(payload: &AuditPayload) -> Result<u32> {
    let bytes = bincode::serialize(payload).map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(crc32fast::hash(&bytes))
}

/// Records read back from framed bytes
#[derive(Debug)]
pub struct Recovered {
    pub records: Vec<AuditRecord>,
    /// Length of the intact prefix
    pub valid_len: u64,
    /// Why reading stopped early, if it did
    pub damage: Option<Error>,
}

impl Recovered {
    pub fn is_clean(&self) -> bool {
        self.damage.is_none()
    }
}

/// Decode consecutive frames, stopping at the first damaged one
pub fn decode_frames(bytes: &[u8]) -> Recovered {
    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut damage = None;

    while offset < bytes.len() {
        let at = offset as u64;
        let rest = &bytes[offset..];
        let Some(len) = rest.get(..4).map(le_u32) else {
            damage = Some(Error::Truncated { offset: at });
            break;
        };
        let len = len as usize;
        if len > MAX_RECORD_LEN {
            damage = Some(Error::Serialization(format!(
                "frame at offset {} claims {} bytes",
                at, len
            )));
            break;
        }
        let Some(frame) = rest.get(..len + FRAME_OVERHEAD) else {
            damage = Some(Error::Truncated { offset: at });
            break;
        };

        let body = &frame[4..4 + len];
        let stored = le_u32(&frame[4 + len..]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            damage = Some(Error::ChecksumMismatch {
                offset: at,
                stored,
                computed,
            });
            break;
        }

        match bincode::deserialize::<AuditRecord>(body) {
            Ok(record) if record.verify() => records.push(record),
            Ok(record) => {
                damage = Some(Error::ChecksumMismatch {
                    offset: at,
                    stored: record.checksum,
                    computed: payload_checksum(&record.payload).unwrap_or_default(),
                });
                break;
            }
            Err(e) => {
                damage = Some(Error::Serialization(format!(
                    "record at offset {}: {}",
                    at, e
                )));
                break;
            }
        }
        offset += frame.len();
    }

    Recovered {
        records,
        valid_len: offset as u64,
        damage,
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotswap_engine::{CircuitState, TransactionKind};

    fn started(txn: u64) -> AuditPayload {
        AuditPayload::Transaction(TransactionEvent::Started {
            txn: TxnId(txn),
            kind: TransactionKind::SingleModule,
        })
    }

    fn frames(n: u64) -> Vec<u8> {
        let mut bytes = Vec::new();
        for lsn in 1..=n {
            let record = AuditRecord::new(lsn, lsn, started(lsn)).unwrap();
            bytes.extend(record.encode_frame().unwrap());
        }
        bytes
    }

    #[test]
    fn test_record_is_self_describing() {
        let record = AuditRecord::new(1, 7, started(3)).unwrap();
        assert_eq!(record.kind, AuditKind::Transaction);
        assert_eq!(record.payload.txn(), Some(TxnId(3)));
        assert!(record.verify());

        let mut tampered = record.clone();
        tampered.payload = started(4);
        assert!(!tampered.verify());
    }

    #[test]
    fn test_decode_clean_log() {
        let bytes = frames(3);
        let recovered = decode_frames(&bytes);
        assert!(recovered.is_clean());
        assert_eq!(recovered.records.len(), 3);
        assert_eq!(recovered.valid_len, bytes.len() as u64);
        assert_eq!(recovered.records[2].lsn, 3);
    }

    #[test]
    fn test_decode_stops_at_truncated_tail() {
        let bytes = frames(3);
        let cut = &bytes[..bytes.len() - 3];
        let recovered = decode_frames(cut);
        assert_eq!(recovered.records.len(), 2);
        assert!(matches!(recovered.damage, Some(Error::Truncated { .. })));
        assert!(recovered.valid_len < cut.len() as u64);
    }

    #[test]
    fn test_decode_stops_at_corrupt_frame() {
        let first = AuditRecord::new(1, 1, started(1))
            .unwrap()
            .encode_frame()
            .unwrap();
        let first_len = first.len();
        let mut bytes = first;
        for lsn in 2..=3 {
            let record = AuditRecord::new(lsn, lsn, started(lsn)).unwrap();
            bytes.extend(record.encode_frame().unwrap());
        }
        // flip a byte inside the second record's body
        bytes[first_len + 6] ^= 0xff;

        let recovered = decode_frames(&bytes);
        assert_eq!(recovered.records.len(), 1);
        assert_eq!(recovered.valid_len, first_len as u64);
        assert!(matches!(
            recovered.damage,
            Some(Error::ChecksumMismatch { offset, .. }) if offset == first_len as u64
        ));
    }

    #[test]
    fn test_summary_mentions_module() {
        let payload = AuditPayload::Circuit(CircuitEvent {
            module: ModuleId(4),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        });
        assert_eq!(payload.summary(), "circuit module:4 closed -> open");
        assert!(payload.touches(ModuleId(4)));
        assert_eq!(payload.txn(), None);
    }
}
