//! Outbound event notifications
//!
//! Every event is wrapped in a [`Record`] carrying a sequence number that
//! increases across all event categories, so consumers can order events
//! from different categories. Listeners implement [`EventSubscriber`] and
//! override only the categories they care about.
//!
//! Subscribers are called on the emitting thread after the sequence number
//! is issued and no bus lock is held, so one slow subscriber only delays
//! its own emitter. Records from concurrent emitters can arrive out of
//! sequence order; `seq` gives the total order.

use crate::breaker::CircuitState;
use crate::conflict::{ConflictSeverity, ConflictType};
use crate::health::HealthStatus;
use crate::recovery::RecoveryAction;
use crate::txn::TransactionKind;
use hotswap_core::{Clock, ConflictId, ModuleId, TxnId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An immutable, sequenced event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<E> {
    pub seq: u64,
    pub at_micros: u64,
    pub event: E,
}

/// Transaction lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransactionEvent {
    Started {
        txn: TxnId,
        kind: TransactionKind,
    },
    Committed {
        txn: TxnId,
        modules: Vec<ModuleId>,
        commit_ts: u64,
        duration_us: u64,
    },
    Aborted {
        txn: TxnId,
        reason: String,
    },
    Failed {
        txn: TxnId,
        reason: String,
        rolled_back: bool,
    },
}

impl TransactionEvent {
    pub fn txn(&self) -> TxnId {
        match self {
            TransactionEvent::Started { txn, .. }
            | TransactionEvent::Committed { txn, .. }
            | TransactionEvent::Aborted { txn, .. }
            | TransactionEvent::Failed { txn, .. } => *txn,
        }
    }
}

/// A conflict was detected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEvent {
    pub txn: TxnId,
    pub conflict: ConflictId,
    pub module: ModuleId,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub auto_resolvable: bool,
}

/// A recovery action finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub action: RecoveryAction,
}

/// A circuit breaker changed state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitEvent {
    pub module: ModuleId,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// A module's predicted health got worse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub module: ModuleId,
    pub previous: HealthStatus,
    pub status: HealthStatus,
    pub failure_probability: f64,
    pub message: String,
}

/// Listener for engine events; every method defaults to a no-op
pub trait EventSubscriber: Send + Sync {
    fn on_transaction(&self, _record: &Record<TransactionEvent>) {}
    fn on_conflict(&self, _record: &Record<ConflictEvent>) {}
    fn on_recovery(&self, _record: &Record<RecoveryEvent>) {}
    fn on_circuit(&self, _record: &Record<CircuitEvent>) {}
    fn on_health(&self, _record: &Record<HealthEvent>) {}
}

/// Fan-out of events to subscribers
pub struct EventBus {
    seq: Mutex<u64>,
    clock: Arc<dyn Clock>,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl EventBus {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            seq: Mutex::new(0),
            clock,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Last sequence number issued
    pub fn last_seq(&self) -> u64 {
        *self.seq.lock()
    }

    fn emit<E>(&self, event: E, deliver: impl Fn(&dyn EventSubscriber, &Record<E>)) {
        let (seq, at_micros) = {
            let mut seq = self.seq.lock();
            *seq += 1;
            (*seq, self.clock.now_micros())
        };
        let record = Record {
            seq,
            at_micros,
            event,
        };
        let subscribers = self.subscribers.read().clone();
        for subscriber in &subscribers {
            deliver(subscriber.as_ref(), &record);
        }
    }

    pub fn transaction(&self, event: TransactionEvent) {
        self.emit(event, |s, r| s.on_transaction(r));
    }

    pub fn conflict(&self, event: ConflictEvent) {
        self.emit(event, |s, r| s.on_conflict(r));
    }

    pub fn recovery(&self, event: RecoveryEvent) {
        self.emit(event, |s, r| s.on_recovery(r));
    }

    pub fn circuit(&self, event: CircuitEvent) {
        self.emit(event, |s, r| s.on_circuit(r));
    }

    pub fn health(&self, event: HealthEvent) {
        self.emit(event, |s, r| s.on_health(r));
    }
}

/// Any event with its record envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    Transaction(Record<TransactionEvent>),
    Conflict(Record<ConflictEvent>),
    Recovery(Record<RecoveryEvent>),
    Circuit(Record<CircuitEvent>),
    Health(Record<HealthEvent>),
}

impl EngineEvent {
    pub fn seq(&self) -> u64 {
        match self {
            EngineEvent::Transaction(r) => r.seq,
            EngineEvent::Conflict(r) => r.seq,
            EngineEvent::Recovery(r) => r.seq,
            EngineEvent::Circuit(r) => r.seq,
            EngineEvent::Health(r) => r.seq,
        }
    }
}

/// Subscriber that keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingSubscriber {
    events: Mutex<Vec<EngineEvent>>,
}

impl CollectingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn transactions(&self) -> Vec<TransactionEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Transaction(r) => Some(r.event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn circuits(&self) -> Vec<CircuitEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Circuit(r) => Some(r.event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn recoveries(&self) -> Vec<RecoveryAction> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Recovery(r) => Some(r.event.action.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSubscriber for CollectingSubscriber {
    fn on_transaction(&self, record: &Record<TransactionEvent>) {
        self.events
            .lock()
            .push(EngineEvent::Transaction(record.clone()));
    }

    fn on_conflict(&self, record: &Record<ConflictEvent>) {
        self.events.lock().push(EngineEvent::Conflict(record.clone()));
    }

    fn on_recovery(&self, record: &Record<RecoveryEvent>) {
        self.events.lock().push(EngineEvent::Recovery(record.clone()));
    }

    fn on_circuit(&self, record: &Record<CircuitEvent>) {
        self.events.lock().push(EngineEvent::Circuit(record.clone()));
    }

    fn on_health(&self, record: &Record<HealthEvent>) {
        self.events.lock().push(EngineEvent::Health(record.clone()));
    }
}
