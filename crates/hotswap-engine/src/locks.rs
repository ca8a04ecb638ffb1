//! Per-module intent locks
//!
//! A transaction takes a write intent on a module at its first write and
//! keeps it until commit or abort, so two transactions never write the same
//! module at once.
//!
//! Deadlocks are avoided by ordering: a transaction may block only on a
//! module id greater than every id it already holds. Anything else is a
//! try-lock that fails with [`Error::LockOrder`] when contended.

use crate::{Error, Result};
use hotswap_core::{ModuleId, TxnId};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Table of module write intents
#[derive(Debug, Default)]
pub struct IntentLocks {
    holders: Mutex<HashMap<ModuleId, TxnId>>,
    released: Condvar,
}

impl IntentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `module` for `txn`, given the modules `txn` already holds
    ///
    /// Returns the time spent waiting.
    pub fn acquire(
        &self,
        txn: TxnId,
        module: ModuleId,
        held: &BTreeSet<ModuleId>,
        timeout: Duration,
    ) -> Result<Duration> {
        let started = Instant::now();
        let mut holders = self.holders.lock();
        let in_order = held.last().map_or(true, |max| module > *max);
        let deadline = started + timeout;

        loop {
            match holders.get(&module) {
                None => {
                    holders.insert(module, txn);
                    return Ok(started.elapsed());
                }
                Some(owner) if *owner == txn => return Ok(Duration::ZERO),
                Some(owner) => {
                    if !in_order {
                        return Err(Error::LockOrder { txn, module });
                    }
                    let holder = *owner;
                    if self.released.wait_until(&mut holders, deadline).timed_out()
                        && holders.get(&module).is_some_and(|o| *o != txn)
                    {
                        return Err(Error::IntentTimeout { module, holder });
                    }
                }
            }
        }
    }

    /// Release every module held by `txn`
    pub fn release_all(&self, txn: TxnId, modules: &BTreeSet<ModuleId>) {
        let mut holders = self.holders.lock();
        for module in modules {
            if holders.get(module) == Some(&txn) {
                holders.remove(module);
            }
        }
        drop(holders);
        self.released.notify_all();
    }

    /// Current holder of `module`
    pub fn holder(&self, module: ModuleId) -> Option<TxnId> {
        self.holders.lock().get(&module).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_and_reenter() {
        let locks = IntentLocks::new();
        let m = ModuleId(1);
        let none = BTreeSet::new();
        locks.acquire(TxnId(1), m, &none, Duration::ZERO).unwrap();
        locks.acquire(TxnId(1), m, &none, Duration::ZERO).unwrap();
        assert_eq!(locks.holder(m), Some(TxnId(1)));
    }

    #[test]
    fn test_contended_lock_times_out() {
        let locks = IntentLocks::new();
        let m = ModuleId(1);
        let none = BTreeSet::new();
        locks.acquire(TxnId(1), m, &none, Duration::ZERO).unwrap();
        let err = locks
            .acquire(TxnId(2), m, &none, Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, Error::IntentTimeout { holder: TxnId(1), .. }));
    }

    #[test]
    fn test_out_of_order_does_not_wait() {
        let locks = IntentLocks::new();
        let none = BTreeSet::new();
        locks.acquire(TxnId(1), ModuleId(1), &none, Duration::ZERO).unwrap();

        let held: BTreeSet<ModuleId> = [ModuleId(5)].into_iter().collect();
        let err = locks
            .acquire(TxnId(2), ModuleId(1), &held, Duration::from_secs(10))
            .unwrap_err();
        assert!(matches!(err, Error::LockOrder { .. }));

        // Uncontended out-of-order acquisition is fine
        locks.acquire(TxnId(2), ModuleId(3), &held, Duration::ZERO).unwrap();
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let locks = Arc::new(IntentLocks::new());
        let m = ModuleId(1);
        let none = BTreeSet::new();
        locks.acquire(TxnId(1), m, &none, Duration::ZERO).unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            std::thread::spawn(move || {
                locks.acquire(TxnId(2), m, &BTreeSet::new(), Duration::from_secs(5))
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        locks.release_all(TxnId(1), &[m].into_iter().collect());

        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(locks.holder(m), Some(TxnId(2)));
    }
}
