//! In-memory reference implementation of the [`PermitLedger`].
//!
//! A single `InMemoryLedger` stands in for the cluster's replicated store:
//! every in-process "member" shares one instance, and the store mutex plays
//! the role of the store's per-key atomic entry processors. Grant
//! notifications are dispatched only after the store lock is released, so a
//! listener can re-enter the ledger freely.

use std::collections::{HashMap, VecDeque, hash_map::Entry};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::ledger::{Admission, Grant, GrantListener, LedgerError, PermitLedger, RequesterId};
use crate::membership::MemberId;

/// One semaphore record: the fixed total, the current balance, who holds
/// what, and the globally-ordered wait queue.
struct Record {
    total: i64,
    available: i64,
    holders: HashMap<RequesterId, i64>,
    waiters: VecDeque<Waiter>,
}

struct Waiter {
    who: RequesterId,
    count: u32,
    seq: u64,
}

impl Record {
    fn new(total: i64) -> Self {
        Self {
            total,
            available: total,
            holders: HashMap::new(),
            waiters: VecDeque::new(),
        }
    }

    fn take(&mut self, who: RequesterId, count: u32) {
        self.available -= i64::from(count);
        *self.holders.entry(who).or_insert(0) += i64::from(count);
    }

    /// The fairness scan: grant queued entries in arrival order while the
    /// balance lasts, stopping at the first entry that cannot be satisfied.
    /// An unsatisfiable entry at the head blocks everything behind it; there
    /// is no best-fit reordering.
    fn grant_queued(&mut self, name: &str, grants: &mut Vec<Grant>) {
        while self
            .waiters
            .front()
            .is_some_and(|w| w.count > 0 && i64::from(w.count) <= self.available)
        {
            let Some(w) = self.waiters.pop_front() else {
                break;
            };
            self.take(w.who, w.count);
            grants.push(Grant {
                name: name.to_owned(),
                who: w.who,
                seq: w.seq,
            });
        }
    }
}

#[derive(Default)]
struct Store {
    records: HashMap<String, Record>,
    /// Ledger-wide arrival counter; a single counter is what makes the wait
    /// queues FIFO across members, not per member.
    next_seq: u64,
    closed: bool,
}

impl Store {
    fn record_mut(&mut self, name: &str) -> Result<&mut Record, LedgerError> {
        self.records
            .get_mut(name)
            .ok_or_else(|| LedgerError::UnknownSemaphore(name.to_owned()))
    }
}

/// The reference [`PermitLedger`], linearizable under one store mutex.
#[derive(Default)]
pub struct InMemoryLedger {
    store: Mutex<Store>,
    listeners: Mutex<Vec<Weak<dyn GrantListener>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shut the store down. Every subsequent operation fails with
    /// [`LedgerError::Unavailable`], and every registered listener is told
    /// so that parked waiters fail instead of blocking forever.
    pub fn close(&self) {
        {
            let mut store = self.store.lock();
            if store.closed {
                return;
            }
            store.closed = true;
        }
        debug!("permit store closed");
        for listener in self.alive_listeners() {
            listener.unavailable();
        }
    }

    /// Number of queued waiters on `name`. Introspection for tests and
    /// operational tooling.
    pub fn waiting(&self, name: &str) -> usize {
        self.store
            .lock()
            .records
            .get(name)
            .map_or(0, |r| r.waiters.len())
    }

    fn alive_listeners(&self) -> Vec<Arc<dyn GrantListener>> {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    /// Dispatch grants strictly after the store lock has been dropped.
    fn notify(&self, grants: Vec<Grant>) {
        if grants.is_empty() {
            return;
        }
        let listeners = self.alive_listeners();
        for grant in &grants {
            debug!(semaphore = %grant.name, who = %grant.who, seq = grant.seq, "granted queued acquisition");
            for listener in &listeners {
                listener.granted(grant);
            }
        }
    }

    /// Dispatch eviction notices strictly after the store lock has been
    /// dropped.
    fn notify_evicted(&self, evicted: Vec<(String, RequesterId, u64)>) {
        if evicted.is_empty() {
            return;
        }
        let listeners = self.alive_listeners();
        for (name, who, seq) in &evicted {
            debug!(semaphore = %name, %who, seq, "dropped queued acquisition");
            for listener in &listeners {
                listener.evicted(name, *who, *seq);
            }
        }
    }

    fn locked(&self) -> Result<parking_lot::MutexGuard<'_, Store>, LedgerError> {
        let store = self.store.lock();
        if store.closed {
            return Err(LedgerError::Unavailable);
        }
        Ok(store)
    }
}

impl PermitLedger for InMemoryLedger {
    fn create(&self, name: &str, permits: i64) -> Result<(), LedgerError> {
        let mut store = self.locked()?;
        match store.records.entry(name.to_owned()) {
            Entry::Occupied(existing) => {
                // First creation wins; a later caller's permit count is
                // discarded, even if it differs.
                if existing.get().total != permits {
                    trace!(
                        semaphore = name,
                        total = existing.get().total,
                        ignored = permits,
                        "record already exists, keeping its total"
                    );
                }
            }
            Entry::Vacant(slot) => {
                debug!(semaphore = name, permits, "created semaphore record");
                slot.insert(Record::new(permits));
            }
        }
        Ok(())
    }

    fn try_acquire(&self, name: &str, who: RequesterId, count: u32) -> Result<bool, LedgerError> {
        if count == 0 {
            return Ok(false);
        }
        let mut store = self.locked()?;
        let record = store.record_mut(name)?;
        if i64::from(count) <= record.available {
            record.take(who, count);
            trace!(semaphore = name, %who, count, "acquired permits");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn acquire_or_enqueue(
        &self,
        name: &str,
        who: RequesterId,
        count: u32,
    ) -> Result<Admission, LedgerError> {
        debug_assert!(count > 0, "zero-permit requests never enqueue");
        let mut store = self.locked()?;
        let Store {
            records, next_seq, ..
        } = &mut *store;
        let record = records
            .get_mut(name)
            .ok_or_else(|| LedgerError::UnknownSemaphore(name.to_owned()))?;

        if record.waiters.is_empty() && i64::from(count) <= record.available {
            record.take(who, count);
            trace!(semaphore = name, %who, count, "acquired permits");
            return Ok(Admission::Acquired);
        }

        let seq = *next_seq;
        *next_seq += 1;
        record.waiters.push_back(Waiter { who, count, seq });
        trace!(semaphore = name, %who, count, seq, "queued acquisition");
        Ok(Admission::Waiting(seq))
    }

    fn release(&self, name: &str, who: RequesterId, count: u32) -> Result<(), LedgerError> {
        let mut grants = Vec::new();
        {
            let mut store = self.locked()?;
            let record = store.record_mut(name)?;
            let count = i64::from(count);
            record.available += count;
            let held = record.holders.get(&who).copied().unwrap_or(0);
            if held > count {
                record.holders.insert(who, held - count);
            } else {
                if held < count && count > 0 {
                    // Permitted: releases are not paired-validated, and the
                    // negative-initial-permits pattern relies on this.
                    warn!(semaphore = name, %who, count, held, "released more permits than held");
                }
                record.holders.remove(&who);
            }
            trace!(semaphore = name, %who, count, available = record.available, "released permits");
            record.grant_queued(name, &mut grants);
        }
        self.notify(grants);
        Ok(())
    }

    fn cancel(&self, name: &str, who: RequesterId, seq: u64) -> Result<bool, LedgerError> {
        let mut grants = Vec::new();
        let removed = {
            let mut store = self.locked()?;
            let record = store.record_mut(name)?;
            let before = record.waiters.len();
            record.waiters.retain(|w| w.seq != seq);
            let removed = record.waiters.len() != before;
            if removed {
                trace!(semaphore = name, %who, seq, "retracted queued acquisition");
                // Retracting a head-of-line entry may unblock the rest.
                record.grant_queued(name, &mut grants);
            }
            removed
        };
        self.notify(grants);
        Ok(removed)
    }

    fn available_permits(&self, name: &str) -> Result<i64, LedgerError> {
        let mut store = self.locked()?;
        Ok(store.record_mut(name)?.available)
    }

    fn held_by(&self, name: &str, who: RequesterId) -> Result<i64, LedgerError> {
        let mut store = self.locked()?;
        Ok(store.record_mut(name)?.holders.get(&who).copied().unwrap_or(0))
    }

    fn release_all_for(&self, member: MemberId) -> Result<(), LedgerError> {
        let mut grants = Vec::new();
        let mut evicted = Vec::new();
        {
            let mut store = self.locked()?;
            for (name, record) in &mut store.records {
                let mut freed = 0;
                record.holders.retain(|who, held| {
                    if who.member == member {
                        freed += *held;
                        false
                    } else {
                        true
                    }
                });
                if freed > 0 {
                    record.available += freed;
                    debug!(semaphore = %name, %member, freed, "released permits of departed member");
                }
                record.waiters.retain(|w| {
                    if w.who.member == member {
                        evicted.push((name.clone(), w.who, w.seq));
                        false
                    } else {
                        true
                    }
                });
                record.grant_queued(name, &mut grants);
            }
        }
        self.notify(grants);
        self.notify_evicted(evicted);
        Ok(())
    }

    fn clear(&self) -> Result<(), LedgerError> {
        let mut evicted = Vec::new();
        {
            let mut store = self.locked()?;
            for (name, record) in &mut store.records {
                for w in record.waiters.drain(..) {
                    evicted.push((name.clone(), w.who, w.seq));
                }
            }
            store.records.clear();
        }
        self.notify_evicted(evicted);
        Ok(())
    }

    fn subscribe(&self, listener: Weak<dyn GrantListener>) {
        self.listeners.lock().push(listener);
    }
}
