//! Per-member acquisition coordination.
//!
//! Each blocking acquire moves through a small state machine: attempt the
//! ledger synchronously, and on failure queue an entry and park the calling
//! thread on a wait cell until the entry is granted, times out, is
//! interrupted, or the store goes away. The wait cell is registered *before*
//! the entry is queued, so a grant dispatched in between is never lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::ledger::{Admission, Grant, GrantListener, LedgerError, PermitLedger, RequesterId};
use crate::membership::MemberId;

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static THREAD_KEY: u64 = NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed);
}

/// The requester identity of the calling thread on `member`.
pub(crate) fn current_requester(member: MemberId) -> RequesterId {
    RequesterId {
        member,
        thread: THREAD_KEY.with(|k| *k),
    }
}

/// The error returned by blocking acquisitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    /// The waiting thread was interrupted and its queued request retracted.
    /// Local to the calling thread; the ledger is left untouched.
    #[error("interrupted while waiting for permits")]
    Interrupted,

    /// The queued request was dropped without a grant: its record was wiped
    /// by an administrative clear, or its member was marked departed while
    /// the thread was parked. No permits are held.
    #[error("queued request was dropped while waiting for permits")]
    Evicted,

    /// The ledger failed. Deliberately distinct from "no permits available",
    /// which is an expected outcome, not an error.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Whether a parked thread honours interruption.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Park {
    Interruptible,
    Uninterruptible,
}

#[derive(Default)]
struct Outcome {
    granted: bool,
    evicted: bool,
    interrupted: bool,
    unavailable: bool,
}

/// What a parked thread blocks on. One per in-flight blocking acquire.
#[derive(Default)]
struct WaitCell {
    outcome: Mutex<Outcome>,
    cond: Condvar,
}

impl WaitCell {
    fn signal(&self, set: impl FnOnce(&mut Outcome)) {
        let mut outcome = self.outcome.lock();
        set(&mut outcome);
        drop(outcome);
        self.cond.notify_all();
    }
}

struct WaitEntry {
    cell: Arc<WaitCell>,
    thread: ThreadId,
}

/// One coordinator per member. Bridges the shared ledger's grant
/// notifications to the member's parked threads, and implements the
/// blocking/timeout/interrupt semantics on top of the ledger's atomic
/// operations.
pub(crate) struct Coordinator {
    member: MemberId,
    ledger: Arc<dyn PermitLedger>,
    waiting: Mutex<HashMap<RequesterId, WaitEntry>>,
}

impl Coordinator {
    pub(crate) fn new(member: MemberId, ledger: Arc<dyn PermitLedger>) -> Self {
        Self {
            member,
            ledger,
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Blocking acquisition of `count` permits, with optional deadline.
    ///
    /// Returns `Ok(true)` when granted and `Ok(false)` when the timeout
    /// elapsed first. Untimed calls only ever return `Ok(true)` or an error.
    pub(crate) fn acquire(
        &self,
        name: &str,
        count: u32,
        park: Park,
        timeout: Option<Duration>,
    ) -> Result<bool, AcquireError> {
        let who = current_requester(self.member);
        let deadline = timeout.map(|t| Instant::now() + t);

        // A request for zero permits is never satisfiable. Timed forms
        // report failure immediately; untimed forms park without queueing,
        // so they cannot block anyone behind them.
        if count == 0 {
            return if deadline.is_some() {
                Ok(false)
            } else {
                self.park_unsatisfiable(who, park)
            };
        }

        let cell = Arc::new(WaitCell::default());
        self.register(who, &cell);

        let admission = match self.ledger.acquire_or_enqueue(name, who, count) {
            Ok(admission) => admission,
            Err(e) => {
                self.unregister(who);
                return Err(e.into());
            }
        };
        let seq = match admission {
            Admission::Acquired => {
                self.unregister(who);
                return Ok(true);
            }
            Admission::Waiting(seq) => seq,
        };

        let result = self.wait(name, who, seq, &cell, park, deadline);
        self.unregister(who);
        result
    }

    fn wait(
        &self,
        name: &str,
        who: RequesterId,
        seq: u64,
        cell: &WaitCell,
        park: Park,
        deadline: Option<Instant>,
    ) -> Result<bool, AcquireError> {
        let mut outcome = cell.outcome.lock();
        loop {
            if outcome.granted {
                trace!(semaphore = name, %who, seq, "woken with permits granted");
                return Ok(true);
            }
            if outcome.evicted {
                // The queue entry was dropped without a grant.
                return Err(AcquireError::Evicted);
            }
            if outcome.unavailable {
                // The queue entry went down with the store.
                return Err(LedgerError::Unavailable.into());
            }
            if outcome.interrupted && matches!(park, Park::Interruptible) {
                drop(outcome);
                return if self.ledger.cancel(name, who, seq)? {
                    Err(AcquireError::Interrupted)
                } else {
                    // Someone else removed the entry first; wait for their
                    // signal to learn whether it was a grant.
                    self.settle_removed_entry(cell)
                };
            }

            match deadline {
                Some(deadline) => {
                    if cell.cond.wait_until(&mut outcome, deadline).timed_out() {
                        if outcome.granted {
                            return Ok(true);
                        }
                        if outcome.evicted {
                            return Err(AcquireError::Evicted);
                        }
                        if outcome.unavailable {
                            return Err(LedgerError::Unavailable.into());
                        }
                        drop(outcome);
                        // A grant or eviction that already reached the
                        // ledger beats a timeout.
                        return if self.ledger.cancel(name, who, seq)? {
                            trace!(semaphore = name, %who, seq, "timed out waiting for permits");
                            Ok(false)
                        } else {
                            self.settle_removed_entry(cell)
                        };
                    }
                }
                None => cell.cond.wait(&mut outcome),
            }
        }
    }

    /// The queue entry was removed by someone else before the retraction
    /// landed. Every such removal is either a grant or an eviction, and the
    /// remover signals the cell after dropping the store lock, so parking
    /// here is bounded by that in-flight notification.
    fn settle_removed_entry(&self, cell: &WaitCell) -> Result<bool, AcquireError> {
        let mut outcome = cell.outcome.lock();
        loop {
            if outcome.granted {
                return Ok(true);
            }
            if outcome.evicted {
                return Err(AcquireError::Evicted);
            }
            if outcome.unavailable {
                return Err(LedgerError::Unavailable.into());
            }
            cell.cond.wait(&mut outcome);
        }
    }

    /// Park without a queue entry. Only an interrupt or store shutdown can
    /// end the wait.
    fn park_unsatisfiable(&self, who: RequesterId, park: Park) -> Result<bool, AcquireError> {
        let cell = Arc::new(WaitCell::default());
        self.register(who, &cell);
        let mut outcome = cell.outcome.lock();
        let result = loop {
            if outcome.unavailable {
                break Err(LedgerError::Unavailable.into());
            }
            if outcome.interrupted && matches!(park, Park::Interruptible) {
                break Err(AcquireError::Interrupted);
            }
            cell.cond.wait(&mut outcome);
        };
        drop(outcome);
        self.unregister(who);
        result
    }

    /// Immediate, barging acquisition.
    pub(crate) fn try_acquire(&self, name: &str, count: u32) -> Result<bool, LedgerError> {
        self.ledger
            .try_acquire(name, current_requester(self.member), count)
    }

    pub(crate) fn release(&self, name: &str, count: u32) -> Result<(), LedgerError> {
        self.ledger
            .release(name, current_requester(self.member), count)
    }

    pub(crate) fn available_permits(&self, name: &str) -> Result<i64, LedgerError> {
        self.ledger.available_permits(name)
    }

    pub(crate) fn held_by_current_thread(&self, name: &str) -> Result<i64, LedgerError> {
        self.ledger.held_by(name, current_requester(self.member))
    }

    /// Flag the wait of `thread`, if it is parked in a blocking acquire on
    /// this member. Returns whether a waiting thread was found.
    pub(crate) fn interrupt(&self, thread: ThreadId) -> bool {
        let waiting = self.waiting.lock();
        for entry in waiting.values() {
            if entry.thread == thread {
                entry.cell.signal(|o| o.interrupted = true);
                return true;
            }
        }
        false
    }

    fn register(&self, who: RequesterId, cell: &Arc<WaitCell>) {
        let entry = WaitEntry {
            cell: Arc::clone(cell),
            thread: std::thread::current().id(),
        };
        self.waiting.lock().insert(who, entry);
    }

    fn unregister(&self, who: RequesterId) {
        self.waiting.lock().remove(&who);
    }
}

impl GrantListener for Coordinator {
    fn granted(&self, grant: &Grant) {
        if grant.who.member != self.member {
            return;
        }
        let waiting = self.waiting.lock();
        if let Some(entry) = waiting.get(&grant.who) {
            entry.cell.signal(|o| o.granted = true);
        }
    }

    fn evicted(&self, _name: &str, who: RequesterId, _seq: u64) {
        if who.member != self.member {
            return;
        }
        let waiting = self.waiting.lock();
        if let Some(entry) = waiting.get(&who) {
            entry.cell.signal(|o| o.evicted = true);
        }
    }

    fn unavailable(&self) {
        let waiting = self.waiting.lock();
        for entry in waiting.values() {
            entry.cell.signal(|o| o.unavailable = true);
        }
    }
}
