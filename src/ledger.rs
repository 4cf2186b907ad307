//! The permit ledger: the cluster-shared record of each semaphore's permit
//! count, its holders, and its wait queue.
//!
//! The ledger is the single shared mutable resource in the system. Every
//! mutation (`try_acquire`, `release`, `release_all_for`, ...) is atomic with
//! respect to every other, matching the per-key atomic update a distributed
//! store provides. Callers never block inside a ledger operation; blocking
//! happens member-side against a wait cell, woken through [`GrantListener`].

use core::fmt;
use std::sync::Weak;

use crate::membership::MemberId;

/// Identifies a single acquiring thread on a single cluster member.
///
/// Permit ownership is recorded per requester so that a departed member's
/// holdings can be found and released. The `thread` component is a
/// process-local monotonic key rather than an address or [`std::thread::ThreadId`],
/// so the identity stays meaningful outside the process that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequesterId {
    /// The cluster member the requesting thread runs on.
    pub member: MemberId,
    /// The member-local key of the requesting thread.
    pub thread: u64,
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/thread-{}", self.member, self.thread)
    }
}

/// A wait-queue entry that has been granted its permits.
#[derive(Debug, Clone)]
pub struct Grant {
    /// Name of the semaphore the entry was queued on.
    pub name: String,
    /// The requester that now holds the permits.
    pub who: RequesterId,
    /// The arrival sequence number the entry was queued with.
    pub seq: u64,
}

/// Receives ledger notifications.
///
/// Each member's acquisition coordinator registers itself so that its parked
/// threads can be woken when a remote release (or a member departure) grants
/// their queued entry. Listeners are held weakly; a dropped coordinator is
/// pruned on the next notification.
pub trait GrantListener: Send + Sync {
    /// A queued acquisition has been granted. Dispatched after the ledger's
    /// store lock is released, in grant order.
    fn granted(&self, grant: &Grant);

    /// A queued entry was removed without a grant: its record was wiped, or
    /// its member departed. The parked waiter must fail rather than block
    /// forever or mistake the removal for a grant.
    fn evicted(&self, name: &str, who: RequesterId, seq: u64);

    /// The backing store has shut down. Parked waiters must fail with
    /// [`LedgerError::Unavailable`] rather than block forever.
    fn unavailable(&self);
}

/// The outcome of [`PermitLedger::acquire_or_enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request was at the head of the line and permits were available;
    /// they have been granted and recorded against the requester.
    Acquired,
    /// The request joined the wait queue with this arrival sequence number.
    Waiting(u64),
}

/// Errors surfaced by ledger operations.
///
/// Infrastructure failure is deliberately distinct from "no permits
/// available": the latter is an expected outcome reported through return
/// values, never through this type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The backing store is closed or unreachable.
    #[error("permit store is unavailable")]
    Unavailable,

    /// No semaphore record exists under this name. Only reachable by
    /// bypassing the registry, or by racing an administrative `clear()`.
    #[error("no semaphore record named {0:?}")]
    UnknownSemaphore(String),
}

/// The durable, cluster-shared permit ledger.
///
/// Implementations must make every mutating operation linearizable with
/// respect to every other, across all members sharing the ledger. The
/// reference implementation is [`InMemoryLedger`](crate::InMemoryLedger);
/// a production deployment would back this trait with the cluster's
/// replicated store and its per-key entry processors.
///
/// Arrival sequence numbers are assigned from a single ledger-wide monotonic
/// counter, which is what makes the FIFO ordering cluster-wide rather than
/// per-member.
pub trait PermitLedger: Send + Sync {
    /// Create the record for `name` with `permits` total permits.
    ///
    /// Idempotent: if the record already exists it is returned unchanged and
    /// the `permits` argument is discarded. Callers must not assume their
    /// requested count took effect if another member created the record
    /// first.
    ///
    /// Negative totals are accepted; such a semaphore only becomes
    /// acquirable once enough releases bring the available count up.
    fn create(&self, name: &str, permits: i64) -> Result<(), LedgerError>;

    /// Atomically take `count` permits if that many are available.
    ///
    /// This is the immediate, barging form: it does not consult the wait
    /// queue, so it may overtake queued requests. A `count` of zero is never
    /// satisfiable and always returns `false`.
    fn try_acquire(&self, name: &str, who: RequesterId, count: u32) -> Result<bool, LedgerError>;

    /// Atomically take `count` permits if the request is at the head of the
    /// line, otherwise append a wait-queue entry.
    ///
    /// "Head of the line" means the queue is empty: a queued request blocks
    /// every later arrival, even one that could be satisfied right now.
    /// Doing the failed check and the enqueue as one atomic step is what
    /// keeps a concurrent release from slipping between them and stranding
    /// the entry.
    ///
    /// `count` must be nonzero; zero-permit requests never enqueue.
    fn acquire_or_enqueue(
        &self,
        name: &str,
        who: RequesterId,
        count: u32,
    ) -> Result<Admission, LedgerError>;

    /// Return `count` permits and run the fairness scan.
    ///
    /// The requester's holder entry is decremented, saturating at zero;
    /// releasing more than is held is permitted and simply adds permits.
    /// Queued entries satisfiable by the new balance are granted in arrival
    /// order and their listeners notified.
    fn release(&self, name: &str, who: RequesterId, count: u32) -> Result<(), LedgerError>;

    /// Retract the wait-queue entry `seq`, then run the fairness scan for
    /// any entries behind it that the retraction unblocks.
    ///
    /// Returns `false` if the entry is already gone: a concurrent grant or
    /// eviction removed it first. Whichever did so notifies the listeners,
    /// and the removal is authoritative; a grant means the canceller holds
    /// the permits and must account for them.
    fn cancel(&self, name: &str, who: RequesterId, seq: u64) -> Result<bool, LedgerError>;

    /// Snapshot of the available permit count. May be stale by the time the
    /// caller acts on it.
    fn available_permits(&self, name: &str) -> Result<i64, LedgerError>;

    /// Snapshot of the permits held by `who`.
    fn held_by(&self, name: &str, who: RequesterId) -> Result<i64, LedgerError>;

    /// Release every permit held by any thread of `member` and drop the
    /// member's queued waiters, then run the fairness scan on each affected
    /// record.
    ///
    /// Idempotent: the holders map is the source of truth, so a duplicate
    /// departure notification finds nothing to release.
    fn release_all_for(&self, member: MemberId) -> Result<(), LedgerError>;

    /// Administrative wipe of every semaphore record.
    ///
    /// A test/ops utility, not part of steady-state use. Unsupported while
    /// acquisitions are in flight: queued waiters are dropped with their
    /// records.
    fn clear(&self) -> Result<(), LedgerError>;

    /// Register a listener for grant and store-shutdown notifications.
    fn subscribe(&self, listener: Weak<dyn GrantListener>);
}
