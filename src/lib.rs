//! Cluster-wide counting semaphores with fair ordering and automatic permit
//! release on member failure.
//!
//! A semaphore maintains a set of permits shared by every member of a
//! cluster. Threads on any member acquire and release permits against a
//! single [`PermitLedger`], the cluster-shared record of each semaphore's
//! balance, its holders, and its wait queue. When a blocking acquire cannot
//! be satisfied, the request joins a wait queue ordered by a ledger-wide
//! arrival counter, so grants are first-in-first-out across the whole
//! cluster: a request queued on one member is served before a later request
//! queued on another, and an unsatisfiable request at the head of the queue
//! blocks everything behind it.
//!
//! When a member departs, gracefully or by failure, every permit held by
//! its threads is released back to the ledger and the longest-waiting
//! acquirers are woken, so a crashed holder can never strand a permit.
//!
//! The capabilities of each semaphore match those of a process-local
//! counting semaphore: blocking interruptible and uninterruptible
//! acquisition, non-blocking and timed attempts, multi-permit requests, and
//! explicit release.
//!
//! Semaphores are obtained from a [`Semaphores`] registry, one per member,
//! wired to the shared ledger and the membership service:
//!
//! ```
//! use std::sync::Arc;
//! use turnstile::{InMemoryLedger, Membership, Semaphores};
//!
//! let ledger = Arc::new(InMemoryLedger::new());
//! let membership = Arc::new(Membership::new());
//!
//! let sems = Semaphores::new(ledger, membership);
//! let semaphore = sems.remote_semaphore("jobs", 5).unwrap();
//!
//! semaphore.acquire_many(3).unwrap();
//! assert_eq!(semaphore.available_permits().unwrap(), 2);
//! assert!(semaphore.is_acquired_by_current_thread().unwrap());
//!
//! semaphore.release_many(3).unwrap();
//! assert_eq!(semaphore.available_permits().unwrap(), 5);
//! ```
//!
//! The permit count is fixed by whichever member names the semaphore first;
//! later creators' counts are ignored:
//!
//! ```
//! # use std::sync::Arc;
//! # use turnstile::{InMemoryLedger, Membership, Semaphores};
//! let ledger = Arc::new(InMemoryLedger::new());
//! let membership = Arc::new(Membership::new());
//!
//! let first = Semaphores::new(ledger.clone(), membership.clone());
//! let second = Semaphores::new(ledger, membership);
//!
//! first.remote_semaphore("queue", 2).unwrap();
//! let theirs = second.remote_semaphore("queue", 100).unwrap();
//! assert_eq!(theirs.available_permits().unwrap(), 2);
//! ```
//!
//! The ledger in this crate is an in-memory, in-process reference
//! implementation; a production deployment backs the [`PermitLedger`] trait
//! with a replicated store providing linearizable per-key updates, and the
//! [`Membership`] service with the cluster's failure detector.

#![warn(clippy::missing_safety_doc, clippy::undocumented_unsafe_blocks)]

use std::sync::Arc;
use std::thread::ThreadId;

use tracing::debug;

mod coordinator;
mod ledger;
mod membership;
mod memory;
mod semaphore;

pub use coordinator::AcquireError;
pub use ledger::{Admission, Grant, GrantListener, LedgerError, PermitLedger, RequesterId};
pub use membership::{MemberId, Membership, MembershipListener};
pub use memory::InMemoryLedger;
pub use semaphore::DistributedSemaphore;

use coordinator::Coordinator;
use membership::FailureListener;

/// The per-member semaphore registry.
///
/// One instance per cluster member, created with the shared ledger and the
/// membership service. Construction joins the membership, registers the
/// member's acquisition coordinator for grant notifications, and installs
/// the failure listener that releases a departed member's permits.
///
/// An explicit registry object, passed to whoever needs it, rather than a
/// process-wide singleton: lifecycle is `new` on member join and
/// [`shutdown`](Self::shutdown) (or drop) on member leave.
pub struct Semaphores {
    member: MemberId,
    coordinator: Arc<Coordinator>,
    ledger: Arc<dyn PermitLedger>,
    membership: Arc<Membership>,
    // Held strongly here; the membership service only keeps a weak ref.
    _failure: Arc<FailureListener>,
}

impl Semaphores {
    /// Join the cluster and build the registry for the new member.
    pub fn new(ledger: Arc<dyn PermitLedger>, membership: Arc<Membership>) -> Self {
        let member = membership.join();
        let coordinator = Arc::new(Coordinator::new(member, Arc::clone(&ledger)));
        let grants = Arc::downgrade(&coordinator);
        ledger.subscribe(grants);

        let failure = Arc::new(FailureListener::new(Arc::clone(&ledger)));
        let departures = Arc::downgrade(&failure);
        membership.subscribe(departures);

        debug!(%member, "semaphore registry initialised");
        Self {
            member,
            coordinator,
            ledger,
            membership,
            _failure: failure,
        }
    }

    /// The identity this registry joined the cluster with.
    pub fn member(&self) -> MemberId {
        self.member
    }

    /// Get (or create) the semaphore named `name`.
    ///
    /// The permit count is only honoured when this call is the first in the
    /// cluster to name the semaphore; an existing record keeps its total.
    /// Negative counts are accepted: such a semaphore starts unacquirable
    /// and becomes usable once enough releases raise the balance.
    pub fn remote_semaphore(
        &self,
        name: &str,
        permits: i64,
    ) -> Result<DistributedSemaphore, LedgerError> {
        self.ledger.create(name, permits)?;
        Ok(DistributedSemaphore::new(
            name,
            Arc::clone(&self.coordinator),
        ))
    }

    /// Interrupt `thread` if it is parked in a blocking acquire on this
    /// member. Returns whether a waiting thread was found.
    ///
    /// Interruptible waits fail with [`AcquireError::Interrupted`] and
    /// retract their queued request; uninterruptible waits ignore the flag.
    pub fn interrupt(&self, thread: ThreadId) -> bool {
        self.coordinator.interrupt(thread)
    }

    /// Administrative wipe of every semaphore record in the ledger.
    ///
    /// A test/ops utility, not part of steady-state use.
    pub fn clear(&self) -> Result<(), LedgerError> {
        self.ledger.clear()
    }

    /// Leave the cluster, releasing every permit held by this member's
    /// threads. Idempotent; also performed on drop.
    pub fn shutdown(&self) {
        self.membership.depart(self.member);
    }
}

impl Drop for Semaphores {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for Semaphores {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Semaphores")
            .field("member", &self.member)
            .finish_non_exhaustive()
    }
}
