//! The client handle for a named cluster-wide semaphore.

use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::{AcquireError, Coordinator, Park};
use crate::ledger::LedgerError;

/// A distributed counting semaphore.
///
/// Handles are lightweight, stateless proxies over the shared permit ledger:
/// cloning one is cheap, and every handle to the same name observes the same
/// permits. Permit grants are first-in-first-out by arrival order across the
/// whole cluster, so a request queued on one member is served before a later
/// request queued on another.
///
/// Unlike an RAII guard, permits are returned explicitly with
/// [`release`](Self::release); a thread that exits without releasing keeps
/// its permits checked out until its member departs the cluster, at which
/// point they are released automatically.
///
/// Obtained from [`Semaphores::remote_semaphore`](crate::Semaphores::remote_semaphore).
#[derive(Clone)]
pub struct DistributedSemaphore {
    name: Arc<str>,
    coordinator: Arc<Coordinator>,
}

impl DistributedSemaphore {
    pub(crate) fn new(name: &str, coordinator: Arc<Coordinator>) -> Self {
        Self {
            name: Arc::from(name),
            coordinator,
        }
    }

    /// The name this semaphore is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire one permit, blocking until it is available.
    ///
    /// # Errors
    ///
    /// Fails with [`AcquireError::Interrupted`] if the waiting thread is
    /// interrupted; the queued request is retracted and the ledger left
    /// unchanged. Fails with [`AcquireError::Evicted`] if the queued request
    /// is dropped by an administrative clear or by this member's own
    /// departure. Ledger failure surfaces as [`AcquireError::Ledger`].
    pub fn acquire(&self) -> Result<(), AcquireError> {
        self.acquire_many(1)
    }

    /// Acquire `permits` permits, blocking until all of them are available
    /// at once.
    ///
    /// A request for zero permits is never satisfiable: the call blocks
    /// until interrupted.
    ///
    /// # Errors
    ///
    /// See [`acquire`](Self::acquire).
    pub fn acquire_many(&self, permits: u32) -> Result<(), AcquireError> {
        self.coordinator
            .acquire(&self.name, permits, Park::Interruptible, None)
            .map(drop)
    }

    /// Acquire one permit, blocking until it is available and ignoring
    /// interruption.
    ///
    /// # Errors
    ///
    /// This form never reports interruption; eviction and ledger failure
    /// still end the wait, as for [`acquire`](Self::acquire).
    pub fn acquire_uninterruptibly(&self) -> Result<(), AcquireError> {
        self.acquire_uninterruptibly_many(1)
    }

    /// Acquire `permits` permits, blocking and ignoring interruption.
    pub fn acquire_uninterruptibly_many(&self, permits: u32) -> Result<(), AcquireError> {
        self.coordinator
            .acquire(&self.name, permits, Park::Uninterruptible, None)
            .map(drop)
    }

    /// Take one permit if one is available right now, without blocking.
    ///
    /// This form barges: it does not queue and may overtake waiting
    /// acquirers.
    pub fn try_acquire(&self) -> Result<bool, LedgerError> {
        self.try_acquire_many(1)
    }

    /// Take `permits` permits if that many are available right now.
    /// Requests for zero permits always return `false`.
    pub fn try_acquire_many(&self, permits: u32) -> Result<bool, LedgerError> {
        self.coordinator.try_acquire(&self.name, permits)
    }

    /// Acquire one permit, waiting fairly for up to `timeout`.
    ///
    /// Returns `Ok(false)` if the deadline elapsed first; the failed attempt
    /// leaves the permit count unchanged. A grant that races the deadline
    /// wins: the call then reports `Ok(true)` and the caller holds the
    /// permit.
    pub fn try_acquire_for(&self, timeout: Duration) -> Result<bool, AcquireError> {
        self.try_acquire_many_for(1, timeout)
    }

    /// Acquire `permits` permits, waiting fairly for up to `timeout`.
    pub fn try_acquire_many_for(
        &self,
        permits: u32,
        timeout: Duration,
    ) -> Result<bool, AcquireError> {
        self.coordinator
            .acquire(&self.name, permits, Park::Interruptible, Some(timeout))
    }

    /// Return one permit to the semaphore.
    pub fn release(&self) -> Result<(), LedgerError> {
        self.release_many(1)
    }

    /// Return `permits` permits to the semaphore.
    ///
    /// Releases are not validated against prior acquisition: releasing more
    /// than is held simply adds permits. The longest-waiting satisfiable
    /// acquirer, anywhere in the cluster, is granted first.
    pub fn release_many(&self, permits: u32) -> Result<(), LedgerError> {
        self.coordinator.release(&self.name, permits)
    }

    /// Snapshot of the number of available permits. In a distributed system
    /// this may be stale by the time the caller looks at it; use it for
    /// monitoring, not for coordination.
    pub fn available_permits(&self) -> Result<i64, LedgerError> {
        self.coordinator.available_permits(&self.name)
    }

    /// Whether the calling thread currently holds at least one permit of
    /// this semaphore.
    pub fn is_acquired_by_current_thread(&self) -> Result<bool, LedgerError> {
        Ok(self.coordinator.held_by_current_thread(&self.name)? > 0)
    }
}

impl core::fmt::Debug for DistributedSemaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut d = f.debug_struct("DistributedSemaphore");
        d.field("name", &self.name);
        match self.available_permits() {
            Ok(available) => d.field("available", &available),
            Err(_) => d.field("available", &format_args!("<unavailable>")),
        };
        d.finish_non_exhaustive()
    }
}
