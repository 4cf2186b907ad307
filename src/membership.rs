//! Cluster membership and the failure listener.
//!
//! [`Membership`] is the in-process stand-in for the cluster's
//! membership/failure-detection service: members join, members depart, and
//! subscribed listeners hear about departures. Delivery is at-least-once;
//! everything downstream of a departure is idempotent, so duplicates are
//! harmless.

use core::fmt;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::ledger::PermitLedger;

/// The stable identity of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(u64);

impl MemberId {
    /// Build a member id from a raw value, for wiring up a ledger without a
    /// [`Membership`] service (tests, tooling).
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member-{}", self.0)
    }
}

/// Receives member-departure notifications.
pub trait MembershipListener: Send + Sync {
    fn member_departed(&self, member: MemberId);
}

#[derive(Default)]
struct Roster {
    next: u64,
    members: HashSet<MemberId>,
    listeners: Vec<Weak<dyn MembershipListener>>,
}

/// In-process membership service shared by every member of the deployment.
#[derive(Default)]
pub struct Membership {
    roster: Mutex<Roster>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new member and hand it its identity.
    pub fn join(&self) -> MemberId {
        let mut roster = self.roster.lock();
        roster.next += 1;
        let member = MemberId(roster.next);
        roster.members.insert(member);
        info!(%member, "member joined");
        member
    }

    /// Remove `member` and notify listeners. Covers both a graceful leave
    /// and a detected failure; a member that already departed is a no-op.
    pub fn depart(&self, member: MemberId) {
        let listeners: Vec<_> = {
            let mut roster = self.roster.lock();
            if !roster.members.remove(&member) {
                return;
            }
            roster.listeners.retain(|l| l.strong_count() > 0);
            roster.listeners.iter().filter_map(Weak::upgrade).collect()
        };
        info!(%member, "member departed");
        // Dispatch outside the roster lock; listeners re-enter the ledger.
        for listener in listeners {
            listener.member_departed(member);
        }
    }

    pub fn is_member(&self, member: MemberId) -> bool {
        self.roster.lock().members.contains(&member)
    }

    pub fn subscribe(&self, listener: Weak<dyn MembershipListener>) {
        self.roster.lock().listeners.push(listener);
    }
}

/// Releases a departed member's permits back to the ledger.
///
/// The ledger's holders map is the source of truth, so a duplicate departure
/// notification finds nothing left to release.
pub(crate) struct FailureListener {
    ledger: Arc<dyn PermitLedger>,
}

impl FailureListener {
    pub(crate) fn new(ledger: Arc<dyn PermitLedger>) -> Self {
        Self { ledger }
    }
}

impl MembershipListener for FailureListener {
    fn member_departed(&self, member: MemberId) {
        if let Err(error) = self.ledger.release_all_for(member) {
            warn!(%member, %error, "failed to release permits of departed member");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Departures(Mutex<Vec<MemberId>>);

    impl MembershipListener for Departures {
        fn member_departed(&self, member: MemberId) {
            self.0.lock().push(member);
        }
    }

    #[test]
    fn departure_notifies_once_per_member() {
        let membership = Membership::new();
        let seen = Arc::new(Departures::default());
        let listener = Arc::downgrade(&seen);
        membership.subscribe(listener);

        let a = membership.join();
        let b = membership.join();
        assert_ne!(a, b);
        assert!(membership.is_member(a));

        membership.depart(a);
        membership.depart(a);
        assert!(!membership.is_member(a));
        assert_eq!(*seen.0.lock(), vec![a]);
    }
}
