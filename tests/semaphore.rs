//! Single-member semaphore behaviour: permit accounting, non-blocking and
//! timed attempts, interruption, and ledger failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use turnstile::{
    AcquireError, InMemoryLedger, LedgerError, Membership, Semaphores,
};

fn member() -> (Arc<InMemoryLedger>, Semaphores) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let ledger = Arc::new(InMemoryLedger::new());
    let membership = Arc::new(Membership::new());
    let sems = Semaphores::new(ledger.clone(), membership);
    (ledger, sems)
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn acquires_and_releases_single_permits() {
    let (_, sems) = member();
    let semaphore = sems.remote_semaphore("foo", 5).unwrap();

    semaphore.acquire().unwrap();
    semaphore.acquire().unwrap();
    semaphore.acquire().unwrap();
    assert_eq!(semaphore.available_permits().unwrap(), 2);
    assert!(semaphore.is_acquired_by_current_thread().unwrap());

    semaphore.release().unwrap();
    semaphore.release().unwrap();
    assert_eq!(semaphore.available_permits().unwrap(), 4);
    assert!(semaphore.is_acquired_by_current_thread().unwrap());

    semaphore.release().unwrap();
    assert_eq!(semaphore.available_permits().unwrap(), 5);
    assert!(!semaphore.is_acquired_by_current_thread().unwrap());
}

#[test]
fn acquires_and_releases_multiple_permits() {
    let (_, sems) = member();
    let semaphore = sems.remote_semaphore("foo", 5).unwrap();

    semaphore.acquire_uninterruptibly_many(3).unwrap();
    assert_eq!(semaphore.available_permits().unwrap(), 2);

    semaphore.release_many(3).unwrap();
    assert_eq!(semaphore.available_permits().unwrap(), 5);
}

#[test]
fn try_acquire_does_not_block() {
    let (_, sems) = member();
    let semaphore = sems.remote_semaphore("foo", 1).unwrap();

    assert!(semaphore.try_acquire().unwrap());
    assert!(!semaphore.try_acquire().unwrap());

    semaphore.release().unwrap();
    assert!(semaphore.try_acquire().unwrap());
}

#[test]
fn zero_permit_requests_never_succeed() {
    let (_, sems) = member();
    let semaphore = sems.remote_semaphore("foo", 0).unwrap();

    assert!(!semaphore.try_acquire_many(0).unwrap());
    assert!(!semaphore.try_acquire_many_for(0, Duration::from_millis(100)).unwrap());
    assert_eq!(semaphore.available_permits().unwrap(), 0);
}

#[test]
fn cannot_acquire_more_than_available() {
    let (_, sems) = member();
    let semaphore = sems.remote_semaphore("foo", 10).unwrap();

    semaphore.acquire_many(7).unwrap();
    assert_eq!(semaphore.available_permits().unwrap(), 3);

    assert!(!semaphore.try_acquire_many(5).unwrap());
    assert_eq!(semaphore.available_permits().unwrap(), 3);
}

#[test]
fn negative_initial_permits_need_releases_first() {
    let (_, sems) = member();
    let semaphore = sems.remote_semaphore("foo", -3).unwrap();

    assert!(!semaphore.try_acquire().unwrap());

    semaphore.release_many(4).unwrap();
    assert_eq!(semaphore.available_permits().unwrap(), 1);

    assert!(semaphore.try_acquire().unwrap());
    assert_eq!(semaphore.available_permits().unwrap(), 0);
}

#[test]
fn timed_acquire_times_out_without_taking_permits() {
    let (_, sems) = member();
    let semaphore = sems.remote_semaphore("foo", 1).unwrap();
    semaphore.acquire().unwrap();

    let started = Instant::now();
    assert!(!semaphore.try_acquire_for(Duration::from_millis(300)).unwrap());
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(semaphore.available_permits().unwrap(), 0);

    semaphore.release().unwrap();
    assert!(semaphore.try_acquire_for(Duration::from_secs(1)).unwrap());
}

#[test]
fn mutual_exclusion_with_one_permit() {
    let (_, sems) = member();
    let semaphore = sems.remote_semaphore("foo", 1).unwrap();

    let in_section = Arc::new(AtomicI32::new(0));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let semaphore = semaphore.clone();
        let in_section = Arc::clone(&in_section);
        handles.push(thread::spawn(move || {
            for _ in 0..20 {
                semaphore.acquire().unwrap();
                assert_eq!(in_section.fetch_add(1, Ordering::SeqCst), 0);
                assert_eq!(in_section.fetch_sub(1, Ordering::SeqCst), 1);
                semaphore.release().unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(semaphore.available_permits().unwrap(), 1);
}

#[test]
fn interrupting_a_waiter_retracts_its_request() {
    let (ledger, sems) = member();
    let semaphore = sems.remote_semaphore("foo", 1).unwrap();
    semaphore.acquire().unwrap();

    let waiter = {
        let semaphore = semaphore.clone();
        thread::spawn(move || {
            let outcome = semaphore.acquire();
            assert_eq!(outcome, Err(AcquireError::Interrupted));
            assert!(!semaphore.is_acquired_by_current_thread().unwrap());
        })
    };

    let thread = waiter.thread().id();
    wait_until(|| sems.interrupt(thread));
    waiter.join().unwrap();

    assert_eq!(ledger.waiting("foo"), 0);
    assert_eq!(semaphore.available_permits().unwrap(), 0);

    semaphore.release().unwrap();
    assert_eq!(semaphore.available_permits().unwrap(), 1);
}

#[test]
fn uninterruptible_acquire_ignores_interrupts() {
    let (ledger, sems) = member();
    let semaphore = sems.remote_semaphore("foo", 1).unwrap();
    semaphore.acquire().unwrap();

    let waiter = {
        let semaphore = semaphore.clone();
        thread::spawn(move || {
            semaphore.acquire_uninterruptibly().unwrap();
            assert!(semaphore.is_acquired_by_current_thread().unwrap());
            semaphore.release().unwrap();
        })
    };

    let thread = waiter.thread().id();
    wait_until(|| sems.interrupt(thread));
    thread::sleep(Duration::from_millis(100));
    assert!(!waiter.is_finished());
    assert_eq!(ledger.waiting("foo"), 1);

    semaphore.release().unwrap();
    waiter.join().unwrap();
    assert_eq!(semaphore.available_permits().unwrap(), 1);
}

#[test]
fn closed_ledger_fails_new_calls_and_parked_waiters() {
    let (ledger, sems) = member();
    let semaphore = sems.remote_semaphore("foo", 1).unwrap();
    semaphore.acquire().unwrap();

    let waiter = {
        let semaphore = semaphore.clone();
        thread::spawn(move || semaphore.acquire())
    };
    wait_until(|| ledger.waiting("foo") == 1);

    ledger.close();
    assert_eq!(
        waiter.join().unwrap(),
        Err(AcquireError::Ledger(LedgerError::Unavailable))
    );
    assert_eq!(semaphore.try_acquire(), Err(LedgerError::Unavailable));
}

#[test]
fn clear_fails_parked_waiters() {
    let (ledger, sems) = member();
    let semaphore = sems.remote_semaphore("foo", 1).unwrap();
    semaphore.acquire().unwrap();

    let waiter = {
        let semaphore = semaphore.clone();
        thread::spawn(move || semaphore.acquire())
    };
    wait_until(|| ledger.waiting("foo") == 1);

    sems.clear().unwrap();
    assert_eq!(waiter.join().unwrap(), Err(AcquireError::Evicted));
}

#[test]
fn clear_wipes_all_records() {
    let (_, sems) = member();
    let semaphore = sems.remote_semaphore("foo", 5).unwrap();
    semaphore.acquire().unwrap();

    sems.clear().unwrap();
    assert_eq!(
        semaphore.available_permits(),
        Err(LedgerError::UnknownSemaphore("foo".to_owned()))
    );

    // Re-creating after a wipe starts from a fresh record.
    let recreated = sems.remote_semaphore("foo", 2).unwrap();
    assert_eq!(recreated.available_permits().unwrap(), 2);
}
