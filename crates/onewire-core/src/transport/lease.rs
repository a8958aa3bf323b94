//! Exclusive access to a shared link.
//!
//! One `ExclusiveLease` guards one physical link. Sessions identify
//! themselves with a `SessionId`; ownership is re-entrant for the owner and
//! release by anyone else is ignored. Blocking acquisition polls at a fixed
//! interval up to a configurable bound.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{OneWireError, Result};
use crate::sync::lock;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Ownership token for bus access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Retry policy for blocking acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeasePolicy {
    /// Sleep between ownership checks.
    pub retry_interval_ms: u64,
    /// Give up after this long. `None` waits forever.
    pub max_wait_ms: Option<u64>,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            retry_interval_ms: 50,
            max_wait_ms: Some(30_000),
        }
    }
}

impl LeasePolicy {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }
}

/// At most one owner at a time.
#[derive(Debug, Default)]
pub struct ExclusiveLease {
    owner: Mutex<Option<SessionId>>,
    policy: LeasePolicy,
}

impl ExclusiveLease {
    pub fn new(policy: LeasePolicy) -> Self {
        Self {
            owner: Mutex::new(None),
            policy,
        }
    }

    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    /// Take ownership if free or already ours.
    pub fn try_acquire(&self, session: SessionId) -> bool {
        let mut owner = lock(&self.owner);
        match *owner {
            None => {
                *owner = Some(session);
                trace!(session = %session, "Lease acquired");
                true
            }
            Some(current) => current == session,
        }
    }

    /// Acquire ownership; with `blocking`, poll until free or the policy's
    /// bound runs out. Returns whether `session` owns the lease.
    pub fn acquire(&self, session: SessionId, blocking: bool) -> bool {
        if self.try_acquire(session) {
            return true;
        }
        if !blocking {
            return false;
        }
        let start = Instant::now();
        loop {
            thread::sleep(self.policy.retry_interval());
            if self.try_acquire(session) {
                return true;
            }
            if let Some(max) = self.policy.max_wait()
                && start.elapsed() >= max
            {
                return false;
            }
        }
    }

    /// Give up ownership. No-op unless `session` is the owner.
    pub fn release(&self, session: SessionId) {
        let mut owner = lock(&self.owner);
        if *owner == Some(session) {
            *owner = None;
            trace!(session = %session, "Lease released");
        }
    }

    pub fn is_held_by(&self, session: SessionId) -> bool {
        *lock(&self.owner) == Some(session)
    }

    pub fn owner(&self) -> Option<SessionId> {
        *lock(&self.owner)
    }

    /// Drop any record of a terminated session.
    pub fn cleanup(&self, session: SessionId) {
        self.release(session);
    }

    /// Hold the lease for the duration of one operation.
    ///
    /// Acquires (blocking) only if `session` does not already own the lease,
    /// and the returned guard releases only what it acquired.
    pub fn local(&self, session: SessionId) -> Result<LocalExclusive<'_>> {
        if self.is_held_by(session) {
            return Ok(LocalExclusive {
                lease: self,
                session,
                acquired: false,
            });
        }
        if !self.acquire(session, true) {
            return Err(OneWireError::ExclusiveTimeout(
                self.policy.max_wait().unwrap_or_default(),
            ));
        }
        Ok(LocalExclusive {
            lease: self,
            session,
            acquired: true,
        })
    }
}

/// Guard returned by [`ExclusiveLease::local`].
#[must_use = "the lease is released as soon as the guard is dropped"]
pub struct LocalExclusive<'a> {
    lease: &'a ExclusiveLease,
    session: SessionId,
    acquired: bool,
}

impl LocalExclusive<'_> {
    /// Whether this guard took the lease (as opposed to nesting).
    pub fn acquired(&self) -> bool {
        self.acquired
    }
}

impl Drop for LocalExclusive<'_> {
    fn drop(&mut self) {
        if self.acquired {
            self.lease.release(self.session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn fast_policy() -> LeasePolicy {
        LeasePolicy {
            retry_interval_ms: 1,
            max_wait_ms: Some(200),
        }
    }

    #[test]
    fn test_lease_reentrant() {
        let lease = ExclusiveLease::new(fast_policy());
        let a = SessionId::next();
        assert!(lease.acquire(a, false));
        assert!(lease.acquire(a, false));
        assert!(lease.is_held_by(a));
    }

    #[test]
    fn test_release_by_non_owner_is_noop() {
        let lease = ExclusiveLease::new(fast_policy());
        let a = SessionId::next();
        let b = SessionId::next();
        assert!(lease.acquire(a, false));
        lease.release(b);
        assert_eq!(lease.owner(), Some(a));
    }

    #[test]
    fn test_nonblocking_contention() {
        let lease = ExclusiveLease::new(fast_policy());
        let a = SessionId::next();
        let b = SessionId::next();
        assert!(lease.acquire(a, false));
        assert!(!lease.acquire(b, false));
        lease.release(a);
        assert!(lease.acquire(b, false));
    }

    #[test]
    fn test_concurrent_nonblocking_exactly_one_wins() {
        let lease = Arc::new(ExclusiveLease::new(fast_policy()));
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lease = lease.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    if lease.acquire(SessionId::next(), false) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_waits_for_release() {
        let lease = Arc::new(ExclusiveLease::new(LeasePolicy {
            retry_interval_ms: 1,
            max_wait_ms: Some(5_000),
        }));
        let a = SessionId::next();
        let b = SessionId::next();
        assert!(lease.acquire(a, false));

        let waiter = {
            let lease = lease.clone();
            thread::spawn(move || lease.acquire(b, true))
        };
        thread::sleep(Duration::from_millis(20));
        lease.release(a);
        assert!(waiter.join().unwrap());
        assert!(lease.is_held_by(b));
    }

    #[test]
    fn test_blocking_gives_up_after_max_wait() {
        let lease = ExclusiveLease::new(fast_policy());
        let a = SessionId::next();
        let b = SessionId::next();
        assert!(lease.acquire(a, false));
        assert!(!lease.acquire(b, true));
    }

    #[test]
    fn test_local_exclusive_nested() {
        let lease = ExclusiveLease::new(fast_policy());
        let a = SessionId::next();
        {
            let outer = lease.local(a).unwrap();
            assert!(outer.acquired());
            {
                let inner = lease.local(a).unwrap();
                assert!(!inner.acquired());
            }
            // inner guard must not have released the outer hold
            assert!(lease.is_held_by(a));
        }
        assert_eq!(lease.owner(), None);
    }

    #[test]
    fn test_local_exclusive_keeps_explicit_hold() {
        let lease = ExclusiveLease::new(fast_policy());
        let a = SessionId::next();
        assert!(lease.acquire(a, false));
        drop(lease.local(a).unwrap());
        assert!(lease.is_held_by(a));
    }

    #[test]
    fn test_local_exclusive_times_out() {
        let lease = ExclusiveLease::new(fast_policy());
        let a = SessionId::next();
        let b = SessionId::next();
        assert!(lease.acquire(a, false));
        assert!(matches!(
            lease.local(b),
            Err(OneWireError::ExclusiveTimeout(_))
        ));
    }

    #[test]
    fn test_cleanup_frees_stale_owner() {
        let lease = ExclusiveLease::new(fast_policy());
        let a = SessionId::next();
        assert!(lease.acquire(a, false));
        lease.cleanup(a);
        assert!(lease.acquire(SessionId::next(), false));
    }
}
