//! Shared physical link plus its exclusive-access lease.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use super::lease::{ExclusiveLease, LeasePolicy, LocalExclusive, SessionId};
use super::traits::{SerialLink, TransportError};
use crate::error::Result;
use crate::sync::lock;

/// One physical link shared by any number of sessions.
///
/// The link is opened when the first session registers and closed when the
/// last one ends. Bus traffic must happen while holding the lease; the link
/// mutex only protects the port object itself.
pub struct TransportSession {
    port_name: String,
    link: Mutex<Box<dyn SerialLink>>,
    lease: ExclusiveLease,
    users: Mutex<HashSet<SessionId>>,
}

impl TransportSession {
    pub fn new(link: Box<dyn SerialLink>, policy: LeasePolicy) -> Self {
        Self {
            port_name: link.port_name().to_string(),
            link: Mutex::new(link),
            lease: ExclusiveLease::new(policy),
            users: Mutex::new(HashSet::new()),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn lease(&self) -> &ExclusiveLease {
        &self.lease
    }

    /// Register `session` as a user, opening the link if needed.
    pub fn attach(&self, session: SessionId) -> std::result::Result<(), TransportError> {
        let mut users = lock(&self.users);
        let mut link = lock(&self.link);
        if !link.is_open() {
            link.open()?;
            debug!(port = %self.port_name, "Link opened");
        }
        users.insert(session);
        Ok(())
    }

    /// Direct access to the port. Callers should hold the lease.
    pub fn link(&self) -> MutexGuard<'_, Box<dyn SerialLink>> {
        lock(&self.link)
    }

    pub fn begin_exclusive(&self, session: SessionId, blocking: bool) -> bool {
        self.lease.acquire(session, blocking)
    }

    pub fn end_exclusive(&self, session: SessionId) {
        self.lease.release(session);
    }

    pub fn have_exclusive(&self, session: SessionId) -> bool {
        self.lease.is_held_by(session)
    }

    pub fn local_exclusive(&self, session: SessionId) -> Result<LocalExclusive<'_>> {
        self.lease.local(session)
    }

    /// Forget `session`: drop its lease and close the link if it was the
    /// last user.
    pub fn detach(&self, session: SessionId) {
        self.lease.cleanup(session);
        let mut users = lock(&self.users);
        if !users.remove(&session) || !users.is_empty() {
            return;
        }
        let mut link = lock(&self.link);
        if link.is_open() {
            if let Err(e) = link.close() {
                warn!(port = %self.port_name, error = %e, "Failed to close link");
            } else {
                debug!(port = %self.port_name, "Link closed, no sessions left");
            }
        }
    }

    pub fn session_count(&self) -> usize {
        lock(&self.users).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockLink;

    #[test]
    fn test_link_opens_on_first_attach_and_closes_on_last_detach() {
        let session = TransportSession::new(Box::new(MockLink::new()), LeasePolicy::default());
        let a = SessionId::next();
        let b = SessionId::next();

        assert!(!session.link().is_open());
        session.attach(a).unwrap();
        session.attach(b).unwrap();
        assert!(session.link().is_open());
        assert_eq!(session.session_count(), 2);

        session.detach(a);
        assert!(session.link().is_open());
        session.detach(b);
        assert!(!session.link().is_open());
    }

    #[test]
    fn test_detach_releases_lease() {
        let session = TransportSession::new(Box::new(MockLink::new()), LeasePolicy::default());
        let a = SessionId::next();
        session.attach(a).unwrap();
        assert!(session.begin_exclusive(a, false));
        session.detach(a);
        assert!(session.begin_exclusive(SessionId::next(), false));
    }

    #[test]
    fn test_detach_unknown_session_keeps_link_open() {
        let session = TransportSession::new(Box::new(MockLink::new()), LeasePolicy::default());
        let a = SessionId::next();
        session.attach(a).unwrap();
        session.detach(SessionId::next());
        assert!(session.link().is_open());
    }
}
