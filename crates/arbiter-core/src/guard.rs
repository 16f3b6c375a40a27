//! Scoped critical sections
//!
//! A [`SessionGuard`] borrows a started session and stops it when dropped,
//! ensuring release even in the presence of panics or early returns.

use crate::error::LockResult;
use crate::record::HolderRecord;
use crate::session::Session;
use std::fmt;
use tracing::warn;

/// Holds a session's resource until dropped
#[derive(Debug)]
pub struct SessionGuard<'a> {
    session: &'a mut Session,
    released: bool,
}

impl<'a> SessionGuard<'a> {
    /// Wrap a session that has just been started
    pub(crate) fn new(session: &'a mut Session) -> Self {
        Self {
            session,
            released: false,
        }
    }

    pub fn resource_key(&self) -> &str {
        self.session.resource_key()
    }

    pub fn session_name(&self) -> &str {
        self.session.name()
    }

    /// The record published for this hold
    pub fn record(&self) -> Option<&HolderRecord> {
        self.session.record()
    }

    /// Write a heartbeat while inside the critical section
    pub fn refresh(&mut self) -> LockResult<()> {
        self.session.refresh()
    }

    /// Release explicitly, surfacing any error
    pub fn release(mut self) -> LockResult<()> {
        self.released = true;
        self.session.stop()
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if self.released || !self.session.is_started() {
            return;
        }
        if let Err(e) = self.session.stop() {
            warn!(
                resource_key = %self.session.resource_key(),
                error = %e,
                "Failed to release guarded session"
            );
        }
    }
}

impl fmt::Display for SessionGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guard[{}@{}]", self.session_name(), self.resource_key())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ArbiterConfig;
    use crate::error::LockError;
    use crate::session::Arbiter;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_release() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let arbiter = Arbiter::open(&ArbiterConfig::default().with_lock_dir(temp_dir.path()))
            .expect("Failed to open arbiter");
        let mut session = arbiter.session("a", "#7").unwrap();

        let mut guard = session.acquire(Some(0)).unwrap().expect("should acquire");
        assert_eq!(guard.to_string(), "Guard[a@#7]");
        guard.refresh().unwrap();
        assert_eq!(guard.record().map(|r| r.generation), Some(1));
        guard.release().unwrap();

        assert!(!session.is_started());
        assert!(matches!(session.stop(), Err(LockError::NotStarted { .. })));
    }

    #[test]
    fn test_guard_after_eviction_does_not_touch_new_holder() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let arbiter = Arbiter::open(&ArbiterConfig::default().with_lock_dir(temp_dir.path()))
            .expect("Failed to open arbiter");
        let mut session = arbiter.session("a", "#7").unwrap();

        let guard = session.acquire(None).unwrap().expect("should acquire");
        let ours = guard.record().cloned().unwrap();
        arbiter.registry().release(&ours).unwrap();
        let mut usurper = arbiter.session("b", "#7").unwrap();
        assert!(usurper.start().unwrap());

        // Dropping the guard reports the loss and leaves the usurper alone
        drop(guard);
        assert!(!session.is_started());
        assert_eq!(arbiter.registry().read("#7").unwrap().as_ref(), usurper.record());
    }
}
