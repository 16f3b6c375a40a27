//! Per-resource lock state machine
//!
//! `Unlocked -> Locked` on a successful claim or reclamation, `Locked ->
//! Unlocked` on release or when ownership turns out to be lost. Contention is
//! reported as `Ok(false)`; registry failures propagate immediately.

use crate::error::{LockError, LockResult};
use crate::liveness::{Liveness, LivenessProbe};
use crate::record::HolderRecord;
use crate::registry::{Claim, Reclaim, Registry, Release};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local view of a resource's lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    /// Held by this machine, with the exact record it published
    Locked(HolderRecord),
}

/// Lock state machine for one resource key
#[derive(Debug)]
pub struct ResourceLock {
    resource_key: String,
    session_name: String,
    registry: Arc<Registry>,
    probe: Arc<dyn LivenessProbe>,
    poll_interval: Duration,
    state: LockState,
}

impl ResourceLock {
    pub fn new(
        resource_key: impl Into<String>,
        session_name: impl Into<String>,
        registry: Arc<Registry>,
        probe: Arc<dyn LivenessProbe>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            session_name: session_name.into(),
            registry,
            probe,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            state: LockState::Unlocked,
        }
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn state(&self) -> &LockState {
        &self.state
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.state, LockState::Locked(_))
    }

    /// The record this machine published, while locked
    pub fn record(&self) -> Option<&HolderRecord> {
        match &self.state {
            LockState::Locked(record) => Some(record),
            LockState::Unlocked => None,
        }
    }

    /// Try once to acquire the lock, never waiting
    pub fn try_acquire(&mut self) -> LockResult<bool> {
        self.ensure_unlocked()?;
        self.attempt()
    }

    /// Poll for the lock until `timeout` elapses
    ///
    /// Returns `Ok(false)` no earlier than `timeout` and at most one poll
    /// interval after it. A zero timeout makes exactly one attempt.
    pub fn timed_acquire(&mut self, timeout: Duration) -> LockResult<bool> {
        self.poll_acquire(timeout, None)
    }

    /// Like [`Self::timed_acquire`], giving up early once `cancel` fires
    pub fn timed_acquire_until(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> LockResult<bool> {
        self.poll_acquire(timeout, Some(cancel))
    }

    /// Release the lock this machine holds
    pub fn release(&mut self) -> LockResult<()> {
        let record = match &self.state {
            LockState::Locked(record) => record.clone(),
            LockState::Unlocked => {
                return Err(LockError::NotStarted {
                    session: self.session_name.clone(),
                    resource: self.resource_key.clone(),
                });
            }
        };

        match self.registry.release(&record)? {
            Release::Released => {
                self.state = LockState::Unlocked;
                info!(
                    resource_key = %self.resource_key,
                    session = %self.session_name,
                    held_ms = record.held_for().num_milliseconds(),
                    "Lock released"
                );
                Ok(())
            }
            Release::NotOwner(current) => Err(self.ownership_lost(current)),
        }
    }

    /// Write a fresh heartbeat into the registry
    pub fn refresh(&mut self) -> LockResult<()> {
        let record = match &self.state {
            LockState::Locked(record) => record.clone(),
            LockState::Unlocked => {
                return Err(LockError::NotStarted {
                    session: self.session_name.clone(),
                    resource: self.resource_key.clone(),
                });
            }
        };

        let refreshed = record.refreshed();
        if self.registry.refresh(&record, &refreshed)? {
            debug!(
                resource_key = %self.resource_key,
                generation = refreshed.generation,
                "Heartbeat refreshed"
            );
            self.state = LockState::Locked(refreshed);
            Ok(())
        } else {
            let current = self.registry.read(&self.resource_key)?;
            Err(self.ownership_lost(current))
        }
    }

    /// Check the registry still holds our claim, dropping to `Unlocked` if not
    pub fn verify(&mut self) -> LockResult<bool> {
        let LockState::Locked(record) = &self.state else {
            return Ok(false);
        };
        let current = self.registry.read(&self.resource_key)?;
        if current.as_ref().is_some_and(|c| c.same_claim(record)) {
            return Ok(true);
        }
        warn!(resource_key = %self.resource_key, session = %self.session_name, "Lock ownership lost");
        self.state = LockState::Unlocked;
        Ok(false)
    }

    fn ensure_unlocked(&self) -> LockResult<()> {
        if self.is_locked() {
            return Err(LockError::AlreadyStarted {
                session: self.session_name.clone(),
                resource: self.resource_key.clone(),
            });
        }
        Ok(())
    }

    fn poll_acquire(
        &mut self,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> LockResult<bool> {
        self.ensure_unlocked()?;

        let start = Instant::now();
        let deadline = start + timeout;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if self.attempt()? {
                debug!(
                    resource_key = %self.resource_key,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Timed acquisition succeeded"
                );
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(resource_key = %self.resource_key, attempts, "Timed acquisition expired");
                return Ok(false);
            }
            if cancel.is_some_and(|c| c.is_cancelled()) {
                debug!(resource_key = %self.resource_key, attempts, "Timed acquisition cancelled");
                return Ok(false);
            }

            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// One immediate acquisition attempt
    fn attempt(&mut self) -> LockResult<bool> {
        let record = HolderRecord::new(self.resource_key.as_str(), self.session_name.as_str());

        let existing = match self.registry.try_claim(&record)? {
            Claim::Claimed => {
                info!(resource_key = %self.resource_key, session = %self.session_name, "Lock acquired");
                self.state = LockState::Locked(record);
                return Ok(true);
            }
            Claim::Busy => return Ok(false),
            Claim::Held(existing) => existing,
        };

        match self.probe.probe(&existing) {
            Liveness::Dead => {}
            verdict @ (Liveness::Alive | Liveness::Unknown) => {
                debug!(
                    resource_key = %self.resource_key,
                    holder = %existing,
                    liveness = %verdict,
                    "Resource held"
                );
                return Ok(false);
            }
        }

        match self.registry.force_reclaim(&existing, &record)? {
            Reclaim::Reclaimed => {
                warn!(
                    resource_key = %self.resource_key,
                    session = %self.session_name,
                    stale_holder = %existing,
                    "Reclaimed lock from dead holder"
                );
                self.state = LockState::Locked(record);
                Ok(true)
            }
            Reclaim::LostRace => {
                debug!(resource_key = %self.resource_key, "Lost reclamation race");
                Ok(false)
            }
        }
    }

    fn ownership_lost(&mut self, current: Option<HolderRecord>) -> LockError {
        warn!(resource_key = %self.resource_key, session = %self.session_name, "Lock ownership lost");
        self.state = LockState::Unlocked;
        LockError::OwnershipLost {
            session: self.session_name.clone(),
            resource: self.resource_key.clone(),
            holder: current.map(|c| c.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::ProcessProbe;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct FixedProbe(Liveness);

    impl LivenessProbe for FixedProbe {
        fn probe(&self, _record: &HolderRecord) -> Liveness {
            self.0
        }
    }

    fn create_test_registry() -> (Arc<Registry>, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let registry = Registry::open(temp_dir.path().join("locks")).expect("Failed to open");
        (Arc::new(registry), temp_dir)
    }

    fn lock_with(registry: &Arc<Registry>, name: &str, probe: Liveness) -> ResourceLock {
        ResourceLock::new(
            "R1",
            name,
            registry.clone(),
            Arc::new(FixedProbe(probe)),
            Duration::from_millis(5),
        )
    }

    #[test]
    fn test_acquire_and_release() {
        let (registry, _temp) = create_test_registry();
        let mut lock = lock_with(&registry, "a", Liveness::Alive);

        assert!(lock.try_acquire().unwrap());
        assert!(lock.is_locked());
        assert_eq!(registry.read("R1").unwrap().as_ref(), lock.record());

        lock.release().unwrap();
        assert_eq!(lock.state(), &LockState::Unlocked);
        assert_eq!(registry.read("R1").unwrap(), None);
    }

    #[test]
    fn test_double_acquire_is_misuse() {
        let (registry, _temp) = create_test_registry();
        let mut lock = lock_with(&registry, "a", Liveness::Alive);

        assert!(lock.try_acquire().unwrap());
        assert!(matches!(lock.try_acquire(), Err(LockError::AlreadyStarted { .. })));
        assert!(matches!(
            lock.timed_acquire(Duration::from_millis(10)),
            Err(LockError::AlreadyStarted { .. })
        ));
        assert!(lock.is_locked());
    }

    #[test]
    fn test_release_while_unlocked_is_misuse() {
        let (registry, _temp) = create_test_registry();
        let mut holder = lock_with(&registry, "a", Liveness::Alive);
        let mut other = lock_with(&registry, "b", Liveness::Alive);
        assert!(holder.try_acquire().unwrap());

        assert!(matches!(other.release(), Err(LockError::NotStarted { .. })));
        assert_eq!(registry.read("R1").unwrap().as_ref(), holder.record());
    }

    #[test]
    fn test_probe_verdict_controls_reclamation() {
        let (registry, _temp) = create_test_registry();
        let mut holder = lock_with(&registry, "holder", Liveness::Alive);
        assert!(holder.try_acquire().unwrap());

        assert!(!lock_with(&registry, "b", Liveness::Alive).try_acquire().unwrap());
        assert!(!lock_with(&registry, "c", Liveness::Unknown).try_acquire().unwrap());

        let mut reclaimer = lock_with(&registry, "d", Liveness::Dead);
        assert!(reclaimer.try_acquire().unwrap());
        assert_eq!(registry.read("R1").unwrap().as_ref(), reclaimer.record());

        // The evicted holder cannot release the new owner's record
        let err = holder.release().unwrap_err();
        assert!(matches!(err, LockError::OwnershipLost { .. }));
        assert!(!holder.is_locked());
        assert_eq!(registry.read("R1").unwrap().as_ref(), reclaimer.record());
    }

    #[test]
    fn test_refresh_and_verify() {
        let (registry, _temp) = create_test_registry();
        let mut lock = lock_with(&registry, "a", Liveness::Alive);
        assert!(matches!(lock.refresh(), Err(LockError::NotStarted { .. })));

        assert!(lock.try_acquire().unwrap());
        lock.refresh().unwrap();
        assert_eq!(lock.record().map(|r| r.generation), Some(1));
        assert!(lock.verify().unwrap());

        // Evict it from outside
        let current = registry.read("R1").unwrap().unwrap();
        assert_eq!(registry.release(&current).unwrap(), Release::Released);

        assert!(!lock.verify().unwrap());
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_refresh_after_eviction_reports_lost() {
        let (registry, _temp) = create_test_registry();
        let mut lock = lock_with(&registry, "a", Liveness::Alive);
        assert!(lock.try_acquire().unwrap());

        let mut thief = lock_with(&registry, "thief", Liveness::Dead);
        assert!(thief.try_acquire().unwrap());

        assert!(matches!(lock.refresh(), Err(LockError::OwnershipLost { .. })));
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_timed_acquire_zero_timeout_tries_once() {
        let (registry, _temp) = create_test_registry();
        let mut lock = lock_with(&registry, "a", Liveness::Alive);
        assert!(lock.timed_acquire(Duration::ZERO).unwrap());

        let mut other = lock_with(&registry, "b", Liveness::Alive);
        let start = Instant::now();
        assert!(!other.timed_acquire(Duration::ZERO).unwrap());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_cancelled_wait_returns_early() {
        let (registry, _temp) = create_test_registry();
        let mut holder = lock_with(&registry, "a", Liveness::Alive);
        assert!(holder.try_acquire().unwrap());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut waiter = lock_with(&registry, "b", Liveness::Alive);
        let start = Instant::now();
        assert!(!waiter.timed_acquire_until(Duration::from_secs(10), &cancel).unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_registry_failure_propagates_from_wait() {
        let (registry, _temp) = create_test_registry();
        std::fs::write(registry.record_path("R1"), b"garbage").unwrap();

        let mut lock = ResourceLock::new(
            "R1",
            "a",
            registry.clone(),
            Arc::new(ProcessProbe::default()),
            Duration::from_millis(5),
        );
        let start = Instant::now();
        let err = lock.timed_acquire(Duration::from_secs(5)).unwrap_err();
        assert!(err.is_registry_failure());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
