//! Sessions: named, exclusive access to one resource key
//!
//! A session is either idle or holding its resource. Dropping a session that
//! still holds its resource releases it, so an early return or a panic inside
//! the critical section cannot strand the lock until its holder is probed
//! dead.
//!
//! Sessions mutate through `&mut self`; share one across threads only behind
//! your own synchronization.

use crate::config::ArbiterConfig;
use crate::error::{LockError, LockResult};
use crate::guard::SessionGuard;
use crate::liveness::{Liveness, LivenessProbe, ProcessProbe};
use crate::machine::ResourceLock;
use crate::record::HolderRecord;
use crate::registry::Registry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Parameters identifying a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParameters {
    session_name: Option<String>,
    resource_key: Option<String>,
}

impl SessionParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Human-readable label recorded with the lock
    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    /// Opaque key of the shared resource
    pub fn with_resource_key(mut self, key: impl Into<String>) -> Self {
        self.resource_key = Some(key.into());
        self
    }

    pub fn session_name(&self) -> Option<&str> {
        self.session_name.as_deref()
    }

    pub fn resource_key(&self) -> Option<&str> {
        self.resource_key.as_deref()
    }

    /// Both parameters, or the first one missing
    pub fn validate(&self) -> LockResult<(&str, &str)> {
        let name = required(self.session_name.as_deref(), "session name")?;
        let key = required(self.resource_key.as_deref(), "resource key")?;
        Ok((name, key))
    }
}

fn required<'a>(value: Option<&'a str>, what: &str) -> LockResult<&'a str> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        Some(_) => Err(LockError::InvalidParameter(format!("{what} must not be empty"))),
        None => Err(LockError::InvalidParameter(format!("{what} was not set"))),
    }
}

/// Entry point: a registry plus the probe used to judge its holders
#[derive(Debug, Clone)]
pub struct Arbiter {
    registry: Arc<Registry>,
    probe: Arc<dyn LivenessProbe>,
    poll_interval: Duration,
}

impl Arbiter {
    /// Open the registry described by `config`
    pub fn open(config: &ArbiterConfig) -> LockResult<Self> {
        config.validate().map_err(LockError::config)?;
        Ok(Self {
            registry: Arc::new(Registry::open(&config.lock_dir)?),
            probe: Arc::new(ProcessProbe::new(config.stale_after())),
            poll_interval: config.poll_interval(),
        })
    }

    /// Open the registry named by the config file and `ARBITER_LOCK_DIR`
    ///
    /// This is the registry the `arbiter` CLI uses in the same environment.
    pub fn load() -> LockResult<Self> {
        let config = ArbiterConfig::load().map_err(LockError::config)?;
        Self::open(&config)
    }

    /// Replace the liveness probe
    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Judge a record with this arbiter's probe
    pub fn probe(&self, record: &HolderRecord) -> Liveness {
        self.probe.probe(record)
    }

    /// Open an idle session on `resource_key`
    pub fn session(
        &self,
        session_name: impl Into<String>,
        resource_key: impl Into<String>,
    ) -> LockResult<Session> {
        let params = SessionParameters::new()
            .with_session_name(session_name)
            .with_resource_key(resource_key);
        self.open_session(&params)
    }

    /// Open an idle session from parameters
    pub fn open_session(&self, params: &SessionParameters) -> LockResult<Session> {
        let (name, key) = params.validate()?;
        Ok(Session {
            lock: ResourceLock::new(
                key,
                name,
                self.registry.clone(),
                self.probe.clone(),
                self.poll_interval,
            ),
        })
    }
}

/// Exclusive session on one resource key
#[derive(Debug)]
pub struct Session {
    lock: ResourceLock,
}

impl Session {
    /// Session on the host's configured registry, see [`Arbiter::load`]
    pub fn new(session_name: impl Into<String>, resource_key: impl Into<String>) -> LockResult<Self> {
        Arbiter::load()?.session(session_name, resource_key)
    }

    pub fn name(&self) -> &str {
        self.lock.session_name()
    }

    pub fn resource_key(&self) -> &str {
        self.lock.resource_key()
    }

    /// Whether this session believes it holds its resource
    pub fn is_started(&self) -> bool {
        self.lock.is_locked()
    }

    /// The record published for the current hold
    pub fn record(&self) -> Option<&HolderRecord> {
        self.lock.record()
    }

    /// Acquire the resource if it is free right now
    ///
    /// `Ok(false)` means another live session holds it.
    pub fn start(&mut self) -> LockResult<bool> {
        self.lock.try_acquire()
    }

    /// Acquire the resource, retrying for up to `timeout_ms`
    pub fn timed_start(&mut self, timeout_ms: u64) -> LockResult<bool> {
        self.lock.timed_acquire(Duration::from_millis(timeout_ms))
    }

    /// Like [`Self::timed_start`], giving up early once `cancel` fires
    pub fn timed_start_until(
        &mut self,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> LockResult<bool> {
        self.lock
            .timed_acquire_until(Duration::from_millis(timeout_ms), cancel)
    }

    /// Release the resource
    pub fn stop(&mut self) -> LockResult<()> {
        self.lock.release()
    }

    /// Write a heartbeat for long holds
    pub fn refresh(&mut self) -> LockResult<()> {
        self.lock.refresh()
    }

    /// Confirm the registry still records this session as holder
    pub fn verify(&mut self) -> LockResult<bool> {
        self.lock.verify()
    }

    /// Acquire and return a guard that releases on drop
    ///
    /// `None` timeout tries once; `Some(ms)` waits up to `ms`.
    pub fn acquire(&mut self, timeout_ms: Option<u64>) -> LockResult<Option<SessionGuard<'_>>> {
        let acquired = match timeout_ms {
            Some(ms) => self.timed_start(ms)?,
            None => self.start()?,
        };
        if acquired {
            Ok(Some(SessionGuard::new(self)))
        } else {
            Ok(None)
        }
    }

    /// Run `f` while holding the resource
    ///
    /// `Ok(None)` if the resource could not be acquired in time. The resource
    /// is released even if `f` panics.
    pub fn run_exclusive<T>(
        &mut self,
        timeout_ms: Option<u64>,
        f: impl FnOnce() -> T,
    ) -> LockResult<Option<T>> {
        let Some(guard) = self.acquire(timeout_ms)? else {
            return Ok(None);
        };
        let value = f();
        guard.release()?;
        Ok(Some(value))
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_started() { "held" } else { "idle" };
        write!(f, "Session[{}@{}: {}]", self.name(), self.resource_key(), state)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.lock.is_locked() {
            if let Err(e) = self.lock.release() {
                warn!(
                    resource_key = %self.lock.resource_key(),
                    session = %self.lock.session_name(),
                    error = %e,
                    "Failed to release lock on drop"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_arbiter() -> (Arbiter, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = ArbiterConfig::default().with_lock_dir(temp_dir.path().join("locks"));
        let arbiter = Arbiter::open(&config).expect("Failed to open arbiter");
        (arbiter, temp_dir)
    }

    #[test]
    fn test_parameters_are_required() {
        let missing = SessionParameters::new().with_session_name("a");
        assert!(matches!(missing.validate(), Err(LockError::InvalidParameter(_))));

        let empty = SessionParameters::new()
            .with_session_name("")
            .with_resource_key("R1");
        assert!(matches!(empty.validate(), Err(LockError::InvalidParameter(_))));

        let ok = SessionParameters::new()
            .with_session_name("a")
            .with_resource_key("R1");
        assert_eq!(ok.validate().unwrap(), ("a", "R1"));
    }

    #[test]
    fn test_start_stop() {
        let (arbiter, _temp) = create_test_arbiter();
        let mut session = arbiter.session("a", "R1").unwrap();

        assert!(!session.is_started());
        assert!(session.start().unwrap());
        assert!(session.is_started());
        assert_eq!(session.record().map(|r| r.session_name.as_str()), Some("a"));
        session.stop().unwrap();
        assert!(!session.is_started());
        assert!(matches!(session.stop(), Err(LockError::NotStarted { .. })));
    }

    #[test]
    fn test_drop_releases() {
        let (arbiter, _temp) = create_test_arbiter();
        {
            let mut session = arbiter.session("a", "R1").unwrap();
            assert!(session.start().unwrap());
        }
        assert_eq!(arbiter.registry().read("R1").unwrap(), None);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (arbiter, _temp) = create_test_arbiter();
        let mut session = arbiter.session("a", "R1").unwrap();

        {
            let guard = session.acquire(None).unwrap().expect("should acquire");
            assert_eq!(guard.resource_key(), "R1");
            assert!(arbiter.registry().read("R1").unwrap().is_some());
        }
        assert!(!session.is_started());
        assert_eq!(arbiter.registry().read("R1").unwrap(), None);
    }

    #[test]
    fn test_run_exclusive() {
        let (arbiter, _temp) = create_test_arbiter();
        let mut session = arbiter.session("a", "R1").unwrap();
        let mut other = arbiter.session("b", "R1").unwrap();

        let seen = session
            .run_exclusive(None, || other.start())
            .unwrap()
            .expect("should acquire");
        assert!(!seen.unwrap());
        assert!(!session.is_started());
        assert!(other.start().unwrap());

        assert_eq!(session.run_exclusive(Some(20), || 7).unwrap(), None);
    }

    #[test]
    fn test_run_exclusive_releases_on_panic() {
        let (arbiter, _temp) = create_test_arbiter();
        let mut session = arbiter.session("a", "R1").unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            session
                .run_exclusive(None, || -> u32 { panic!("device fault") })
                .ok();
        }));
        assert!(result.is_err());
        assert_eq!(arbiter.registry().read("R1").unwrap(), None);
    }

    #[test]
    fn test_display() {
        let (arbiter, _temp) = create_test_arbiter();
        let mut session = arbiter.session("readout", "#3").unwrap();
        assert_eq!(session.to_string(), "Session[readout@#3: idle]");
        session.start().unwrap();
        assert_eq!(session.to_string(), "Session[readout@#3: held]");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ArbiterConfig {
            poll_interval_ms: 0,
            ..ArbiterConfig::default()
        };
        assert!(matches!(
            Arbiter::open(&config),
            Err(LockError::InvalidConfig(_))
        ));
    }
}
