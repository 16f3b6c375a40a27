//! Liveness probing of recorded holders
//!
//! A holder is only reclaimed on positive evidence of death. Anything the
//! probe cannot establish is `Unknown`, which callers treat as alive.

use crate::record::{self, HolderRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Verdict of a liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Dead,
    Unknown,
}

impl Liveness {
    /// Only `Dead` permits reclamation
    pub fn is_reclaimable(self) -> bool {
        self == Self::Dead
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alive => write!(f, "alive"),
            Self::Dead => write!(f, "dead"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Decides whether a recorded holder is still alive
pub trait LivenessProbe: Send + Sync + fmt::Debug {
    fn probe(&self, record: &HolderRecord) -> Liveness;
}

/// Probe backed by the local process table
///
/// Checks, in order: heartbeat staleness (when configured), host, boot id,
/// then `kill(pid, 0)` cross-checked against the process state (zombies are
/// dead) and the recorded process start time to catch PID reuse.
#[derive(Debug, Clone)]
pub struct ProcessProbe {
    host: String,
    boot_id: Option<String>,
    stale_after: Option<Duration>,
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProcessProbe {
    pub fn new(stale_after: Option<Duration>) -> Self {
        Self {
            host: record::local_host(),
            boot_id: record::boot_id(),
            stale_after,
        }
    }

    fn heartbeat_expired(&self, record: &HolderRecord) -> bool {
        let Some(limit) = self.stale_after else {
            return false;
        };
        record
            .heartbeat_age()
            .to_std()
            .map(|age| age > limit)
            // Negative age: heartbeat from the future, clock skew
            .unwrap_or(false)
    }
}

impl LivenessProbe for ProcessProbe {
    fn probe(&self, record: &HolderRecord) -> Liveness {
        if self.heartbeat_expired(record) {
            return Liveness::Dead;
        }

        let holder = &record.holder;
        if holder.host != self.host {
            return Liveness::Unknown;
        }

        if let (Some(recorded), Some(current)) = (&holder.boot_id, &self.boot_id) {
            if recorded != current {
                return Liveness::Dead;
            }
        }

        match process_exists(holder.pid) {
            ProcessState::Missing => Liveness::Dead,
            ProcessState::Exists => {
                // An exited process awaiting its parent still answers kill(pid, 0)
                if matches!(record::process_state(holder.pid), Some('Z' | 'X')) {
                    return Liveness::Dead;
                }
                match (holder.start_ticks, record::process_start_ticks(holder.pid)) {
                    (Some(recorded), Some(current)) if recorded != current => Liveness::Dead,
                    _ => Liveness::Alive,
                }
            }
            ProcessState::Inaccessible => Liveness::Unknown,
        }
    }
}

enum ProcessState {
    Exists,
    Missing,
    /// The process may exist but cannot be signalled
    Inaccessible,
}

#[cfg(unix)]
fn process_exists(pid: u32) -> ProcessState {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return ProcessState::Inaccessible;
    };
    if pid <= 0 {
        return ProcessState::Inaccessible;
    }

    // Signal 0 performs the permission and existence checks only
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return ProcessState::Exists;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => ProcessState::Missing,
        _ => ProcessState::Inaccessible,
    }
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> ProcessState {
    ProcessState::Inaccessible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::HolderIdentity;
    use chrono::Utc;

    fn record_for(holder: HolderIdentity) -> HolderRecord {
        HolderRecord::for_holder("R1", "liveness-test", holder)
    }

    fn exited_child_pid() -> u32 {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("Failed to spawn child");
        let pid = child.id();
        child.wait().expect("Failed to reap child");
        pid
    }

    #[test]
    fn test_current_process_is_alive() {
        let probe = ProcessProbe::default();
        assert_eq!(probe.probe(&HolderRecord::new("R1", "me")), Liveness::Alive);
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_process_is_dead() {
        let probe = ProcessProbe::default();
        let holder = HolderIdentity {
            pid: exited_child_pid(),
            start_ticks: None,
            ..HolderIdentity::current()
        };
        assert_eq!(probe.probe(&record_for(holder)), Liveness::Dead);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unreaped_process_is_dead() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("Failed to spawn child");
        let pid = child.id();
        let holder = HolderIdentity {
            pid,
            start_ticks: record::process_start_ticks(pid),
            ..HolderIdentity::current()
        };
        let process_table = ProcessProbe::default();
        assert_eq!(process_table.probe(&record_for(holder.clone())), Liveness::Alive);

        // Killed but not waited on: the pid lingers as a zombie
        child.kill().expect("Failed to kill child");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while record::process_state(pid) != Some('Z') && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(record::process_state(pid), Some('Z'));
        assert_eq!(process_table.probe(&record_for(holder)), Liveness::Dead);

        child.wait().expect("Failed to reap child");
    }

    #[test]
    fn test_foreign_host_is_unknown() {
        let probe = ProcessProbe::default();
        let holder = HolderIdentity {
            host: format!("{}-elsewhere", HolderIdentity::current().host),
            ..HolderIdentity::current()
        };
        assert_eq!(probe.probe(&record_for(holder)), Liveness::Unknown);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_previous_boot_is_dead() {
        let probe = ProcessProbe::default();
        let holder = HolderIdentity {
            boot_id: Some("00000000-0000-0000-0000-000000000000".to_string()),
            ..HolderIdentity::current()
        };
        assert_eq!(probe.probe(&record_for(holder)), Liveness::Dead);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reused_pid_is_dead() {
        let probe = ProcessProbe::default();
        let current = HolderIdentity::current();
        let holder = HolderIdentity {
            start_ticks: current.start_ticks.map(|t| t + 1),
            ..current
        };
        assert_eq!(probe.probe(&record_for(holder)), Liveness::Dead);
    }

    #[test]
    fn test_stale_heartbeat_is_dead_when_enabled() {
        let mut record = HolderRecord::new("R1", "slow");
        record.heartbeat_at = Utc::now() - chrono::Duration::seconds(10);

        assert_eq!(ProcessProbe::default().probe(&record), Liveness::Alive);

        let strict = ProcessProbe::new(Some(Duration::from_secs(5)));
        assert_eq!(strict.probe(&record), Liveness::Dead);

        let lenient = ProcessProbe::new(Some(Duration::from_secs(60)));
        assert_eq!(lenient.probe(&record), Liveness::Alive);
    }

    #[test]
    fn test_only_dead_is_reclaimable() {
        assert!(Liveness::Dead.is_reclaimable());
        assert!(!Liveness::Alive.is_reclaimable());
        assert!(!Liveness::Unknown.is_reclaimable());
    }
}
