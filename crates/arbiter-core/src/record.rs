//! Holder records persisted in the registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// Identity of the process holding a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderIdentity {
    /// Process ID of the holder
    pub pid: u32,

    /// Hostname of the holder
    pub host: String,

    /// Kernel boot identifier, when the platform exposes one
    pub boot_id: Option<String>,

    /// Process start time in clock ticks since boot, used to detect PID reuse
    pub start_ticks: Option<u64>,
}

impl HolderIdentity {
    /// Identity of the current process
    pub fn current() -> Self {
        static CURRENT: OnceLock<HolderIdentity> = OnceLock::new();
        CURRENT
            .get_or_init(|| {
                let pid = std::process::id();
                Self {
                    pid,
                    host: local_host(),
                    boot_id: boot_id(),
                    start_ticks: process_start_ticks(pid),
                }
            })
            .clone()
    }
}

impl fmt::Display for HolderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}@{}", self.pid, self.host)
    }
}

/// Record describing the current holder of a resource key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderRecord {
    /// The resource key, verbatim
    pub resource_key: String,

    /// Human-readable session label
    pub session_name: String,

    /// Who holds the resource
    pub holder: HolderIdentity,

    /// When the resource was acquired
    pub acquired_at: DateTime<Utc>,

    /// Last heartbeat written by the holder
    pub heartbeat_at: DateTime<Utc>,

    /// Unique per acquisition
    pub token: Uuid,

    /// Advanced on every heartbeat refresh
    pub generation: u64,
}

impl HolderRecord {
    /// Create a fresh record for the current process
    pub fn new(resource_key: impl Into<String>, session_name: impl Into<String>) -> Self {
        Self::for_holder(resource_key, session_name, HolderIdentity::current())
    }

    /// Create a fresh record for an arbitrary holder
    pub fn for_holder(
        resource_key: impl Into<String>,
        session_name: impl Into<String>,
        holder: HolderIdentity,
    ) -> Self {
        let now = Utc::now();
        Self {
            resource_key: resource_key.into(),
            session_name: session_name.into(),
            holder,
            acquired_at: now,
            heartbeat_at: now,
            token: Uuid::new_v4(),
            generation: 0,
        }
    }

    /// Whether both records describe the same claim on the slot
    pub fn same_claim(&self, other: &HolderRecord) -> bool {
        self.token == other.token && self.generation == other.generation
    }

    /// The record that a heartbeat refresh would write
    pub fn refreshed(&self) -> Self {
        Self {
            heartbeat_at: Utc::now(),
            generation: self.generation + 1,
            ..self.clone()
        }
    }

    /// Time since the last heartbeat
    pub fn heartbeat_age(&self) -> chrono::Duration {
        Utc::now() - self.heartbeat_at
    }

    /// Time since acquisition
    pub fn held_for(&self) -> chrono::Duration {
        Utc::now() - self.acquired_at
    }
}

impl fmt::Display for HolderRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({})", self.session_name, self.holder)
    }
}

pub(crate) fn local_host() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

#[cfg(target_os = "linux")]
pub(crate) fn boot_id() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn boot_id() -> Option<String> {
    None
}

/// Fields of `/proc/<pid>/stat` from field 3 (state) onwards
#[cfg(target_os = "linux")]
fn stat_fields(pid: u32) -> Option<Vec<String>> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces and parens; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    Some(rest.split_whitespace().map(str::to_string).collect())
}

/// Start time of `pid` (field 22 of `/proc/<pid>/stat`)
#[cfg(target_os = "linux")]
pub(crate) fn process_start_ticks(pid: u32) -> Option<u64> {
    stat_fields(pid)?.get(19)?.parse().ok()
}

/// Scheduler state of `pid` (field 3 of `/proc/<pid>/stat`), e.g. `R`, `S`, `Z`
#[cfg(target_os = "linux")]
pub(crate) fn process_state(pid: u32) -> Option<char> {
    stat_fields(pid)?.first()?.chars().next()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn process_start_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn process_state(_pid: u32) -> Option<char> {
    None
}
