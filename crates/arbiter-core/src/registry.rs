//! File-backed resource registry
//!
//! One file per resource key in a directory shared by every process on the
//! host. The registry offers three mutating primitives, all atomic across
//! processes:
//!
//! - `try_claim`: create-if-absent. The record is written to a private temp
//!   file and published with `link(2)`, which fails if the entry exists, so
//!   readers never see a half-written record.
//! - `release`: compare-and-delete.
//! - `force_reclaim` / `refresh`: compare-and-replace, published with
//!   `rename(2)`.
//!
//! The compare operations run under an exclusive `flock` on a per-key guard
//! file. The kernel drops that lock when its process dies, and guard files
//! are never deleted. `try_claim` takes no guard: an existing entry only
//! disappears through a guarded operation.

use crate::error::{LockError, LockResult};
use crate::record::HolderRecord;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

/// Extension of record files
const RECORD_EXT: &str = "lock";

/// Extension of guard files
const GUARD_EXT: &str = "guard";

/// Extension of staged records awaiting publication
const STAGED_EXT: &str = "tmp";

/// Longest hex-encoded key used verbatim in a file name
const MAX_HEX_NAME: usize = 128;

/// How often `try_claim` retries when the entry vanishes under it
const CLAIM_ATTEMPTS: u32 = 3;

/// Outcome of [`Registry::try_claim`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The entry was created with our record
    Claimed,
    /// Someone else holds the entry
    Held(HolderRecord),
    /// The entry kept changing under us; treat as contention
    Busy,
}

/// Outcome of [`Registry::release`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Our record was removed
    Released,
    /// The slot holds another claim, or nothing
    NotOwner(Option<HolderRecord>),
}

/// Outcome of [`Registry::force_reclaim`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reclaim {
    /// The stale record was replaced by ours
    Reclaimed,
    /// Someone reclaimed, released or refreshed first
    LostRace,
}

/// Cross-process mapping from resource key to holder record
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    /// Open the registry rooted at `dir`, creating the directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> LockResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| LockError::unavailable(&dir, e))?;
        Ok(Self { dir })
    }

    /// Directory holding the registry files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record file for `key`
    pub fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{RECORD_EXT}", entry_name(key)))
    }

    fn guard_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{GUARD_EXT}", entry_name(key)))
    }

    /// Atomically create the entry for `record.resource_key` if absent
    pub fn try_claim(&self, record: &HolderRecord) -> LockResult<Claim> {
        let key = &record.resource_key;
        let target = self.record_path(key);
        let staged = self.stage(record)?;

        let mut outcome = Claim::Busy;
        for _ in 0..CLAIM_ATTEMPTS {
            match fs::hard_link(&staged, &target) {
                Ok(()) => {
                    outcome = Claim::Claimed;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match self.read(key) {
                    Ok(Some(existing)) => {
                        outcome = Claim::Held(existing);
                        break;
                    }
                    // Released between our link and our read
                    Ok(None) => continue,
                    Err(e) => {
                        discard(&staged);
                        return Err(e);
                    }
                },
                Err(e) => {
                    discard(&staged);
                    return Err(LockError::unavailable(&target, e));
                }
            }
        }

        discard(&staged);
        debug!(resource_key = %key, outcome = claim_label(&outcome), "Claim attempted");
        Ok(outcome)
    }

    /// Snapshot of the current holder of `key`
    pub fn read(&self, key: &str) -> LockResult<Option<HolderRecord>> {
        let path = self.record_path(key);
        let Some(record) = read_record(&path)? else {
            return Ok(None);
        };
        if record.resource_key != key {
            return Err(LockError::corrupt(
                &path,
                format!("record names resource '{}'", record.resource_key),
            ));
        }
        Ok(Some(record))
    }

    /// Remove the entry only if it still holds `expected`'s claim
    pub fn release(&self, expected: &HolderRecord) -> LockResult<Release> {
        let key = &expected.resource_key;
        let _guard = self.lock_guard(key)?;

        match self.read(key)? {
            Some(current) if current.same_claim(expected) => {
                let path = self.record_path(key);
                fs::remove_file(&path).map_err(|e| LockError::unavailable(&path, e))?;
                Ok(Release::Released)
            }
            other => Ok(Release::NotOwner(other)),
        }
    }

    /// Replace a dead holder's record with `new` if the slot is unchanged
    pub fn force_reclaim(&self, stale: &HolderRecord, new: &HolderRecord) -> LockResult<Reclaim> {
        if self.compare_and_replace(stale, new)? {
            Ok(Reclaim::Reclaimed)
        } else {
            Ok(Reclaim::LostRace)
        }
    }

    /// Publish a heartbeat; false if `current` no longer owns the slot
    pub fn refresh(&self, current: &HolderRecord, refreshed: &HolderRecord) -> LockResult<bool> {
        self.compare_and_replace(current, refreshed)
    }

    /// All records currently in the registry, skipping unreadable ones
    pub fn list(&self) -> LockResult<Vec<HolderRecord>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| LockError::unavailable(&self.dir, e))?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == RECORD_EXT).unwrap_or(false) {
                match read_record(&path) {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
                }
            }
        }
        records.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        Ok(records)
    }

    /// Record files that cannot be parsed
    pub fn corrupt_entries(&self) -> LockResult<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| LockError::unavailable(&self.dir, e))?;

        Ok(entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|e| e == RECORD_EXT).unwrap_or(false))
            .filter(|path| matches!(read_record(path), Err(LockError::CorruptRecord { .. })))
            .collect())
    }

    /// Delete a record file regardless of its contents
    ///
    /// Operator escape hatch for corrupt records; live holders will notice
    /// the loss on their next release or refresh.
    pub fn purge(&self, record_path: &Path) -> LockResult<bool> {
        if record_path.parent() != Some(self.dir.as_path()) {
            return Err(LockError::InvalidParameter(format!(
                "{} is not inside the registry",
                record_path.display()
            )));
        }
        match fs::remove_file(record_path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LockError::unavailable(record_path, e)),
        }
    }

    /// Delete staged records older than `max_age`
    ///
    /// A writer that dies between staging and publishing leaves its temp file
    /// behind. Staged files live for microseconds, so anything older belongs
    /// to a dead writer.
    pub fn sweep_staged(&self, max_age: Duration) -> LockResult<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| LockError::unavailable(&self.dir, e))?;
        let now = SystemTime::now();

        let mut swept = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_staged(&path) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if !age.is_some_and(|age| age > max_age) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Swept abandoned staged record");
                    swept.push(path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(LockError::unavailable(&path, e)),
            }
        }
        swept.sort();
        Ok(swept)
    }

    fn compare_and_replace(&self, expected: &HolderRecord, new: &HolderRecord) -> LockResult<bool> {
        let key = &expected.resource_key;
        if new.resource_key != *key {
            return Err(LockError::InvalidParameter(format!(
                "cannot replace record for '{}' with one for '{}'",
                key, new.resource_key
            )));
        }

        let _guard = self.lock_guard(key)?;
        match self.read(key)? {
            Some(current) if current.same_claim(expected) => {
                let staged = self.stage(new)?;
                let target = self.record_path(key);
                fs::rename(&staged, &target).map_err(|e| {
                    discard(&staged);
                    LockError::unavailable(&target, e)
                })?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Write `record` to a private temp file in the registry directory
    fn stage(&self, record: &HolderRecord) -> LockResult<PathBuf> {
        let path = self.dir.join(format!(
            ".{}.{}.{STAGED_EXT}",
            entry_name(&record.resource_key),
            Uuid::new_v4().simple()
        ));
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| LockError::corrupt(&path, format!("failed to serialize record: {e}")))?;

        let write = || -> io::Result<()> {
            let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
            file.write_all(&json)?;
            file.sync_all()
        };
        write().map_err(|e| {
            discard(&path);
            LockError::unavailable(&path, e)
        })?;
        Ok(path)
    }

    /// Exclusive advisory lock serializing compare operations on `key`
    fn lock_guard(&self, key: &str) -> LockResult<GuardLock> {
        let path = self.guard_path(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| LockError::unavailable(&path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| LockError::unavailable(&path, e))?;
        Ok(GuardLock { file })
    }
}

/// Holds a guard file's `flock` until dropped
struct GuardLock {
    file: File,
}

impl Drop for GuardLock {
    fn drop(&mut self) {
        // Closing the descriptor also unlocks
        let _ = FileExt::unlock(&self.file);
    }
}

/// File-name stem for `key`
///
/// Hex keeps keys case-sensitive and injective; long keys fall back to a
/// SHA-256 digest and rely on the stored key for verification.
pub(crate) fn entry_name(key: &str) -> String {
    let encoded = hex::encode(key.as_bytes());
    if encoded.len() <= MAX_HEX_NAME {
        format!("k-{encoded}")
    } else {
        format!("h-{}", hex::encode(Sha256::digest(key.as_bytes())))
    }
}

fn is_staged(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    hidden && path.extension().is_some_and(|e| e == STAGED_EXT)
}

fn read_record(path: &Path) -> LockResult<Option<HolderRecord>> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LockError::unavailable(path, e)),
    };
    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|e| LockError::corrupt(path, format!("failed to parse record: {e}")))
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove staged record");
        }
    }
}

fn claim_label(claim: &Claim) -> &'static str {
    match claim {
        Claim::Claimed => "claimed",
        Claim::Held(_) => "held",
        Claim::Busy => "busy",
    }
}
