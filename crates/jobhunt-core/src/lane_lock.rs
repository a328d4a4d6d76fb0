//! Lane-level mutual exclusion.
//!
//! A lane is one ATS integration (`ashby`, `greenhouse`, ...). At most one
//! worker may be dispatched into a lane at a time; the dispatcher records the
//! dispatch by writing `.locks/apply-<lane>.lock`.
//!
//! Locks are time-based rather than PID-based: the process that writes the
//! lock exits immediately, so its PID says nothing about the worker. Instead a
//! lock is healed in two ways on [`LaneLockManager::check`]:
//!
//! - **orphan heal**: past the grace period, the injected [`LivenessOracle`]
//!   is asked whether any worker for the lane is still running; if not, the
//!   lock is removed.
//! - **TTL heal**: past the lane's TTL the lock is removed unconditionally.
//!
//! An oracle that cannot answer (unreadable run registry) fails closed: the
//! lock is treated as corroborated and only the TTL can clear it.
//!
//! Writers of a lock file hold `.locks/apply-<lane>.guard`. A heal removes the
//! lock only if it is still the one that was assessed.
//!
//! ```text
//! <workspace>/.locks/apply-<lane>.lock
//!   1767225600
//!   pid=4242
//!   host=worker-1
//! ```

use std::fmt;
use std::fs::File;
use std::io;
use std::path::PathBuf;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::LanesConfig;
use crate::fsio;
use crate::reconcile::registry::RegistryError;

/// Maximum lane name length.
pub const MAX_LANE_NAME_LENGTH: usize = 64;

/// Maximum lock file size read.
const MAX_LOCK_FILE_SIZE: u64 = 4096;

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by lane lock operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LaneLockError {
    /// The lane name is not usable as a path component.
    #[error("invalid lane name: {0}")]
    InvalidLane(String),

    /// Filesystem failure.
    #[error("lane lock I/O error: {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl LaneLockError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Validate a lane name.
///
/// Lane names must be non-empty ASCII alphanumerics, hyphens and underscores,
/// at most [`MAX_LANE_NAME_LENGTH`] bytes, and contain no `..`.
///
/// # Errors
///
/// Returns [`LaneLockError::InvalidLane`] describing the first violation.
pub fn validate_lane_name(lane: &str) -> Result<(), LaneLockError> {
    if lane.is_empty() {
        return Err(LaneLockError::InvalidLane("lane name is empty".to_string()));
    }
    if lane.len() > MAX_LANE_NAME_LENGTH {
        return Err(LaneLockError::InvalidLane(format!(
            "lane name exceeds {MAX_LANE_NAME_LENGTH} bytes"
        )));
    }
    if !lane
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(LaneLockError::InvalidLane(format!(
            "lane name contains invalid characters: {lane}"
        )));
    }
    if lane.contains("..") {
        return Err(LaneLockError::InvalidLane(format!(
            "lane name contains path traversal: {lane}"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Liveness
// ─────────────────────────────────────────────────────────────────────────────

/// Answers whether a worker for a lane is still running.
pub trait LivenessOracle {
    /// Whether any worker attributed to `lane` is live at `now` (epoch
    /// seconds).
    ///
    /// # Errors
    ///
    /// Returns an error when the collaborator state cannot be read. Callers
    /// treat an error as "live".
    fn has_live_worker(&self, lane: &str, now: f64) -> Result<bool, RegistryError>;
}

impl<F> LivenessOracle for F
where
    F: Fn(&str, f64) -> Result<bool, RegistryError>,
{
    fn has_live_worker(&self, lane: &str, now: f64) -> Result<bool, RegistryError> {
        self(lane, now)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lock Records
// ─────────────────────────────────────────────────────────────────────────────

/// A lane lock as read from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneLock {
    /// Lane name.
    pub lane: String,
    /// Acquisition time (epoch seconds). Falls back to the file mtime when
    /// the first line is not a timestamp.
    pub acquired_at: f64,
    /// PID of the process that wrote the lock.
    pub owner_pid: Option<u32>,
    /// Host that wrote the lock.
    pub owner_host: Option<String>,
    /// TTL applied to this lane.
    pub ttl_secs: u64,
}

impl LaneLock {
    fn parse(lane: &str, content: &str, mtime: f64, ttl_secs: u64) -> Self {
        let first = content.lines().next().unwrap_or_default().trim();
        let acquired_at = if !first.is_empty() && first.bytes().all(|b| b.is_ascii_digit()) {
            first.parse::<u64>().map_or(mtime, |v| v as f64)
        } else {
            mtime
        };
        let mut owner_pid = None;
        let mut owner_host = None;
        for line in content.lines() {
            if let Some(pid) = line.trim().strip_prefix("pid=") {
                owner_pid = pid.parse().ok();
            } else if let Some(host) = line.trim().strip_prefix("host=") {
                owner_host = Some(host.to_string());
            }
        }
        Self {
            lane: lane.to_string(),
            acquired_at,
            owner_pid,
            owner_host,
            ttl_secs,
        }
    }

    /// Age at `now`, never negative.
    pub fn age_secs(&self, now: f64) -> f64 {
        (now - self.acquired_at).max(0.0)
    }
}

/// Why a lock was removed by [`LaneLockManager::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealReason {
    /// No live worker corroborates the lock.
    Orphan,
    /// The lock outlived the lane TTL.
    Stale,
}

impl fmt::Display for HealReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Orphan => "orphan",
            Self::Stale => "stale",
        })
    }
}

/// Result of [`LaneLockManager::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaneCheck {
    /// The lane is free.
    Unlocked {
        /// Set when this check removed a lock.
        healed: Option<HealReason>,
    },
    /// The lane is held.
    Locked {
        /// Lock age in seconds.
        age_secs: u64,
        /// Lane TTL in seconds.
        ttl_secs: u64,
    },
}

impl LaneCheck {
    /// Whether the lane is held.
    pub const fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

impl fmt::Display for LaneCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlocked { healed: None } => write!(f, "UNLOCKED"),
            Self::Unlocked {
                healed: Some(HealReason::Orphan),
            } => write!(f, "UNLOCKED (orphan lock removed)"),
            Self::Unlocked {
                healed: Some(HealReason::Stale),
            } => write!(f, "UNLOCKED (stale lock removed)"),
            Self::Locked { age_secs, ttl_secs } => write!(
                f,
                "LOCKED ({}min ago, ttl={}min)",
                (age_secs + 30) / 60,
                ttl_secs / 60
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Lock file contents and modification time, read from one handle.
type RawLock = (String, f64);

/// Held advisory lock on `apply-<lane>.guard`; released on drop.
struct LaneGuard {
    file: File,
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Reads, writes and heals lane locks.
#[derive(Debug, Clone)]
pub struct LaneLockManager<O> {
    locks_dir: PathBuf,
    lanes: LanesConfig,
    oracle: O,
}

impl<O: LivenessOracle> LaneLockManager<O> {
    /// Manager over `locks_dir` with the given TTLs and liveness source.
    pub const fn new(locks_dir: PathBuf, lanes: LanesConfig, oracle: O) -> Self {
        Self {
            locks_dir,
            lanes,
            oracle,
        }
    }

    /// Lock file path for `lane`.
    pub fn lock_path(&self, lane: &str) -> PathBuf {
        self.locks_dir.join(format!("apply-{lane}.lock"))
    }

    /// Advisory lock serializing writers of `lane`'s lock file.
    fn guard_path(&self, lane: &str) -> PathBuf {
        self.locks_dir.join(format!("apply-{lane}.guard"))
    }

    fn guard(&self, lane: &str) -> Result<LaneGuard, LaneLockError> {
        let path = self.guard_path(lane);
        let file = fsio::open_lock_file(&path)
            .map_err(|e| LaneLockError::io(format!("open {}", path.display()), e))?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| LaneLockError::io(format!("lock {}", path.display()), e))?;
        Ok(LaneGuard { file })
    }

    /// Lock file contents and modification time.
    fn read_raw(&self, lane: &str) -> Result<Option<RawLock>, LaneLockError> {
        let path = self.lock_path(lane);
        fsio::bounded_read_with_mtime(&path, MAX_LOCK_FILE_SIZE)
            .map_err(|e| LaneLockError::io(format!("read {}", path.display()), e))
    }

    fn parse_raw(&self, lane: &str, (content, mtime): &RawLock) -> LaneLock {
        LaneLock::parse(lane, content, *mtime, self.lanes.ttl_for(lane))
    }

    /// Current lock for `lane`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LaneLockError`] for an invalid lane name or unreadable lock.
    pub fn read(&self, lane: &str) -> Result<Option<LaneLock>, LaneLockError> {
        validate_lane_name(lane)?;
        Ok(self.read_raw(lane)?.map(|raw| self.parse_raw(lane, &raw)))
    }

    /// Check `lane` now. See [`Self::check_at`].
    ///
    /// # Errors
    ///
    /// See [`Self::check_at`].
    pub fn check(&self, lane: &str) -> Result<LaneCheck, LaneLockError> {
        self.check_at(lane, fsio::now_epoch_secs())
    }

    /// Check `lane` at `now`, healing orphaned or expired locks.
    ///
    /// # Errors
    ///
    /// Returns [`LaneLockError`] for an invalid lane name or a lock that
    /// cannot be read or removed.
    pub fn check_at(&self, lane: &str, now: f64) -> Result<LaneCheck, LaneLockError> {
        validate_lane_name(lane)?;
        let Some(assessed) = self.read_raw(lane)? else {
            return Ok(LaneCheck::Unlocked { healed: None });
        };
        let verdict = self.verdict(lane, &self.parse_raw(lane, &assessed), now);
        let LaneCheck::Unlocked {
            healed: Some(reason),
        } = verdict
        else {
            return Ok(verdict);
        };

        // Only the lock that was assessed may be removed: another checker can
        // heal it and a dispatcher re-acquire the lane while the oracle runs.
        let _guard = self.guard(lane)?;
        match self.read_raw(lane)? {
            Some(current) if current == assessed => {
                self.remove(lane)?;
                info!(lane, reason = %reason, "lane lock healed");
                Ok(verdict)
            },
            Some(current) => {
                debug!(lane, "lane lock replaced during check, keeping it");
                let lock = self.parse_raw(lane, &current);
                Ok(LaneCheck::Locked {
                    age_secs: lock.age_secs(now) as u64,
                    ttl_secs: lock.ttl_secs,
                })
            },
            None => Ok(LaneCheck::Unlocked { healed: None }),
        }
    }

    /// What [`Self::check_at`] would report for `lane` at `now`, without
    /// removing anything.
    ///
    /// # Errors
    ///
    /// Returns [`LaneLockError`] for an invalid lane name or unreadable lock.
    pub fn assess_at(&self, lane: &str, now: f64) -> Result<LaneCheck, LaneLockError> {
        Ok(match self.read(lane)? {
            Some(lock) => self.verdict(lane, &lock, now),
            None => LaneCheck::Unlocked { healed: None },
        })
    }

    fn verdict(&self, lane: &str, lock: &LaneLock, now: f64) -> LaneCheck {
        let age = lock.age_secs(now);

        if age > self.lanes.orphan_grace_secs as f64 {
            match self.oracle.has_live_worker(lane, now) {
                Ok(false) => {
                    debug!(lane, age_secs = age as u64, "no live worker for lane lock");
                    return LaneCheck::Unlocked {
                        healed: Some(HealReason::Orphan),
                    };
                },
                Ok(true) => debug!(lane, "lane lock corroborated by a live worker"),
                Err(e) => warn!(lane, error = %e, "liveness unknown, keeping lane lock"),
            }
        }

        if age > lock.ttl_secs as f64 {
            debug!(lane, age_secs = age as u64, ttl_secs = lock.ttl_secs, "lane lock past ttl");
            return LaneCheck::Unlocked {
                healed: Some(HealReason::Stale),
            };
        }

        LaneCheck::Locked {
            age_secs: age as u64,
            ttl_secs: lock.ttl_secs,
        }
    }

    /// Acquire `lane` now. See [`Self::acquire_at`].
    ///
    /// # Errors
    ///
    /// See [`Self::acquire_at`].
    pub fn acquire(&self, lane: &str) -> Result<LaneLock, LaneLockError> {
        self.acquire_at(lane, fsio::current_epoch_secs())
    }

    /// Write the lock for `lane` stamped `now`, replacing any existing lock.
    ///
    /// Callers check the lane first; acquisition itself does not wait.
    ///
    /// # Errors
    ///
    /// Returns [`LaneLockError`] for an invalid lane name or write failure.
    pub fn acquire_at(&self, lane: &str, now: u64) -> Result<LaneLock, LaneLockError> {
        validate_lane_name(lane)?;
        let path = self.lock_path(lane);
        let pid = std::process::id();
        let host = fsio::hostname();
        let content = format!("{now}\npid={pid}\nhost={host}\n");
        let _guard = self.guard(lane)?;
        fsio::atomic_write(&path, content.as_bytes())
            .map_err(|e| LaneLockError::io(format!("write {}", path.display()), e))?;
        info!(lane, pid, "lane lock acquired");
        Ok(LaneLock {
            lane: lane.to_string(),
            acquired_at: now as f64,
            owner_pid: Some(pid),
            owner_host: Some(host),
            ttl_secs: self.lanes.ttl_for(lane),
        })
    }

    /// Remove the lock for `lane`. Returns whether a lock existed.
    ///
    /// # Errors
    ///
    /// Returns [`LaneLockError`] for an invalid lane name or removal failure.
    pub fn release(&self, lane: &str) -> Result<bool, LaneLockError> {
        validate_lane_name(lane)?;
        let _guard = self.guard(lane)?;
        let removed = self.remove(lane)?;
        if removed {
            info!(lane, "lane lock released");
        }
        Ok(removed)
    }

    fn remove(&self, lane: &str) -> Result<bool, LaneLockError> {
        let path = self.lock_path(lane);
        fsio::remove_if_exists(&path)
            .map_err(|e| LaneLockError::io(format!("remove {}", path.display()), e))
    }

    /// Configured lane TTLs.
    pub const fn lanes(&self) -> &LanesConfig {
        &self.lanes
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
