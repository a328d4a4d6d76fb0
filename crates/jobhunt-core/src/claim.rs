//! Resource-level mutual exclusion: one short-term claim per job posting.
//!
//! Lane locks keep two workers out of the same ATS integration; claims keep
//! two workers (possibly in different lanes) off the same posting. A claim is
//! a pure TTL lease with no liveness cross-check, so the TTL must exceed the
//! longest worker session.
//!
//! Claims live in `.locks/claims/<key>.claim` where `key` is the first 16 hex
//! characters of the BLAKE3 hash of the normalized URL. Every read-modify-write
//! of the directory happens under an exclusive flock on `.locks/claims.lock`.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::backlog::url::normalize_url;
use crate::fsio;

const CLAIM_EXTENSION: &str = "claim";
const MAX_CLAIM_FILE_SIZE: u64 = 64 * 1024;

/// Errors raised by claim operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClaimError {
    /// Filesystem failure.
    #[error("claim I/O error: {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The URL is empty.
    #[error("claim url is empty")]
    EmptyUrl,
}

impl ClaimError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Stable 16-hex-character key for a posting URL.
///
/// URLs that differ only by trailing slashes or an `/application` suffix
/// share a key.
pub fn resource_key(url: &str) -> String {
    let digest = blake3::hash(normalize_url(url).as_bytes());
    hex::encode(&digest.as_bytes()[..8])
}

/// Claim file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    /// Claimed URL as given.
    pub url: String,
    /// PID of the claiming process.
    pub pid: u32,
    /// Claim time (epoch seconds).
    pub claimed_at: f64,
}

/// Result of [`ClaimRegistry::claim`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimOutcome {
    /// The caller now holds the claim.
    Claimed {
        /// Resource key.
        key: String,
    },
    /// Someone else holds a live claim.
    ClaimedByOther {
        /// Resource key.
        key: String,
        /// Age of the existing claim in seconds.
        age_secs: u64,
        /// Holder PID, if recorded.
        pid: Option<u32>,
    },
}

impl ClaimOutcome {
    /// CLI token for the outcome.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed { .. } => "CLAIMED",
            Self::ClaimedByOther { .. } => "CLAIMED_BY_OTHER",
        }
    }
}

/// Result of [`ClaimRegistry::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseOutcome {
    /// A claim was removed.
    Released,
    /// No claim existed.
    NotFound,
}

impl ReleaseOutcome {
    /// CLI token for the outcome.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Released => "RELEASED",
            Self::NotFound => "NOT_FOUND",
        }
    }
}

/// One entry of [`ClaimRegistry::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimInfo {
    /// Resource key.
    pub key: String,
    /// Claimed URL.
    pub url: String,
    /// Holder PID.
    pub pid: u32,
    /// Age in seconds.
    pub age_secs: u64,
    /// Whether the claim is past its TTL.
    pub expired: bool,
}

struct ClaimsLock {
    file: File,
}

impl Drop for ClaimsLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Directory of per-resource claims.
#[derive(Debug, Clone)]
pub struct ClaimRegistry {
    claims_dir: PathBuf,
    lock_path: PathBuf,
    ttl_secs: u64,
}

impl ClaimRegistry {
    /// Registry over `claims_dir`, serialized by `lock_path`.
    pub const fn new(claims_dir: PathBuf, lock_path: PathBuf, ttl_secs: u64) -> Self {
        Self {
            claims_dir,
            lock_path,
            ttl_secs,
        }
    }

    /// Claim TTL in seconds.
    pub const fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Whether a claim `age_secs` old has lapsed. A claim exactly TTL old is
    /// expired.
    pub const fn is_expired(&self, age_secs: u64) -> bool {
        age_secs >= self.ttl_secs
    }

    fn claim_path(&self, key: &str) -> PathBuf {
        self.claims_dir.join(format!("{key}.{CLAIM_EXTENSION}"))
    }

    fn lock(&self) -> Result<ClaimsLock, ClaimError> {
        let file = fsio::open_lock_file(&self.lock_path)
            .map_err(|e| ClaimError::io(format!("open {}", self.lock_path.display()), e))?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| ClaimError::io(format!("lock {}", self.lock_path.display()), e))?;
        Ok(ClaimsLock { file })
    }

    fn read_record(path: &Path) -> Result<Option<ClaimRecord>, ClaimError> {
        let Some(content) = fsio::bounded_read_to_string(path, MAX_CLAIM_FILE_SIZE)
            .map_err(|e| ClaimError::io(format!("read {}", path.display()), e))?
        else {
            return Ok(None);
        };
        match serde_json::from_str::<ClaimRecord>(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // Unparseable claims still block until their mtime ages out.
                warn!(path = %path.display(), error = %e, "malformed claim file");
                let claimed_at = fsio::mtime_epoch_secs(path).unwrap_or(0.0);
                Ok(Some(ClaimRecord {
                    url: String::new(),
                    pid: 0,
                    claimed_at,
                }))
            },
        }
    }

    fn age(record: &ClaimRecord, now: f64) -> u64 {
        (now - record.claimed_at).max(0.0) as u64
    }

    /// Claim `url` now. See [`Self::claim_at`].
    ///
    /// # Errors
    ///
    /// See [`Self::claim_at`].
    pub fn claim(&self, url: &str) -> Result<ClaimOutcome, ClaimError> {
        self.claim_at(url, fsio::now_epoch_secs())
    }

    /// Claim `url` at `now`, taking over a claim older than the TTL.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::EmptyUrl`] for a blank URL and
    /// [`ClaimError::Io`] on filesystem failure.
    pub fn claim_at(&self, url: &str, now: f64) -> Result<ClaimOutcome, ClaimError> {
        if url.trim().is_empty() {
            return Err(ClaimError::EmptyUrl);
        }
        let key = resource_key(url);
        let path = self.claim_path(&key);
        let _guard = self.lock()?;

        if let Some(existing) = Self::read_record(&path)? {
            let age_secs = Self::age(&existing, now);
            if !self.is_expired(age_secs) {
                return Ok(ClaimOutcome::ClaimedByOther {
                    key,
                    age_secs,
                    pid: (existing.pid != 0).then_some(existing.pid),
                });
            }
            info!(key = %key, age_secs, "expired claim taken over");
        }

        let record = ClaimRecord {
            url: url.trim().to_string(),
            pid: std::process::id(),
            claimed_at: now,
        };
        let body = serde_json::to_vec(&record)
            .map_err(|e| ClaimError::io("serialize claim", io::Error::other(e)))?;
        fsio::atomic_write(&path, &body)
            .map_err(|e| ClaimError::io(format!("write {}", path.display()), e))?;
        Ok(ClaimOutcome::Claimed { key })
    }

    /// Release the claim on `url`, whoever holds it.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::Io`] on filesystem failure.
    pub fn release(&self, url: &str) -> Result<ReleaseOutcome, ClaimError> {
        let path = self.claim_path(&resource_key(url));
        let _guard = self.lock()?;
        let removed = fsio::remove_if_exists(&path)
            .map_err(|e| ClaimError::io(format!("remove {}", path.display()), e))?;
        Ok(if removed {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::NotFound
        })
    }

    /// Whether `url` has a live (unexpired) claim at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::Io`] if the claim cannot be read.
    pub fn is_claimed_at(&self, url: &str, now: f64) -> Result<bool, ClaimError> {
        let path = self.claim_path(&resource_key(url));
        Ok(Self::read_record(&path)?.is_some_and(|r| !self.is_expired(Self::age(&r, now))))
    }

    fn claim_files(&self) -> Result<Vec<(String, PathBuf)>, ClaimError> {
        let entries = match fs::read_dir(&self.claims_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ClaimError::io(
                    format!("list {}", self.claims_dir.display()),
                    e,
                ));
            },
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| ClaimError::io(format!("list {}", self.claims_dir.display()), e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CLAIM_EXTENSION) {
                continue;
            }
            if let Some(key) = path.file_stem().and_then(|s| s.to_str()) {
                files.push((key.to_string(), path.clone()));
            }
        }
        files.sort();
        Ok(files)
    }

    /// Every claim with its age at `now`. Expired claims are flagged, not
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::Io`] if the directory cannot be listed.
    pub fn list_at(&self, now: f64) -> Result<Vec<ClaimInfo>, ClaimError> {
        let mut out = Vec::new();
        for (key, path) in self.claim_files()? {
            let Some(record) = Self::read_record(&path)? else {
                continue;
            };
            let age_secs = Self::age(&record, now);
            out.push(ClaimInfo {
                key,
                url: record.url,
                pid: record.pid,
                age_secs,
                expired: self.is_expired(age_secs),
            });
        }
        Ok(out)
    }

    /// [`Self::list_at`] at the current time.
    ///
    /// # Errors
    ///
    /// See [`Self::list_at`].
    pub fn list(&self) -> Result<Vec<ClaimInfo>, ClaimError> {
        self.list_at(fsio::now_epoch_secs())
    }

    /// Expired claims at `now`, without removing them.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::Io`] if the directory cannot be listed.
    pub fn expired_at(&self, now: f64) -> Result<Vec<ClaimInfo>, ClaimError> {
        Ok(self
            .list_at(now)?
            .into_iter()
            .filter(|c| c.expired)
            .collect())
    }

    /// Remove every claim past its TTL at `now`. Returns what was removed.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::Io`] on filesystem failure.
    pub fn sweep_expired_at(&self, now: f64) -> Result<Vec<ClaimInfo>, ClaimError> {
        let _guard = self.lock()?;
        let expired = self.expired_at(now)?;
        for claim in &expired {
            let path = self.claim_path(&claim.key);
            fsio::remove_if_exists(&path)
                .map_err(|e| ClaimError::io(format!("remove {}", path.display()), e))?;
            info!(key = %claim.key, age_secs = claim.age_secs, "expired claim swept");
        }
        Ok(expired)
    }
}
