//! Per-lane readiness snapshot for an external scheduler.
//!
//! One pass reads the backlog, checks (and heals) every configured lane lock
//! and filters out postings that already carry a live claim, then reports for
//! each lane whether a worker can be dispatched and which entry it would take.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::backlog::{BacklogError, BacklogStore, EntryStatus, JobEntry};
use crate::claim::{ClaimError, ClaimRegistry};
use crate::config::DispatchConfig;
use crate::lane_lock::{LaneCheck, LaneLockError, LaneLockManager, LivenessOracle};

/// Errors building a snapshot.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The backlog could not be read.
    #[error(transparent)]
    Backlog(#[from] BacklogError),

    /// A lane lock could not be checked.
    #[error(transparent)]
    LaneLock(#[from] LaneLockError),

    /// Claims could not be read.
    #[error(transparent)]
    Claim(#[from] ClaimError),
}

/// Backlog pressure, from the pending count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureTier {
    /// At most 100 pending.
    Normal,
    /// At most 250 pending.
    High,
    /// More than 250 pending.
    Critical,
}

impl PressureTier {
    /// Tier for `pending` entries.
    pub const fn from_pending(pending: usize) -> Self {
        if pending <= 100 {
            Self::Normal
        } else if pending <= 250 {
            Self::High
        } else {
            Self::Critical
        }
    }

    /// Applications a worker in `lane` should attempt per session.
    pub fn apply_cap(self, lane: &str) -> u32 {
        let ashby_like = lane.starts_with("ashby");
        match self {
            Self::Normal => 3,
            Self::High => {
                if ashby_like {
                    4
                } else {
                    3
                }
            },
            Self::Critical => {
                if ashby_like {
                    5
                } else if lane == "lever" {
                    4
                } else {
                    3
                }
            },
        }
    }

    /// Lower-case name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Why a lane can or cannot be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    /// Free and has work.
    Ready,
    /// Held by a worker.
    SkippedLocked,
    /// Free but nothing actionable.
    SkippedEmpty,
    /// Turned off by policy.
    Disabled,
}

impl SlotStatus {
    /// Upper-case token.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::SkippedLocked => "SKIPPED_LOCKED",
            Self::SkippedEmpty => "SKIPPED_EMPTY",
            Self::Disabled => "DISABLED",
        }
    }
}

/// Highest-priority actionable entry of a lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopEntry {
    /// Posting URL.
    pub url: String,
    /// Company.
    pub company: String,
    /// Role title.
    pub title: String,
    /// Priority score.
    pub score: i64,
}

impl From<&JobEntry> for TopEntry {
    fn from(entry: &JobEntry) -> Self {
        Self {
            url: entry.url.clone(),
            company: entry.company.clone(),
            title: entry.title.clone(),
            score: entry.priority_score,
        }
    }
}

/// Readiness of one lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneSlot {
    /// Lane name.
    pub lane: String,
    /// Dispatch decision.
    pub status: SlotStatus,
    /// Lock check result as printed by `lock check`.
    pub lock: String,
    /// Lock age when held.
    pub lock_age_secs: Option<u64>,
    /// Actionable entries for the lane.
    pub actionable_count: usize,
    /// Entry a worker would take first.
    pub top: Option<TopEntry>,
    /// Per-session application cap at the current pressure.
    pub apply_cap: u32,
}

/// Readiness of every configured lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSnapshot {
    /// Snapshot time (RFC 3339).
    pub timestamp_iso: String,
    /// Pending entries.
    pub pending: usize,
    /// In-progress entries.
    pub in_progress: usize,
    /// Pending, auto-appliable and unclaimed entries across all lanes.
    pub actionable_total: usize,
    /// Backlog pressure.
    pub tier: PressureTier,
    /// One slot per configured lane, in configuration order.
    pub slots: Vec<LaneSlot>,
    /// Lanes that are ready.
    pub ready: Vec<String>,
}

impl fmt::Display for DispatchSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "DISPATCH: pending={} actionable={} tier={}",
            self.pending,
            self.actionable_total,
            self.tier.as_str()
        )?;
        for slot in &self.slots {
            let top = slot
                .top
                .as_ref()
                .map_or_else(|| "-".to_string(), |t| format!("{} — {}", t.company, t.title));
            writeln!(
                f,
                "{}: {} | lock={} | actionable={} | top={}",
                slot.lane,
                slot.status.as_str(),
                slot.lock,
                slot.actionable_count,
                top
            )?;
        }
        if self.ready.is_empty() {
            write!(f, "READY: none")
        } else {
            write!(f, "READY: {}", self.ready.join(", "))
        }
    }
}

/// Build a snapshot at `now`. Lane checks heal stale locks as a side effect.
///
/// # Errors
///
/// Returns [`DispatchError`] if the backlog, a lock or a claim cannot be read.
pub fn dispatch_snapshot<O: LivenessOracle>(
    store: &BacklogStore,
    locks: &LaneLockManager<O>,
    claims: &ClaimRegistry,
    config: &DispatchConfig,
    now: f64,
) -> Result<DispatchSnapshot, DispatchError> {
    let snapshot = store.read()?;
    let mut actionable: Vec<&JobEntry> = Vec::new();
    for entry in snapshot.document.entries() {
        if entry.status != EntryStatus::Pending || !entry.auto_apply_allowed {
            continue;
        }
        if claims.is_claimed_at(&entry.url, now)? {
            debug!(url = %entry.url, "entry claimed, not actionable");
            continue;
        }
        actionable.push(entry);
    }
    // Stable sort keeps document order among equal scores.
    actionable.sort_by(|a, b| b.priority_score.cmp(&a.priority_score));

    let tier = PressureTier::from_pending(snapshot.counts.pending);
    let mut slots = Vec::with_capacity(config.lanes.len());
    for lane in &config.lanes {
        let lane_entries: Vec<&JobEntry> = actionable
            .iter()
            .copied()
            .filter(|e| e.lane_hint.served_by(lane))
            .collect();
        let apply_cap = tier.apply_cap(lane);

        if config.disabled_lanes.iter().any(|d| d == lane) {
            slots.push(LaneSlot {
                lane: lane.clone(),
                status: SlotStatus::Disabled,
                lock: "DISABLED".to_string(),
                lock_age_secs: None,
                actionable_count: lane_entries.len(),
                top: None,
                apply_cap,
            });
            continue;
        }

        let check = locks.check_at(lane, now)?;
        let (status, lock_age_secs) = match check {
            LaneCheck::Locked { age_secs, .. } => (SlotStatus::SkippedLocked, Some(age_secs)),
            LaneCheck::Unlocked { .. } if lane_entries.is_empty() => (SlotStatus::SkippedEmpty, None),
            LaneCheck::Unlocked { .. } => (SlotStatus::Ready, None),
        };
        slots.push(LaneSlot {
            lane: lane.clone(),
            status,
            lock: check.to_string(),
            lock_age_secs,
            actionable_count: lane_entries.len(),
            top: lane_entries.first().map(|e| TopEntry::from(*e)),
            apply_cap,
        });
    }

    let ready = slots
        .iter()
        .filter(|s| s.status == SlotStatus::Ready)
        .map(|s| s.lane.clone())
        .collect();
    let timestamp_iso = crate::fsio::epoch_to_rfc3339(now);
    Ok(DispatchSnapshot {
        timestamp_iso,
        pending: snapshot.counts.pending,
        in_progress: snapshot.counts.in_progress,
        actionable_total: actionable.len(),
        tier,
        slots,
        ready,
    })
}
