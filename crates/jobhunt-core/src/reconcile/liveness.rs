//! Worker liveness inferred from run age and session heartbeat.
//!
//! Two independent checks decide whether a run is abandoned:
//!
//! - the run is older than the absolute stale ceiling, or
//! - the run is past its startup grace period and its heartbeat (or lack of
//!   one) is older than the heartbeat timeout.
//!
//! The reconciler and the lane lock oracle use the same checks with different
//! thresholds.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::registry::{RegistryError, RunRecord, RunRegistry, SessionStore};
use crate::config::{LanesConfig, ReconcileConfig};
use crate::fsio;
use crate::lane_lock::LivenessOracle;

/// Threshold set for one liveness policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessThresholds {
    /// Startup grace period.
    pub grace_secs: f64,
    /// Heartbeat age that counts as a stall.
    pub heartbeat_timeout_secs: f64,
    /// Absolute run age ceiling.
    pub stale_secs: f64,
}

impl LivenessThresholds {
    /// Thresholds the reconciler applies to runs.
    pub fn for_reconcile(config: &ReconcileConfig) -> Self {
        Self {
            grace_secs: config.grace_secs as f64,
            heartbeat_timeout_secs: config.heartbeat_timeout_secs as f64,
            stale_secs: config.stale_secs as f64,
        }
    }

    /// Thresholds used to corroborate lane locks. The ceiling is the longest
    /// lane TTL, so a run never outlives every lock it could hold.
    pub fn for_lanes(config: &LanesConfig) -> Self {
        Self {
            grace_secs: config.orphan_grace_secs as f64,
            heartbeat_timeout_secs: config.heartbeat_timeout_secs as f64,
            stale_secs: config.max_ttl() as f64,
        }
    }
}

/// Why a run is considered abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Abandonment {
    /// Run age exceeded the stale ceiling.
    StaleTtl,
    /// Past grace with no heartbeat at all.
    MissingHeartbeat,
    /// Past grace with a heartbeat older than the timeout.
    HeartbeatTimeout {
        /// Heartbeat age in whole seconds.
        heartbeat_age_secs: u64,
    },
}

impl fmt::Display for Abandonment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleTtl => f.write_str("orphan-run-stale-ttl"),
            Self::MissingHeartbeat => f.write_str("orphan-missing-session-heartbeat"),
            Self::HeartbeatTimeout { heartbeat_age_secs } => {
                write!(f, "orphan-heartbeat-timeout-{heartbeat_age_secs}s")
            },
        }
    }
}

/// Whether `run_age` exceeds the absolute ceiling.
pub fn exceeds_stale_ceiling(run_age: f64, stale_secs: f64) -> bool {
    run_age > stale_secs
}

/// Whether the heartbeat has expired. A missing heartbeat expires as soon as
/// the grace period is over.
pub fn heartbeat_expired(
    run_age: f64,
    heartbeat_age: Option<f64>,
    grace_secs: f64,
    timeout_secs: f64,
) -> bool {
    run_age > grace_secs && heartbeat_age.is_none_or(|age| age > timeout_secs)
}

/// Combine both checks. `None` means the run is live.
pub fn abandonment(
    run_age: f64,
    heartbeat_age: Option<f64>,
    thresholds: &LivenessThresholds,
) -> Option<Abandonment> {
    if exceeds_stale_ceiling(run_age, thresholds.stale_secs) {
        return Some(Abandonment::StaleTtl);
    }
    if !heartbeat_expired(
        run_age,
        heartbeat_age,
        thresholds.grace_secs,
        thresholds.heartbeat_timeout_secs,
    ) {
        return None;
    }
    Some(heartbeat_age.map_or(Abandonment::MissingHeartbeat, |age| {
        Abandonment::HeartbeatTimeout {
            heartbeat_age_secs: age as u64,
        }
    }))
}

/// Last observed activity of `run`: the later of the session store's
/// `updatedAt` and the transcript mtime, capped at `now`.
pub fn last_heartbeat(
    run: &RunRecord,
    sessions: &SessionStore,
    session_dir: &Path,
    now: f64,
) -> Option<f64> {
    let entry = sessions.get(run.child_session_key.as_deref()?)?;
    let mut latest = entry.updated_at_ms.map(|ms| ms / 1000.0);
    if let Some(session_id) = &entry.session_id {
        let transcript = session_dir.join(format!("{session_id}.jsonl"));
        if let Ok(mtime) = fsio::mtime_epoch_secs(&transcript) {
            latest = Some(latest.map_or(mtime, |t| t.max(mtime)));
        }
    }
    latest.map(|t| t.min(now))
}

/// Evaluate one run. Returns `None` for a live run.
pub fn assess_run(
    run: &RunRecord,
    sessions: &SessionStore,
    session_dir: &Path,
    thresholds: &LivenessThresholds,
    now: f64,
) -> Option<Abandonment> {
    let run_age = run.age_secs(now);
    let heartbeat_age =
        last_heartbeat(run, sessions, session_dir, now).map(|hb| (now - hb).max(0.0));
    abandonment(run_age, heartbeat_age, thresholds)
}

/// Whether `run` counts toward `lane`. An apply run that names none of
/// `known_lanes` counts toward every lane.
pub fn attributed_to_lane(run: &RunRecord, lane: &str, known_lanes: &[String]) -> bool {
    if !run.is_running() || !run.is_apply_run() {
        return false;
    }
    run.mentions_lane(lane) || !known_lanes.iter().any(|known| run.mentions_lane(known))
}

/// Whether any live apply run is attributed to `lane`.
pub fn lane_has_live_worker(
    registry: &RunRegistry,
    sessions: &SessionStore,
    session_dir: &Path,
    lane: &str,
    known_lanes: &[String],
    thresholds: &LivenessThresholds,
    now: f64,
) -> bool {
    registry.runs().iter().any(|run| {
        attributed_to_lane(run, lane, known_lanes)
            && assess_run(run, sessions, session_dir, thresholds, now).is_none()
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Oracles
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness oracle that reads the run registry and session store from disk on
/// every query.
#[derive(Debug, Clone)]
pub struct RegistryLivenessOracle {
    runs_registry: PathBuf,
    session_store: PathBuf,
    session_dir: PathBuf,
    known_lanes: Vec<String>,
    thresholds: LivenessThresholds,
}

impl RegistryLivenessOracle {
    /// Oracle over the given collaborator files.
    pub const fn new(
        runs_registry: PathBuf,
        session_store: PathBuf,
        session_dir: PathBuf,
        known_lanes: Vec<String>,
        thresholds: LivenessThresholds,
    ) -> Self {
        Self {
            runs_registry,
            session_store,
            session_dir,
            known_lanes,
            thresholds,
        }
    }
}

impl LivenessOracle for RegistryLivenessOracle {
    fn has_live_worker(&self, lane: &str, now: f64) -> Result<bool, RegistryError> {
        let registry = RunRegistry::load(&self.runs_registry)?;
        let sessions = SessionStore::load(&self.session_store);
        let live = lane_has_live_worker(
            &registry,
            &sessions,
            &self.session_dir,
            lane,
            &self.known_lanes,
            &self.thresholds,
            now,
        );
        debug!(lane, live, "lane liveness from run registry");
        Ok(live)
    }
}

/// Liveness oracle over an in-memory registry, used by the reconciler so lane
/// checks see runs it has just ended (including in dry runs).
#[derive(Debug, Clone, Copy)]
pub struct SnapshotLivenessOracle<'a> {
    registry: &'a RunRegistry,
    sessions: &'a SessionStore,
    session_dir: &'a Path,
    known_lanes: &'a [String],
    thresholds: LivenessThresholds,
}

impl<'a> SnapshotLivenessOracle<'a> {
    /// Oracle over borrowed state.
    pub const fn new(
        registry: &'a RunRegistry,
        sessions: &'a SessionStore,
        session_dir: &'a Path,
        known_lanes: &'a [String],
        thresholds: LivenessThresholds,
    ) -> Self {
        Self {
            registry,
            sessions,
            session_dir,
            known_lanes,
            thresholds,
        }
    }
}

impl LivenessOracle for SnapshotLivenessOracle<'_> {
    fn has_live_worker(&self, lane: &str, now: f64) -> Result<bool, RegistryError> {
        Ok(lane_has_live_worker(
            self.registry,
            self.sessions,
            self.session_dir,
            lane,
            self.known_lanes,
            &self.thresholds,
            now,
        ))
    }
}
