//! Orphan reconciliation.
//!
//! Workers die without reporting back. One reconciliation pass:
//!
//! 1. ends runs whose age or heartbeat shows they are abandoned,
//! 2. scans transcripts for successes, failures and guard violations, ending
//!    the run of any session that broke a terminating rule,
//! 3. assesses every known lane for locks no longer corroborated by a live
//!    run, and lists expired claims,
//! 4. writes the run registry once, if anything changed,
//! 5. heals the assessed locks and sweeps the expired claims,
//! 6. persists watch state, the guardrail log and a receipt.
//!
//! A pass only removes locks and claims; it never creates or extends one.
//! Passes are serialized by a non-blocking flock on `state/reconcile.lock`.

pub mod guard;
pub mod liveness;
pub mod registry;
pub mod transcript;

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use self::guard::{Guard, GuardViolation};
use self::liveness::{
    LivenessThresholds, RegistryLivenessOracle, SnapshotLivenessOracle, assess_run,
};
use self::registry::{RegistryError, RunRegistry, SessionStore};
use self::transcript::{ScanReport, TranscriptScanner, WatchState};
use crate::claim::{ClaimError, ClaimInfo, ClaimRegistry};
use crate::config::JobhuntConfig;
use crate::fsio;
use crate::lane_lock::{
    HealReason, LaneCheck, LaneLockError, LaneLockManager, LivenessOracle, validate_lane_name,
};
use crate::layout::WorkspaceLayout;

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that abort a reconciliation pass.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// Another pass holds the instance lock.
    #[error("reconcile already running (instance lock held)")]
    Busy,

    /// The run registry could not be read or written.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A lane lock could not be checked or removed.
    #[error(transparent)]
    LaneLock(#[from] LaneLockError),

    /// Claims could not be swept.
    #[error(transparent)]
    Claim(#[from] ClaimError),

    /// Filesystem failure.
    #[error("reconcile I/O error: {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl ReconcileError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Receipt
// ─────────────────────────────────────────────────────────────────────────────

/// A run the pass marked ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndedRun {
    /// Registry key.
    pub run_id: String,
    /// Supervisor label.
    pub label: String,
    /// Outcome error written to the registry.
    pub reason: String,
}

/// A lane lock the pass removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealedLock {
    /// Lane name.
    pub lane: String,
    /// Why it was removed.
    pub reason: HealReason,
}

/// Everything one pass did (or, for a dry run, would do).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReceipt {
    /// Pass time (RFC 3339).
    pub started_at: String,
    /// Whether writes were suppressed.
    pub dry_run: bool,
    /// Runs marked ended.
    pub runs_ended: Vec<EndedRun>,
    /// Lane locks removed.
    pub locks_healed: Vec<HealedLock>,
    /// Expired claims removed.
    pub claims_swept: Vec<ClaimInfo>,
    /// Transcript observations.
    pub scan: ScanReport,
    /// Streak after the pass.
    pub streak: u64,
    /// Success total after the pass.
    pub success_total: u64,
}

impl ReconcileReceipt {
    /// Whether the pass changed (or would change) any state.
    pub fn changed(&self) -> bool {
        !self.runs_ended.is_empty()
            || !self.locks_healed.is_empty()
            || !self.claims_swept.is_empty()
            || !self.scan.violations.is_empty()
            || !self.scan.successes.is_empty()
            || self.scan.failures > 0
    }

    /// One-line summary for the CLI.
    pub fn summary(&self) -> String {
        format!(
            "RECONCILE{}: ended={} healed={} swept={} violations={} streak={} total={}",
            if self.dry_run { " (dry run)" } else { "" },
            self.runs_ended.len(),
            self.locks_healed.len(),
            self.claims_swept.len(),
            self.scan.violations.len(),
            self.streak,
            self.success_total,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconciler
// ─────────────────────────────────────────────────────────────────────────────

/// Runs reconciliation passes over one workspace.
#[derive(Debug, Clone)]
pub struct Reconciler {
    layout: WorkspaceLayout,
    config: JobhuntConfig,
}

impl Reconciler {
    /// Reconciler for the workspace named in `config`.
    pub fn new(config: JobhuntConfig) -> Self {
        Self {
            layout: WorkspaceLayout::new(config.paths.workspace.clone()),
            config,
        }
    }

    /// Workspace layout.
    pub const fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    /// Run one pass now. See [`Self::run_once`].
    ///
    /// # Errors
    ///
    /// See [`Self::run_once`].
    pub fn run(&self, dry_run: bool) -> Result<ReconcileReceipt, ReconcileError> {
        self.run_once(fsio::now_epoch_secs(), dry_run)
    }

    /// Run one pass at `now`. With `dry_run`, every action is computed and
    /// reported but nothing is written.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Busy`] if another pass is running and an
    /// error if the run registry is unreadable (before anything is written)
    /// or a write fails.
    pub fn run_once(&self, now: f64, dry_run: bool) -> Result<ReconcileReceipt, ReconcileError> {
        let _instance = if dry_run {
            None
        } else {
            Some(self.instance_lock()?)
        };
        let now_ms = (now * 1000.0) as u64;
        let paths = &self.config.paths;

        let mut registry = match RunRegistry::load(&paths.runs_registry) {
            Ok(registry) => Some(registry),
            Err(RegistryError::Missing { path }) => {
                debug!(path = %path.display(), "no run registry, nothing to end");
                None
            },
            Err(e) => return Err(e.into()),
        };
        let sessions = SessionStore::load(&paths.session_store);

        let mut runs_ended = Vec::new();
        if let Some(registry) = registry.as_mut() {
            runs_ended.extend(self.end_abandoned_runs(registry, &sessions, now, now_ms));
        }

        let state_path = self.layout.watch_state();
        let mut state = WatchState::load(&state_path, now as u64);
        let scanner = TranscriptScanner::new(
            paths.session_dir.clone(),
            self.config.reconcile.transcript_window_secs,
            self.config.reconcile.max_tracked_transcripts,
            Guard::new(&paths.workspace, &self.config.guard),
        );
        let scan = scanner.scan(&mut state, now);
        if let Some(registry) = registry.as_mut() {
            runs_ended.extend(terminate_violating_runs(
                registry,
                &sessions,
                &scan.violations,
                now_ms,
            ));
        }

        // Everything below is planned before the first write, so a failed
        // read leaves no side effects.
        let lanes = self.known_lanes()?;
        let thresholds = LivenessThresholds::for_lanes(&self.config.lanes);
        let oracle = match registry.as_ref() {
            Some(registry) => PassOracle::Snapshot(SnapshotLivenessOracle::new(
                registry,
                &sessions,
                &paths.session_dir,
                &lanes,
                thresholds,
            )),
            // No registry: the disk oracle fails closed, leaving only TTL heals.
            None => PassOracle::Disk(RegistryLivenessOracle::new(
                paths.runs_registry.clone(),
                paths.session_store.clone(),
                paths.session_dir.clone(),
                lanes.clone(),
                thresholds,
            )),
        };
        let locks = LaneLockManager::new(
            self.layout.locks_dir.clone(),
            self.config.lanes.clone(),
            oracle,
        );
        let planned_heals = plan_heals(&locks, &lanes, now)?;
        let claims = ClaimRegistry::new(
            self.layout.claims_dir.clone(),
            self.layout.claims_lock.clone(),
            self.config.claims.ttl_secs,
        );
        let expired_claims = claims.expired_at(now)?;

        let (locks_healed, claims_swept) = if dry_run {
            (planned_heals, expired_claims)
        } else {
            if let Some(registry) = registry.as_ref().filter(|r| r.is_dirty()) {
                registry.save()?;
            }
            let healed = apply_heals(&locks, planned_heals, now)?;
            let swept = if expired_claims.is_empty() {
                Vec::new()
            } else {
                claims.sweep_expired_at(now)?
            };
            (healed, swept)
        };

        let receipt = ReconcileReceipt {
            started_at: fsio::epoch_to_rfc3339(now),
            dry_run,
            runs_ended,
            locks_healed,
            claims_swept,
            streak: state.streak,
            success_total: state.success_total,
            scan,
        };

        if !dry_run {
            self.append_violations(&receipt.scan.violations)?;
            state
                .save(&state_path)
                .map_err(|e| ReconcileError::io(format!("write {}", state_path.display()), e))?;
            if receipt.changed() {
                self.write_receipt(&receipt, now_ms)?;
            }
        }

        if receipt.changed() {
            info!(
                dry_run,
                ended = receipt.runs_ended.len(),
                healed = receipt.locks_healed.len(),
                swept = receipt.claims_swept.len(),
                violations = receipt.scan.violations.len(),
                streak = receipt.streak,
                "reconcile pass changed state"
            );
        } else {
            debug!(dry_run, "reconcile pass found nothing to do");
        }
        Ok(receipt)
    }

    fn instance_lock(&self) -> Result<File, ReconcileError> {
        let path = self.layout.reconcile_lock();
        let file = fsio::open_lock_file(&path)
            .map_err(|e| ReconcileError::io(format!("open {}", path.display()), e))?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(ReconcileError::Busy),
            Err(e) => Err(ReconcileError::io(format!("lock {}", path.display()), e)),
        }
    }

    fn end_abandoned_runs(
        &self,
        registry: &mut RunRegistry,
        sessions: &SessionStore,
        now: f64,
        now_ms: u64,
    ) -> Vec<EndedRun> {
        let thresholds = LivenessThresholds::for_reconcile(&self.config.reconcile);
        let mut ended = Vec::new();
        for run in registry.runs() {
            if !run.is_running() || !run.is_apply_run() {
                continue;
            }
            let Some(verdict) = assess_run(
                &run,
                sessions,
                &self.config.paths.session_dir,
                &thresholds,
                now,
            ) else {
                continue;
            };
            let reason = verdict.to_string();
            if registry.mark_ended(&run.id, &reason, now_ms) {
                info!(run_id = %run.id, label = %run.label, reason = %reason, "abandoned run ended");
                ended.push(EndedRun {
                    run_id: run.id,
                    label: run.label,
                    reason,
                });
            }
        }
        ended
    }

    /// Lanes from configuration plus any lane that currently has a lock
    /// file.
    fn known_lanes(&self) -> Result<Vec<String>, ReconcileError> {
        let mut lanes: BTreeSet<String> = self
            .config
            .dispatch
            .lanes
            .iter()
            .chain(self.config.lanes.ttl_secs.keys())
            .cloned()
            .collect();
        match fs::read_dir(&self.layout.locks_dir) {
            Ok(entries) => {
                for entry in entries.filter_map(Result::ok) {
                    let name = entry.file_name();
                    let Some(lane) = name
                        .to_str()
                        .and_then(|n| n.strip_prefix("apply-"))
                        .and_then(|n| n.strip_suffix(".lock"))
                    else {
                        continue;
                    };
                    if validate_lane_name(lane).is_ok() {
                        lanes.insert(lane.to_string());
                    }
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => {
                return Err(ReconcileError::io(
                    format!("list {}", self.layout.locks_dir.display()),
                    e,
                ));
            },
        }
        Ok(lanes.into_iter().collect())
    }

    fn append_violations(&self, violations: &[GuardViolation]) -> Result<(), ReconcileError> {
        if violations.is_empty() {
            return Ok(());
        }
        let path = self.layout.guardrails_log();
        let mut body = String::new();
        for violation in violations {
            let line = serde_json::to_string(violation)
                .map_err(|e| ReconcileError::io("serialize violation", io::Error::other(e)))?;
            body.push_str(&line);
            body.push('\n');
        }
        fsio::append(&path, body.as_bytes())
            .map_err(|e| ReconcileError::io(format!("append {}", path.display()), e))
    }

    fn write_receipt(&self, receipt: &ReconcileReceipt, now_ms: u64) -> Result<(), ReconcileError> {
        let path = self
            .layout
            .receipts_dir()
            .join(format!("reconcile-{now_ms}.json"));
        let body = serde_json::to_vec_pretty(receipt)
            .map_err(|e| ReconcileError::io("serialize receipt", io::Error::other(e)))?;
        fsio::atomic_write(&path, &body)
            .map_err(|e| ReconcileError::io(format!("write {}", path.display()), e))
    }
}

/// Liveness source for one pass: the in-memory registry when it was read,
/// otherwise the on-disk oracle.
enum PassOracle<'a> {
    Snapshot(SnapshotLivenessOracle<'a>),
    Disk(RegistryLivenessOracle),
}

impl LivenessOracle for PassOracle<'_> {
    fn has_live_worker(&self, lane: &str, now: f64) -> Result<bool, RegistryError> {
        match self {
            Self::Snapshot(oracle) => oracle.has_live_worker(lane, now),
            Self::Disk(oracle) => oracle.has_live_worker(lane, now),
        }
    }
}

/// Lanes whose lock would be healed at `now`. Removes nothing.
fn plan_heals<O: LivenessOracle>(
    locks: &LaneLockManager<O>,
    lanes: &[String],
    now: f64,
) -> Result<Vec<HealedLock>, ReconcileError> {
    let mut planned = Vec::new();
    for lane in lanes {
        if let LaneCheck::Unlocked {
            healed: Some(reason),
        } = locks.assess_at(lane, now)?
        {
            planned.push(HealedLock {
                lane: lane.clone(),
                reason,
            });
        }
    }
    Ok(planned)
}

/// Heal the planned lanes. A lane whose lock changed since it was assessed is
/// left alone and not reported.
fn apply_heals<O: LivenessOracle>(
    locks: &LaneLockManager<O>,
    planned: Vec<HealedLock>,
    now: f64,
) -> Result<Vec<HealedLock>, ReconcileError> {
    let mut healed = Vec::with_capacity(planned.len());
    for plan in planned {
        match locks.check_at(&plan.lane, now)? {
            LaneCheck::Unlocked {
                healed: Some(reason),
            } => healed.push(HealedLock {
                lane: plan.lane,
                reason,
            }),
            verdict => debug!(lane = %plan.lane, verdict = %verdict, "lane changed since assessment"),
        }
    }
    Ok(healed)
}

/// End the running apply run of every session with a terminating violation.
fn terminate_violating_runs(
    registry: &mut RunRegistry,
    sessions: &SessionStore,
    violations: &[GuardViolation],
    now_ms: u64,
) -> Vec<EndedRun> {
    let mut ended = Vec::new();
    for violation in violations.iter().filter(|v| v.rule.terminates_run()) {
        let reason = violation.termination_reason();
        for run in registry.runs() {
            if !run.is_running() || !run.is_apply_run() {
                continue;
            }
            let session_id = run
                .child_session_key
                .as_deref()
                .and_then(|key| sessions.session_id_for(key));
            if session_id != Some(violation.session_id.as_str()) {
                continue;
            }
            if registry.mark_ended(&run.id, &reason, now_ms) {
                warn!(run_id = %run.id, rule = %violation.rule, "run force-ended by guard");
                ended.push(EndedRun {
                    run_id: run.id,
                    label: run.label,
                    reason: reason.clone(),
                });
            }
        }
    }
    ended
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::{Value, json};

    use super::*;

    const NOW: f64 = 1_767_225_600.0;

    fn setup() -> (tempfile::TempDir, Reconciler) {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = JobhuntConfig::default().resolve_paths(dir.path());
        (dir, Reconciler::new(config))
    }

    fn write_runs(reconciler: &Reconciler, runs: &Value) {
        let path = &reconciler.config.paths.runs_registry;
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, serde_json::to_string_pretty(runs).expect("json")).expect("runs");
    }

    fn write_sessions(reconciler: &Reconciler, sessions: &Value) {
        let path = &reconciler.config.paths.session_store;
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, sessions.to_string()).expect("sessions");
    }

    fn write_lock(reconciler: &Reconciler, lane: &str, acquired_at: f64) {
        let dir = &reconciler.layout.locks_dir;
        fs::create_dir_all(dir).expect("mkdir");
        fs::write(
            dir.join(format!("apply-{lane}.lock")),
            format!("{}\npid=1\nhost=h\n", acquired_at as u64),
        )
        .expect("lock");
    }

    fn receipt_count(dir: &Path) -> usize {
        fs::read_dir(dir).map_or(0, |entries| entries.filter_map(Result::ok).count())
    }

    fn ms(secs: f64) -> u64 {
        (secs * 1000.0) as u64
    }

    #[test]
    fn stale_run_is_ended_and_its_lock_healed_once() {
        let (_dir, reconciler) = setup();
        write_runs(
            &reconciler,
            &json!({ "runs": { "r1": {
                "label": "apply-greenhouse", "startedAt": ms(NOW - 1500.0), "endedAt": null } } }),
        );
        write_lock(&reconciler, "greenhouse", NOW - 600.0);
        let claims = ClaimRegistry::new(
            reconciler.layout.claims_dir.clone(),
            reconciler.layout.claims_lock.clone(),
            2400,
        );
        claims
            .claim_at("https://boards.greenhouse.io/acme/jobs/1", NOW - 3000.0)
            .expect("claim");

        let receipt = reconciler.run_once(NOW, false).expect("first pass");
        assert_eq!(
            receipt.runs_ended,
            vec![EndedRun {
                run_id: "r1".to_string(),
                label: "apply-greenhouse".to_string(),
                reason: "orphan-run-stale-ttl".to_string(),
            }]
        );
        assert_eq!(
            receipt.locks_healed,
            vec![HealedLock {
                lane: "greenhouse".to_string(),
                reason: HealReason::Orphan,
            }]
        );
        assert_eq!(receipt.claims_swept.len(), 1);
        assert!(receipt.changed());
        assert_eq!(receipt_count(&reconciler.layout.receipts_dir()), 1);

        let saved: Value = serde_json::from_str(
            &fs::read_to_string(&reconciler.config.paths.runs_registry).expect("runs"),
        )
        .expect("json");
        assert_eq!(saved["runs"]["r1"]["endedAt"], json!(ms(NOW)));
        assert_eq!(saved["runs"]["r1"]["outcome"]["error"], json!("orphan-run-stale-ttl"));

        let before = fs::read(&reconciler.config.paths.runs_registry).expect("runs");
        let again = reconciler.run_once(NOW + 1.0, false).expect("second pass");
        assert!(!again.changed());
        assert_eq!(
            fs::read(&reconciler.config.paths.runs_registry).expect("runs"),
            before
        );
        assert_eq!(receipt_count(&reconciler.layout.receipts_dir()), 1);
    }

    #[test]
    fn young_run_survives_silent_heartbeat() {
        let (_dir, reconciler) = setup();
        write_runs(
            &reconciler,
            &json!({ "runs": { "r1": {
                "label": "apply-lever", "startedAt": ms(NOW - 30.0), "childSessionKey": "k1" } } }),
        );
        write_sessions(&reconciler, &json!({ "k1": { "updatedAt": ms(NOW - 3600.0) } }));
        write_lock(&reconciler, "lever", NOW - 20.0);

        let receipt = reconciler.run_once(NOW, false).expect("pass");
        assert!(receipt.runs_ended.is_empty());
        assert!(receipt.locks_healed.is_empty());
        assert!(reconciler.layout.locks_dir.join("apply-lever.lock").exists());
    }

    #[test]
    fn heartbeat_timeout_reason_names_the_age() {
        let (_dir, reconciler) = setup();
        write_runs(
            &reconciler,
            &json!({ "runs": { "r1": {
                "label": "apply-ashby", "startedAt": ms(NOW - 300.0), "childSessionKey": "k1" } } }),
        );
        write_sessions(&reconciler, &json!({ "k1": { "updatedAt": ms(NOW - 200.0) } }));
        let receipt = reconciler.run_once(NOW, false).expect("pass");
        assert_eq!(receipt.runs_ended[0].reason, "orphan-heartbeat-timeout-200s");
    }

    #[test]
    fn unreadable_registry_aborts_before_writing() {
        let (_dir, reconciler) = setup();
        let path = reconciler.config.paths.runs_registry.clone();
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "{\"runs\": ").expect("corrupt");
        write_lock(&reconciler, "greenhouse", NOW - 600.0);

        let err = reconciler.run_once(NOW, false).expect_err("must fail");
        assert!(matches!(
            err,
            ReconcileError::Registry(RegistryError::Malformed { .. })
        ));
        assert!(reconciler.layout.locks_dir.join("apply-greenhouse.lock").exists());
        assert!(!reconciler.layout.watch_state().exists());
        assert_eq!(receipt_count(&reconciler.layout.receipts_dir()), 0);
    }

    #[test]
    fn unreadable_claims_abort_before_any_write() {
        let (_dir, reconciler) = setup();
        write_runs(
            &reconciler,
            &json!({ "runs": { "r1": {
                "label": "apply-greenhouse", "startedAt": ms(NOW - 1500.0), "endedAt": null } } }),
        );
        let runs_before =
            fs::read_to_string(&reconciler.config.paths.runs_registry).expect("runs");
        write_lock(&reconciler, "greenhouse", NOW - 600.0);
        // A file where the claims directory should be cannot be listed.
        fs::write(&reconciler.layout.claims_dir, "not a directory").expect("claims");

        let err = reconciler.run_once(NOW, false).expect_err("must fail");
        assert!(matches!(err, ReconcileError::Claim(_)), "got {err:?}");
        assert_eq!(
            fs::read_to_string(&reconciler.config.paths.runs_registry).expect("runs"),
            runs_before
        );
        assert!(reconciler.layout.locks_dir.join("apply-greenhouse.lock").exists());
        assert!(!reconciler.layout.watch_state().exists());
        assert_eq!(receipt_count(&reconciler.layout.receipts_dir()), 0);
    }

    #[test]
    fn missing_registry_fails_closed_for_locks() {
        let (_dir, reconciler) = setup();
        write_lock(&reconciler, "greenhouse", NOW - 600.0);
        write_lock(&reconciler, "lever", NOW - 1000.0);

        let receipt = reconciler.run_once(NOW, false).expect("pass");
        assert_eq!(
            receipt.locks_healed,
            vec![HealedLock {
                lane: "lever".to_string(),
                reason: HealReason::Stale,
            }]
        );
        assert!(reconciler.layout.locks_dir.join("apply-greenhouse.lock").exists());
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let (_dir, reconciler) = setup();
        let runs = json!({ "runs": { "r1": {
            "label": "apply-greenhouse", "startedAt": ms(NOW - 1500.0) } } });
        write_runs(&reconciler, &runs);
        write_lock(&reconciler, "greenhouse", NOW - 600.0);
        let before = fs::read(&reconciler.config.paths.runs_registry).expect("runs");

        let receipt = reconciler.run_once(NOW, true).expect("dry run");
        assert!(receipt.dry_run);
        assert_eq!(receipt.runs_ended.len(), 1);
        assert_eq!(receipt.locks_healed.len(), 1);
        assert!(receipt.summary().starts_with("RECONCILE (dry run): ended=1 healed=1"));

        assert_eq!(
            fs::read(&reconciler.config.paths.runs_registry).expect("runs"),
            before
        );
        assert!(reconciler.layout.locks_dir.join("apply-greenhouse.lock").exists());
        assert!(!reconciler.layout.state_dir.exists());
    }

    #[test]
    fn overlapping_pass_is_refused() {
        let (_dir, reconciler) = setup();
        let held = fsio::open_lock_file(&reconciler.layout.reconcile_lock()).expect("open");
        FileExt::lock_exclusive(&held).expect("hold");
        assert!(matches!(
            reconciler.run_once(NOW, false),
            Err(ReconcileError::Busy)
        ));
        FileExt::unlock(&held).expect("release");
        assert!(reconciler.run_once(NOW, false).is_ok());
    }

    #[test]
    fn guard_violation_ends_the_sessions_run() {
        let (_dir, reconciler) = setup();
        let now = fsio::now_epoch_secs();
        write_runs(
            &reconciler,
            &json!({ "runs": {
                "r1": { "label": "apply-lever", "startedAt": ms(now - 30.0), "childSessionKey": "k1" },
                "r2": { "label": "apply-ashby", "startedAt": ms(now - 30.0), "childSessionKey": "k2" } } }),
        );
        write_sessions(
            &reconciler,
            &json!({
                "k1": { "updatedAt": ms(now), "sessionId": "sub1" },
                "k2": { "updatedAt": ms(now), "sessionId": "sub2" } }),
        );
        // Seed offsets before the transcript exists.
        reconciler.run_once(now, false).expect("seed pass");

        let transcript = reconciler.config.paths.session_dir.join("sub1.jsonl");
        let lines = [
            json!({ "type": "message", "message": { "role": "user",
                "content": [{ "type": "text", "text": "You are a subagent. Apply to Lever jobs." }] } }),
            json!({ "type": "message", "message": { "role": "assistant",
                "content": [{ "type": "toolCall", "name": "exec",
                              "arguments": { "command": "openclaw gateway restart" } }] } }),
        ];
        let body: String = lines.iter().map(|l| format!("{l}\n")).collect();
        fs::write(&transcript, body).expect("transcript");

        let receipt = reconciler
            .run_once(fsio::now_epoch_secs(), false)
            .expect("pass");
        assert_eq!(receipt.scan.violations.len(), 1);
        assert_eq!(
            receipt.runs_ended,
            vec![EndedRun {
                run_id: "r1".to_string(),
                label: "apply-lever".to_string(),
                reason: "FORBIDDEN_GATEWAY_COMMAND: openclaw gateway restart".to_string(),
            }]
        );
        let log = fs::read_to_string(reconciler.layout.guardrails_log()).expect("guard log");
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("\"rule\":\"FORBIDDEN_GATEWAY_COMMAND\""));
    }
}
