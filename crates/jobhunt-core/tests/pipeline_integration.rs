//! End-to-end pipeline flow through the public API: discovery, dispatch,
//! claim and lock, application, and recovery from a crashed worker.

use std::fs;

use chrono::{NaiveDate, NaiveDateTime};
use jobhunt_core::backlog::mutate::{self, DiscoveryRecord, EnqueueOutcome};
use jobhunt_core::backlog::{BacklogStore, EntryStatus};
use jobhunt_core::claim::{ClaimOutcome, ClaimRegistry};
use jobhunt_core::config::JobhuntConfig;
use jobhunt_core::dispatch::{SlotStatus, dispatch_snapshot};
use jobhunt_core::lane_lock::{HealReason, LaneLockManager};
use jobhunt_core::layout::WorkspaceLayout;
use jobhunt_core::reconcile::Reconciler;
use jobhunt_core::reconcile::liveness::{LivenessThresholds, RegistryLivenessOracle};
use serde_json::json;

const NOW: f64 = 1_767_225_600.0;

const EMPTY_QUEUE: &str = "\
# Job Queue

## Queue Stats
- Pending: 0 | In Progress: 0

## PENDING (sorted by priority score, highest first)
";

fn today() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 1, 1)
        .and_then(|d| d.and_hms_opt(9, 0, 0))
        .expect("valid date")
}

struct Pipeline {
    _dir: tempfile::TempDir,
    config: JobhuntConfig,
    layout: WorkspaceLayout,
    store: BacklogStore,
    claims: ClaimRegistry,
    locks: LaneLockManager<RegistryLivenessOracle>,
}

impl Pipeline {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = JobhuntConfig::default().resolve_paths(dir.path());
        let layout = WorkspaceLayout::new(config.paths.workspace.clone());
        fs::create_dir_all(layout.root()).expect("workspace");
        fs::write(&layout.queue, EMPTY_QUEUE).expect("queue");

        let store = BacklogStore::new(layout.clone(), config.dispatch.no_auto_companies.clone());
        let claims = ClaimRegistry::new(
            layout.claims_dir.clone(),
            layout.claims_lock.clone(),
            config.claims.ttl_secs,
        );
        let oracle = RegistryLivenessOracle::new(
            config.paths.runs_registry.clone(),
            config.paths.session_store.clone(),
            config.paths.session_dir.clone(),
            config.dispatch.lanes.clone(),
            LivenessThresholds::for_lanes(&config.lanes),
        );
        let locks = LaneLockManager::new(layout.locks_dir.clone(), config.lanes.clone(), oracle);
        Self {
            _dir: dir,
            config,
            layout,
            store,
            claims,
            locks,
        }
    }

    fn enqueue(&self, score: i64, company: &str, title: &str, url: &str) -> EnqueueOutcome {
        let record = DiscoveryRecord {
            score,
            company: company.to_string(),
            title: title.to_string(),
            url: url.to_string(),
            ..DiscoveryRecord::default()
        };
        mutate::enqueue(
            &self.store,
            &record,
            &self.config.dispatch.no_auto_companies,
            today(),
        )
        .expect("enqueue")
    }

    fn slot_status(&self, lane: &str, now: f64) -> SlotStatus {
        let snapshot = dispatch_snapshot(
            &self.store,
            &self.locks,
            &self.claims,
            &self.config.dispatch,
            now,
        )
        .expect("snapshot");
        snapshot
            .slots
            .into_iter()
            .find(|s| s.lane == lane)
            .map(|s| s.status)
            .expect("slot")
    }
}

#[test]
fn worker_lifecycle_from_discovery_to_application() {
    let p = Pipeline::new();
    let ashby_url = "https://jobs.ashbyhq.com/acme/1";
    assert!(matches!(
        p.enqueue(90, "Acme", "Staff Engineer", ashby_url),
        EnqueueOutcome::Added { pending: 1, .. }
    ));
    p.enqueue(70, "Gamma", "Backend Engineer", "https://boards.greenhouse.io/gamma/jobs/3");
    assert!(matches!(
        p.enqueue(90, "Acme", "Staff Engineer", "https://jobs.ashbyhq.com/acme/1/"),
        EnqueueOutcome::Duplicate { .. }
    ));

    let snapshot = dispatch_snapshot(&p.store, &p.locks, &p.claims, &p.config.dispatch, NOW)
        .expect("snapshot");
    assert_eq!(snapshot.pending, 2);
    assert_eq!(snapshot.ready, vec!["ashby".to_string(), "greenhouse".to_string()]);
    let top = snapshot.slots[0].top.clone().expect("ashby top entry");
    assert_eq!(top.url, ashby_url);

    // The dispatched worker takes its lane and the posting.
    p.locks.acquire_at("ashby", NOW as u64).expect("lock");
    assert!(matches!(
        p.claims.claim_at(&top.url, NOW).expect("claim"),
        ClaimOutcome::Claimed { .. }
    ));
    assert!(matches!(
        p.claims.claim_at(&top.url, NOW + 5.0).expect("second claim"),
        ClaimOutcome::ClaimedByOther { .. }
    ));
    assert_eq!(p.slot_status("ashby", NOW + 10.0), SlotStatus::SkippedLocked);

    let report = mutate::mark_applied(&p.store, &top.url, "", "", false, today())
        .expect("mark applied");
    assert_eq!(report.archived, 1);
    assert_eq!(report.company, "Acme");
    p.claims.release(&top.url).expect("release claim");
    assert!(p.locks.release("ashby").expect("release lock"));

    let after = p.store.read().expect("read");
    assert_eq!(after.counts.pending, 1);
    assert!(
        after
            .document
            .entries()
            .all(|e| e.status == EntryStatus::Pending && e.url != ashby_url)
    );
    assert_eq!(p.slot_status("ashby", NOW + 20.0), SlotStatus::SkippedEmpty);

    // A second application attempt is refused and changes nothing.
    let queue_before = fs::read_to_string(&p.layout.queue).expect("queue");
    assert!(mutate::mark_applied(&p.store, ashby_url, "", "", false, today()).is_err());
    assert_eq!(fs::read_to_string(&p.layout.queue).expect("queue"), queue_before);
}

#[test]
fn reconcile_recovers_lane_from_crashed_worker() {
    let p = Pipeline::new();
    p.enqueue(70, "Gamma", "Backend Engineer", "https://boards.greenhouse.io/gamma/jobs/3");

    // A greenhouse worker started 25 minutes ago and died without cleaning
    // up: its run is still open and its lock is still on disk.
    let registry = &p.config.paths.runs_registry;
    fs::create_dir_all(registry.parent().expect("parent")).expect("mkdir");
    fs::write(
        registry,
        json!({ "runs": { "gh-1": {
            "label": "apply-greenhouse",
            "startedAt": ((NOW - 1500.0) * 1000.0) as u64,
            "endedAt": null
        } } })
        .to_string(),
    )
    .expect("registry");
    p.locks
        .acquire_at("greenhouse", (NOW - 1200.0) as u64)
        .expect("lock");

    let reconciler = Reconciler::new(p.config.clone());
    let receipt = reconciler.run_once(NOW, false).expect("reconcile");
    assert_eq!(receipt.runs_ended.len(), 1);
    assert_eq!(receipt.runs_ended[0].reason, "orphan-run-stale-ttl");
    assert_eq!(receipt.locks_healed.len(), 1);
    assert_eq!(receipt.locks_healed[0].lane, "greenhouse");
    assert_eq!(receipt.locks_healed[0].reason, HealReason::Orphan);
    assert!(!p.locks.lock_path("greenhouse").exists());

    let saved: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(registry).expect("registry")).expect("json");
    assert!(saved["runs"]["gh-1"]["endedAt"].is_number());

    assert_eq!(p.slot_status("greenhouse", NOW), SlotStatus::Ready);

    let again = reconciler.run_once(NOW + 1.0, false).expect("second pass");
    assert!(!again.changed());
}
