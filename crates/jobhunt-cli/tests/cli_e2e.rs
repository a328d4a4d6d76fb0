//! End-to-end tests that drive the `jobhunt` binary against a hermetic
//! `JOBHUNT_HOME`.
//!
//! Each test builds a throwaway home with a `workspace/` holding a small
//! backlog and tracker, runs the binary with a cleared environment and
//! checks stdout, stderr and the exit code.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const QUEUE: &str = "\
# Job Queue

## Queue Stats
- Pending: 3 | In Progress: 0

## PENDING (sorted by priority score, highest first)

### [91] Acme — Staff Engineer
- **URL:** https://jobs.ashbyhq.com/acme/1
- **Status:** PENDING

### [80] Gamma — Backend Engineer
- **URL:** https://boards.greenhouse.io/gamma/jobs/3
- **Status:** PENDING

### [70] Beta — Platform Engineer
- **URL:** https://jobs.lever.co/beta/2
- **Status:** PENDING
";

const TRACKER: &str = "\
# Job Tracker

## Applications
";

fn jobhunt_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_jobhunt"))
}

/// Home with a workspace, a backlog and a tracker. No run registry, so lane
/// liveness fails closed.
fn setup_home() -> (tempfile::TempDir, PathBuf) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let home = tmp.path().to_path_buf();
    let workspace = home.join("workspace");
    fs::create_dir_all(&workspace).expect("workspace");
    fs::write(workspace.join("job-queue.md"), QUEUE).expect("queue");
    fs::write(workspace.join("job-tracker.md"), TRACKER).expect("tracker");
    (tmp, home)
}

/// Run the binary and return `(exit_code, stdout, stderr)`.
fn run(home: &Path, args: &[&str]) -> (i32, String, String) {
    let output = Command::new(jobhunt_bin())
        .args(args)
        .env_clear()
        .env("JOBHUNT_HOME", home)
        .env("HOME", home)
        .env("PATH", std::env::var("PATH").unwrap_or_default())
        .output()
        .expect("spawn jobhunt");
    (
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    )
}

// =========================================================================
// Lane locks
// =========================================================================

#[test]
fn lock_acquire_check_release_cycle() {
    let (_tmp, home) = setup_home();

    let (code, stdout, _) = run(&home, &["lock", "acquire", "ashby"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "LOCKED apply-ashby");
    assert!(home.join("workspace/.locks/apply-ashby.lock").exists());

    let (code, stdout, _) = run(&home, &["lock", "check", "ashby"]);
    assert_eq!(code, 0, "LOCKED is a successful answer");
    assert_eq!(stdout.trim(), "LOCKED (0min ago, ttl=15min)");

    let (code, stdout, _) = run(&home, &["lock", "release", "ashby"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "UNLOCKED apply-ashby");

    let (code, stdout, _) = run(&home, &["lock", "release", "ashby"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "UNLOCKED (no lock existed)");

    let (_, stdout, _) = run(&home, &["lock", "check", "ashby"]);
    assert_eq!(stdout.trim(), "UNLOCKED");
}

#[test]
fn lock_rejects_path_like_lane_names() {
    let (_tmp, home) = setup_home();
    let (code, stdout, stderr) = run(&home, &["lock", "acquire", "../etc"]);
    assert_eq!(code, 2);
    assert!(stdout.is_empty());
    assert!(stderr.contains("invalid lane name"), "stderr: {stderr}");
}

#[test]
fn lock_check_json_reports_state() {
    let (_tmp, home) = setup_home();
    let (code, stdout, _) = run(&home, &["--json", "lock", "check", "lever"]);
    assert_eq!(code, 0);
    let value: serde_json::Value = serde_json::from_str(&stdout).expect("json");
    assert_eq!(value["lane"], "lever");
    assert_eq!(value["state"], "UNLOCKED");
}

// =========================================================================
// Claims
// =========================================================================

#[test]
fn second_claim_reports_claimed_by_other() {
    let (_tmp, home) = setup_home();
    let url = "https://jobs.ashbyhq.com/acme/1";

    let (code, stdout, _) = run(&home, &["claim", url]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "CLAIMED");

    let (code, stdout, _) = run(&home, &["claim", &format!("{url}/")]);
    assert_eq!(code, 0, "CLAIMED_BY_OTHER is a successful answer");
    assert_eq!(stdout.trim(), "CLAIMED_BY_OTHER");

    let (_, stdout, _) = run(&home, &["list-claims"]);
    assert!(stdout.contains(url), "list: {stdout}");
    assert!(!stdout.contains("EXPIRED"));

    let (_, stdout, _) = run(&home, &["release", url]);
    assert_eq!(stdout.trim(), "RELEASED");
    let (_, stdout, _) = run(&home, &["release", url]);
    assert_eq!(stdout.trim(), "NOT_FOUND");
    let (_, stdout, _) = run(&home, &["list-claims"]);
    assert_eq!(stdout.trim(), "No active claims");
}

// =========================================================================
// Backlog mutators
// =========================================================================

#[test]
fn mark_applied_archives_and_refuses_repeat() {
    let (_tmp, home) = setup_home();
    let url = "https://jobs.ashbyhq.com/acme/1";

    let (code, stdout, _) = run(&home, &["mark-applied", url]);
    assert_eq!(code, 0);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "QUEUE: Marked COMPLETED",
            "DEDUP: Updated to APPLIED",
            "TRACKER: Added entry",
            "DONE: Acme — Staff Engineer",
        ]
    );
    let queue = fs::read_to_string(home.join("workspace/job-queue.md")).expect("queue");
    assert!(!queue.contains(url));
    let archive =
        fs::read_to_string(home.join("workspace/job-queue-archive.md")).expect("archive");
    assert!(archive.contains("**Status:** COMPLETED"));

    let (code, stdout, stderr) = run(&home, &["mark-applied", url]);
    assert_eq!(code, 2);
    assert!(stdout.is_empty());
    assert!(
        stderr.contains("ERROR: Refusing to mark APPLIED because URL is not in PENDING queue state"),
        "stderr: {stderr}"
    );
    assert!(stderr.contains("Re-run with --force only for manual correction."));

    let tracker = fs::read_to_string(home.join("workspace/job-tracker.md")).expect("tracker");
    assert_eq!(tracker.matches(url).count(), 1);
}

#[test]
fn mark_applied_rejects_non_url() {
    let (_tmp, home) = setup_home();
    let (code, _, stderr) = run(&home, &["mark-applied", "Acme Staff Engineer"]);
    assert_eq!(code, 2);
    assert!(stderr.contains("invalid url"), "stderr: {stderr}");
}

#[test]
fn skipped_url_is_refused_without_force() {
    let (_tmp, home) = setup_home();
    let url = "https://jobs.lever.co/beta/2";

    let (code, stdout, _) = run(&home, &["skip", url, "location mismatch"]);
    assert_eq!(code, 0);
    assert!(stdout.starts_with("REMOVED: "), "stdout: {stdout}");

    let dedup_before =
        fs::read_to_string(home.join("workspace/dedup-index.md")).expect("dedup");
    let (code, _, _) = run(&home, &["mark-applied", url]);
    assert_eq!(code, 2);
    let dedup_after = fs::read_to_string(home.join("workspace/dedup-index.md")).expect("dedup");
    assert_eq!(dedup_before, dedup_after);

    let (code, stdout, _) = run(&home, &["mark-applied", url, "Beta", "Platform Engineer", "--force"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("QUEUE: Not PENDING or not found"));
}

#[test]
fn add_then_duplicate_then_check_dedup() {
    let (_tmp, home) = setup_home();
    let record = r#"{"score": 85, "company": "Delta", "title": "SRE", "url": "https://jobs.ashbyhq.com/delta/9"}"#;

    let (code, stdout, _) = run(&home, &["add", record]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "ADDED [85] Delta — SRE (4 pending)");

    let (code, stdout, _) = run(&home, &["add", record]);
    assert_eq!(code, 0);
    assert!(stdout.starts_with("DUPLICATE"), "stdout: {stdout}");

    let (_, stdout, _) = run(
        &home,
        &["check-dedup", "https://JOBS.ashbyhq.com/delta/9/application"],
    );
    assert!(stdout.starts_with("DUPLICATE"), "stdout: {stdout}");
    let (_, stdout, _) = run(&home, &["check-dedup", "https://jobs.ashbyhq.com/other/1"]);
    assert_eq!(stdout.trim(), "NEW");

    let (code, _, stderr) = run(&home, &["add", "{not json"]);
    assert_eq!(code, 2);
    assert!(stderr.contains("Invalid JSON"));
}

#[test]
fn compact_preserves_entry_count() {
    let (_tmp, home) = setup_home();
    let (code, stdout, _) = run(&home, &["--json", "compact"]);
    assert_eq!(code, 0);
    let report: serde_json::Value = serde_json::from_str(&stdout).expect("json");
    assert_eq!(report["before"], 3);
    assert_eq!(report["pending"], 3);
    assert_eq!(report["archived_completed"], 0);
}

// =========================================================================
// Dispatch and reconcile
// =========================================================================

#[test]
fn dispatch_status_skips_locked_lane() {
    let (_tmp, home) = setup_home();
    run(&home, &["lock", "acquire", "greenhouse"]);

    let (code, stdout, _) = run(&home, &["dispatch-status"]);
    assert_eq!(code, 0);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], "DISPATCH: pending=3 actionable=3 tier=normal");
    assert!(lines[1].starts_with("ashby: READY"), "{}", lines[1]);
    assert!(lines[2].starts_with("greenhouse: SKIPPED_LOCKED"), "{}", lines[2]);
    assert_eq!(lines[4], "READY: ashby, lever");

    let (_, stdout, _) = run(&home, &["--json", "dispatch-status"]);
    let snapshot: serde_json::Value = serde_json::from_str(&stdout).expect("json");
    assert_eq!(snapshot["ready"], serde_json::json!(["ashby", "lever"]));
}

#[test]
fn reconcile_without_registry_succeeds() {
    let (_tmp, home) = setup_home();

    let (code, stdout, _) = run(&home, &["reconcile", "--dry-run"]);
    assert_eq!(code, 0);
    assert!(stdout.starts_with("RECONCILE (dry run): ended=0"), "stdout: {stdout}");
    assert!(!home.join("workspace/state").exists());

    let (code, stdout, _) = run(&home, &["reconcile"]);
    assert_eq!(code, 0);
    assert!(stdout.starts_with("RECONCILE: ended=0 healed=0"), "stdout: {stdout}");
}

#[test]
fn reconcile_fails_on_malformed_registry() {
    let (_tmp, home) = setup_home();
    let registry = home.join("subagents/runs.json");
    fs::create_dir_all(registry.parent().expect("parent")).expect("dir");
    fs::write(&registry, "{ not json").expect("registry");

    let (code, _, stderr) = run(&home, &["reconcile"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("ERROR:"), "stderr: {stderr}");
    assert!(!home.join("workspace/state/receipts").exists());
}

#[test]
fn invalid_config_exits_with_invalid_args() {
    let (_tmp, home) = setup_home();
    fs::write(home.join("jobhunt.toml"), "[claims]\nttl_secs = 0\n").expect("config");
    let (code, _, stderr) = run(&home, &["list-claims"]);
    assert_eq!(code, 2);
    assert!(stderr.contains("claims.ttl_secs must be positive"), "stderr: {stderr}");
}
