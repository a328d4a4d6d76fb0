//! Incremental transcript scanning: success streak and guard violations.
//!
//! Each `<session-id>.jsonl` transcript is read from a persisted byte offset,
//! so every line is processed once. Offsets are seeded at the current file
//! size the first time the reconciler runs (history is not replayed), a file
//! that shrank is reread from the start, and a file first seen after the
//! reconciler started is read from the beginning.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::guard::{Guard, GuardViolation, SessionGuard, is_subagent_prompt, violation_digest};
use crate::backlog::mutate::{MARK_APPLIED_REFUSAL, MARKED_COMPLETED_MARKER};
use crate::fsio;

const MAX_COUNTED_SESSIONS: usize = 2000;
const MAX_VIOLATION_IDS: usize = 5000;
const MAX_SESSION_GUARDS: usize = 2000;

/// Largest chunk read from one transcript per pass.
const MAX_SCAN_BYTES: u64 = 8 * 1024 * 1024;

static FAIL_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bSTATUS=(DEFERRED|SKIPPED)\b").expect("fail marker regex is valid"));

// ─────────────────────────────────────────────────────────────────────────────
// Watch State
// ─────────────────────────────────────────────────────────────────────────────

/// Reconciler state persisted between passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchState {
    /// First pass time (epoch seconds).
    pub started_epoch: u64,
    /// Consecutive successful applications.
    pub streak: u64,
    /// All successful applications seen.
    pub success_total: u64,
    /// Byte offset per transcript path.
    pub session_offsets: BTreeMap<String, u64>,
    /// Whether offsets have been seeded.
    pub session_offsets_initialized: bool,
    /// Sessions already counted as a success.
    pub counted_success_sessions: BTreeSet<String>,
    /// Guard flags per session.
    pub session_guard: BTreeMap<String, SessionGuard>,
    /// Digests of recorded violations.
    pub guard_violation_ids: BTreeSet<String>,
    /// Violations recorded.
    pub guard_violation_total: u64,
}

impl WatchState {
    /// Fresh state stamped `now`.
    pub fn new(now: u64) -> Self {
        Self {
            started_epoch: now,
            ..Self::default()
        }
    }

    /// Load state from `path`. A missing or unreadable file yields fresh
    /// state.
    pub fn load(path: &Path, now: u64) -> Self {
        let content = match fsio::bounded_read_to_string(path, fsio::MAX_DOCUMENT_SIZE) {
            Ok(Some(content)) => content,
            Ok(None) => return Self::new(now),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "watch state unreadable, starting fresh");
                return Self::new(now);
            },
        };
        match serde_json::from_str::<Self>(&content) {
            Ok(mut state) => {
                if state.started_epoch == 0 {
                    state.started_epoch = now;
                }
                state
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "watch state malformed, starting fresh");
                Self::new(now)
            },
        }
    }

    /// Atomically persist to `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error on failure.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let body = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        fsio::atomic_write(path, &body)
    }

    fn reset_streak(&mut self) {
        if self.streak != 0 {
            info!(previous = self.streak, "success streak reset");
        }
        self.streak = 0;
    }

    /// Bound the history sets so state does not grow without limit.
    fn prune(&mut self) {
        trim_set(&mut self.counted_success_sessions, MAX_COUNTED_SESSIONS);
        trim_set(&mut self.guard_violation_ids, MAX_VIOLATION_IDS);
        if self.session_guard.len() > MAX_SESSION_GUARDS {
            let mut by_recency: Vec<_> = std::mem::take(&mut self.session_guard)
                .into_iter()
                .collect();
            by_recency.sort_by(|a, b| b.1.last_seen_ts.cmp(&a.1.last_seen_ts));
            by_recency.truncate(MAX_SESSION_GUARDS);
            self.session_guard = by_recency.into_iter().collect();
        }
    }
}

/// Bound `set` to `max` entries by dropping the lowest keys. Keys are digests
/// and session ids, so which ones go says nothing about their age.
fn trim_set(set: &mut BTreeSet<String>, max: usize) {
    while set.len() > max {
        set.pop_first();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transcript Events
// ─────────────────────────────────────────────────────────────────────────────

/// A tool call inside a message.
#[derive(Debug, Clone, PartialEq)]
struct ToolCall {
    name: String,
    arguments: Value,
}

/// The parts of a transcript line the scanner looks at.
#[derive(Debug, Clone, PartialEq, Default)]
struct MessageEvent {
    role: String,
    text: String,
    tool_calls: Vec<ToolCall>,
}

impl MessageEvent {
    fn parse(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line).ok()?;
        if value.get("type").and_then(Value::as_str) != Some("message") {
            return Some(Self::default());
        }
        let message = value.get("message")?;
        let role = message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut texts = Vec::new();
        let mut tool_calls = Vec::new();
        for part in message
            .get("content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            match part.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        if !text.is_empty() {
                            texts.push(text);
                        }
                    }
                },
                Some("toolCall") => tool_calls.push(ToolCall {
                    name: part
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: part.get("arguments").cloned().unwrap_or(Value::Null),
                }),
                _ => {},
            }
        }
        Some(Self {
            role,
            text: texts.join("\n"),
            tool_calls,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scanner
// ─────────────────────────────────────────────────────────────────────────────

/// What one scan observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Sessions newly counted as a success.
    pub successes: Vec<String>,
    /// Failure markers that reset the streak.
    pub failures: u64,
    /// Newly recorded violations.
    pub violations: Vec<GuardViolation>,
    /// Transcripts that had new content.
    pub transcripts_read: usize,
}

/// Scans the transcript directory.
#[derive(Debug, Clone)]
pub struct TranscriptScanner {
    session_dir: PathBuf,
    window_secs: u64,
    max_tracked: usize,
    guard: Guard,
}

impl TranscriptScanner {
    /// Scanner over `session_dir`.
    pub const fn new(session_dir: PathBuf, window_secs: u64, max_tracked: usize, guard: Guard) -> Self {
        Self {
            session_dir,
            window_secs,
            max_tracked,
            guard,
        }
    }

    /// `(mtime, path)` for every transcript, newest first.
    fn transcripts(&self) -> Vec<(f64, PathBuf)> {
        let Ok(entries) = fs::read_dir(&self.session_dir) else {
            return Vec::new();
        };
        let mut found: Vec<(f64, PathBuf)> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("jsonl"))
            .filter_map(|path| fsio::mtime_epoch_secs(&path).ok().map(|m| (m, path)))
            .collect();
        found.sort_by(|a, b| b.0.total_cmp(&a.0));
        found
    }

    fn within_window(&self, mtime: f64, now: f64) -> bool {
        now - mtime <= self.window_secs as f64
    }

    fn initialize_offsets(&self, state: &mut WatchState, now: f64) {
        if state.session_offsets_initialized {
            return;
        }
        let mut offsets = BTreeMap::new();
        for (mtime, path) in self.transcripts() {
            if offsets.len() >= self.max_tracked {
                break;
            }
            if !self.within_window(mtime, now) {
                continue;
            }
            if let Ok(meta) = fs::metadata(&path) {
                offsets.insert(path.display().to_string(), meta.len());
            }
        }
        info!(tracked = offsets.len(), "transcript offsets initialized");
        state.session_offsets = offsets;
        state.session_offsets_initialized = true;
    }

    /// Scan every tracked transcript for new lines, updating `state`.
    pub fn scan(&self, state: &mut WatchState, now: f64) -> ScanReport {
        self.initialize_offsets(state, now);
        let now_ts = now as u64;

        let mut recent: Vec<(f64, PathBuf)> = self
            .transcripts()
            .into_iter()
            .filter(|(mtime, _)| self.within_window(*mtime, now))
            .collect();
        let recent_keys: BTreeSet<String> =
            recent.iter().map(|(_, p)| p.display().to_string()).collect();
        state
            .session_offsets
            .retain(|path, _| recent_keys.contains(path));

        recent.truncate(self.max_tracked);
        recent.reverse();

        let mut report = ScanReport::default();
        for (mtime, path) in recent {
            let key = path.display().to_string();
            let Ok(size) = fs::metadata(&path).map(|m| m.len()) else {
                continue;
            };
            let mut offset = state.session_offsets.get(&key).copied().unwrap_or_else(|| {
                if mtime as u64 >= state.started_epoch { 0 } else { size }
            });
            if size < offset {
                debug!(path = %key, "transcript shrank, rereading");
                offset = 0;
            }
            if size == offset {
                state.session_offsets.insert(key, size);
                continue;
            }
            match self.scan_file(&path, offset, state, now, now_ts, &mut report) {
                Ok(consumed) => {
                    report.transcripts_read += 1;
                    state.session_offsets.insert(key, offset + consumed);
                },
                Err(e) => warn!(path = %key, error = %e, "transcript unreadable"),
            }
        }
        state.prune();
        report
    }

    /// Process complete lines from `offset`. Returns bytes consumed; a
    /// trailing partial line is left for the next pass. A line longer than the
    /// read window is skipped so the lines after it are still seen.
    fn scan_file(
        &self,
        path: &Path,
        offset: u64,
        state: &mut WatchState,
        now: f64,
        now_ts: u64,
        report: &mut ScanReport,
    ) -> io::Result<u64> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut skipped = 0u64;
        let (buf, end) = loop {
            let mut buf = Vec::new();
            file.by_ref().take(MAX_SCAN_BYTES).read_to_end(&mut buf)?;
            match buf.iter().rposition(|b| *b == b'\n') {
                Some(end) => break (buf, end),
                None if (buf.len() as u64) < MAX_SCAN_BYTES => return Ok(skipped),
                None => {
                    skipped += buf.len() as u64;
                    warn!(
                        path = %path.display(),
                        skipped_bytes = skipped,
                        "oversized transcript line skipped"
                    );
                },
            }
        };
        // After a skip the chunk opens with the tail of the oversized line,
        // which does not parse and is ignored.
        let chunk = String::from_utf8_lossy(&buf[..=end]);

        let session_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let session_file = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        for line in chunk.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some(event) = MessageEvent::parse(line) else {
                continue;
            };
            let guard = state.session_guard.entry(session_id.clone()).or_default();
            guard.last_seen_ts = now_ts;

            if event.role == "user" && !event.text.is_empty() && is_subagent_prompt(&event.text) {
                guard.is_subagent = true;
            }

            if event.role == "toolResult" && event.text.contains(MARKED_COMPLETED_MARKER) {
                if state.counted_success_sessions.insert(session_id.clone()) {
                    state.streak += 1;
                    state.success_total += 1;
                    report.successes.push(session_id.clone());
                    info!(
                        session = %session_file,
                        streak = state.streak,
                        total = state.success_total,
                        "application success observed"
                    );
                }
                continue;
            }

            if !event.text.is_empty()
                && (event.text.contains(MARK_APPLIED_REFUSAL)
                    || (event.role == "assistant" && FAIL_MARKER_RE.is_match(&event.text)))
            {
                report.failures += 1;
                debug!(session = %session_file, "failure marker observed");
                state.reset_streak();
            }

            let mut hits = Vec::new();
            if let Some(guard) = state.session_guard.get_mut(&session_id) {
                for call in &event.tool_calls {
                    hits.extend(self.guard.inspect(&call.name, &call.arguments, guard));
                }
            }
            for hit in hits {
                let digest = violation_digest(&session_id, hit.rule, &hit.detail);
                if !state.guard_violation_ids.insert(digest) {
                    continue;
                }
                state.guard_violation_total += 1;
                let violation = GuardViolation::new(&session_id, &session_file, &hit, now);
                warn!(
                    rule = %violation.rule,
                    session = %session_file,
                    detail = %violation.detail.chars().take(180).collect::<String>(),
                    "guard violation"
                );
                state.reset_streak();
                report.violations.push(violation);
            }
        }
        Ok(skipped + end as u64 + 1)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;
    use crate::config::GuardConfig;
    use crate::reconcile::guard::GuardRule;

    fn scanner(dir: &Path) -> TranscriptScanner {
        TranscriptScanner::new(
            dir.to_path_buf(),
            18 * 3600,
            300,
            Guard::new(Path::new("/ws"), &GuardConfig::default()),
        )
    }

    fn message(role: &str, text: &str) -> String {
        json!({ "type": "message", "message": { "role": role,
            "content": [{ "type": "text", "text": text }] } })
        .to_string()
            + "\n"
    }

    fn tool_call(name: &str, arguments: Value) -> String {
        json!({ "type": "message", "message": { "role": "assistant",
            "content": [{ "type": "toolCall", "id": "t1", "name": name, "arguments": arguments }] } })
        .to_string()
            + "\n"
    }

    fn append(path: &Path, text: &str) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open transcript");
        file.write_all(text.as_bytes()).expect("append");
    }

    #[test]
    fn first_pass_skips_history_then_reads_appends() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("s1.jsonl");
        append(&path, &message("toolResult", "QUEUE: Marked COMPLETED"));

        let now = fsio::now_epoch_secs();
        // State created after the file existed: history is not replayed.
        let mut state = WatchState::new(now as u64 + 5);
        let scan = scanner(dir.path());
        let report = scan.scan(&mut state, now);
        assert!(report.successes.is_empty());
        assert_eq!(state.streak, 0);

        append(&path, &message("toolResult", "QUEUE: Marked COMPLETED job 1"));
        let report = scan.scan(&mut state, now);
        assert_eq!(report.successes, vec!["s1".to_string()]);
        assert_eq!(state.streak, 1);

        // Same session never counts twice.
        append(&path, &message("toolResult", "QUEUE: Marked COMPLETED job 2"));
        scan.scan(&mut state, now);
        assert_eq!(state.streak, 1);
        assert_eq!(state.success_total, 1);
    }

    #[test]
    fn new_files_are_read_from_start_and_failures_reset() {
        let dir = tempfile::tempdir().expect("temp dir");
        let now = fsio::now_epoch_secs();
        let mut state = WatchState::new(now as u64 - 60);
        let scan = scanner(dir.path());
        scan.scan(&mut state, now);

        append(
            &dir.path().join("a.jsonl"),
            &message("toolResult", "QUEUE: Marked COMPLETED"),
        );
        append(
            &dir.path().join("b.jsonl"),
            &message("toolResult", "QUEUE: Marked COMPLETED"),
        );
        scan.scan(&mut state, now);
        assert_eq!(state.streak, 2);

        append(
            &dir.path().join("c.jsonl"),
            &message("assistant", "done. STATUS=DEFERRED"),
        );
        let report = scan.scan(&mut state, now);
        assert_eq!(report.failures, 1);
        assert_eq!(state.streak, 0);
        assert_eq!(state.success_total, 2);
    }

    #[test]
    fn refusal_text_resets_streak() {
        let dir = tempfile::tempdir().expect("temp dir");
        let now = fsio::now_epoch_secs();
        let mut state = WatchState::new(now as u64 - 60);
        state.session_offsets_initialized = true;
        state.streak = 4;
        append(
            &dir.path().join("s.jsonl"),
            &message(
                "toolResult",
                "ERROR: Refusing to mark APPLIED because URL is not in PENDING queue state.",
            ),
        );
        scanner(dir.path()).scan(&mut state, now);
        assert_eq!(state.streak, 0);
    }

    #[test]
    fn oversized_line_does_not_stall_the_transcript() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("s.jsonl");
        let now = fsio::now_epoch_secs();
        let mut state = WatchState::new(now as u64 - 60);
        state.session_offsets_initialized = true;

        let huge = "x".repeat(MAX_SCAN_BYTES as usize + 1024);
        append(&path, &message("assistant", &huge));
        append(&path, &message("toolResult", "QUEUE: Marked COMPLETED"));
        let report = scanner(dir.path()).scan(&mut state, now);
        assert_eq!(report.successes, vec!["s".to_string()]);
        assert_eq!(state.streak, 1);
        let size = fs::metadata(&path).expect("metadata").len();
        assert_eq!(state.session_offsets.values().copied().sum::<u64>(), size);
    }

    #[test]
    fn partial_lines_wait_for_newline() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("s.jsonl");
        let now = fsio::now_epoch_secs();
        let mut state = WatchState::new(now as u64 - 60);
        state.session_offsets_initialized = true;

        let line = message("toolResult", "QUEUE: Marked COMPLETED");
        let (head, tail) = line.split_at(20);
        append(&path, head);
        let scan = scanner(dir.path());
        scan.scan(&mut state, now);
        assert_eq!(state.streak, 0);
        assert_eq!(state.session_offsets.values().copied().sum::<u64>(), 0);

        append(&path, tail);
        scan.scan(&mut state, now);
        assert_eq!(state.streak, 1);
    }

    #[test]
    fn shrunk_file_is_reread() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("s.jsonl");
        let now = fsio::now_epoch_secs();
        let mut state = WatchState::new(now as u64 - 60);
        state.session_offsets_initialized = true;
        append(&path, &message("user", "hello"));
        state
            .session_offsets
            .insert(path.display().to_string(), 100_000);
        let report = scanner(dir.path()).scan(&mut state, now);
        assert_eq!(report.transcripts_read, 1);
        let expected = fs::metadata(&path).expect("meta").len();
        assert_eq!(state.session_offsets[&path.display().to_string()], expected);
    }

    #[test]
    fn subagent_violations_are_recorded_once() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("sub.jsonl");
        let now = fsio::now_epoch_secs();
        let mut state = WatchState::new(now as u64 - 60);
        state.session_offsets_initialized = true;
        state.streak = 3;

        let gateway = tool_call("exec", json!({ "command": "openclaw gateway restart" }));
        append(&path, &gateway);
        let scan = scanner(dir.path());
        assert!(scan.scan(&mut state, now).violations.is_empty());
        assert_eq!(state.streak, 3);

        append(&path, &message("user", "You are a subagent. Apply to Lever jobs."));
        append(&path, &gateway);
        append(&path, &gateway);
        let report = scan.scan(&mut state, now);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].rule, GuardRule::ForbiddenGatewayCommand);
        assert_eq!(report.violations[0].session_id, "sub");
        assert_eq!(state.guard_violation_total, 1);
        assert_eq!(state.streak, 0);
        assert!(state.session_guard["sub"].is_subagent);
    }

    #[test]
    fn watch_state_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("state").join("watch-state.json");
        let mut state = WatchState::new(100);
        state.streak = 2;
        state.counted_success_sessions.insert("s".to_string());
        state.save(&path).expect("save");
        assert_eq!(WatchState::load(&path, 999), state);

        fs::write(&path, "garbage").expect("corrupt");
        assert_eq!(WatchState::load(&path, 999), WatchState::new(999));
    }

    #[test]
    fn prune_keeps_most_recent_guards() {
        let mut state = WatchState::new(0);
        for i in 0..(MAX_SESSION_GUARDS + 5) {
            state.session_guard.insert(
                format!("s{i:05}"),
                SessionGuard {
                    last_seen_ts: i as u64,
                    ..SessionGuard::default()
                },
            );
        }
        state.prune();
        assert_eq!(state.session_guard.len(), MAX_SESSION_GUARDS);
        assert!(!state.session_guard.contains_key("s00000"));
        assert!(state.session_guard.contains_key("s02004"));
    }
}
