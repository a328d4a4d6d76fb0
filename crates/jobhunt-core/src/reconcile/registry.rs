//! Read views over the worker supervisor's run registry and session store.
//!
//! Both documents belong to an external collaborator. The core reads them
//! leniently as [`serde_json::Value`] so unknown fields survive a rewrite, and
//! only ever writes the run registry to mark an abandoned run ended.
//!
//! ```json
//! { "runs": { "<run-id>": { "label": "apply-greenhouse", "startedAt": 1767225600000,
//!                           "endedAt": null, "childSessionKey": "agent:main:sub:1" } } }
//! ```

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::warn;

use crate::fsio;

/// Longest error text stored in a synthetic outcome.
pub const MAX_OUTCOME_ERROR_LENGTH: usize = 600;

static APPLY_TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)subagent-lock(?:\.py)?\s+lock\s+apply").expect("apply task regex is valid")
});

/// Errors reading or writing collaborator documents.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The document does not exist.
    #[error("run registry not found: {}", path.display())]
    Missing {
        /// Expected location.
        path: PathBuf,
    },

    /// The document exists but is not the expected shape.
    #[error("malformed registry {}: {reason}", path.display())]
    Malformed {
        /// Offending file.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// Filesystem failure.
    #[error("registry I/O error: {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl RegistryError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// JavaScript-style truthiness, which is how the supervisor encodes
/// "unset" (`null`, `0`, `false` and `""` all occur in the wild).
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run Records
// ─────────────────────────────────────────────────────────────────────────────

/// Typed view of one run in the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    /// Registry key.
    pub id: String,
    /// Supervisor label, e.g. `apply-greenhouse`.
    pub label: String,
    /// Task prompt given to the worker.
    pub task: String,
    /// Start time in milliseconds. `None` when present but unparseable.
    pub started_at_ms: Option<f64>,
    /// Whether `endedAt` is set.
    pub ended: bool,
    /// Key into the session store.
    pub child_session_key: Option<String>,
}

impl RunRecord {
    fn from_value(id: &str, value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let started = ["startedAt", "createdAt"]
            .into_iter()
            .filter_map(|k| obj.get(k))
            .find(|v| truthy(v));
        let started_at_ms = match started {
            Some(v) => as_number(v),
            None => Some(0.0),
        };
        let child_session_key = obj
            .get("childSessionKey")
            .filter(|v| truthy(v))
            .map(|v| as_text(Some(v)));
        Some(Self {
            id: id.to_string(),
            label: as_text(obj.get("label")),
            task: as_text(obj.get("task")),
            started_at_ms,
            ended: obj.get("endedAt").is_some_and(truthy),
            child_session_key,
        })
    }

    /// Whether the run has not ended.
    pub const fn is_running(&self) -> bool {
        !self.ended
    }

    /// Whether this is an apply worker (as opposed to search or other jobs).
    pub fn is_apply_run(&self) -> bool {
        self.label.to_ascii_lowercase().starts_with("apply-") || APPLY_TASK_RE.is_match(&self.task)
    }

    /// Whether the label or task names `lane`.
    pub fn mentions_lane(&self, lane: &str) -> bool {
        let lane = lane.to_ascii_lowercase();
        self.label.to_ascii_lowercase().contains(&lane)
            || self.task.to_ascii_lowercase().contains(&lane)
    }

    /// Run age at `now` in seconds. An unparseable start counts as just
    /// started.
    pub fn age_secs(&self, now: f64) -> f64 {
        self.started_at_ms
            .map_or(0.0, |ms| (now - ms / 1000.0).max(0.0))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run Registry
// ─────────────────────────────────────────────────────────────────────────────

/// The run registry document, held as JSON so foreign fields are preserved.
#[derive(Debug, Clone)]
pub struct RunRegistry {
    path: PathBuf,
    document: Value,
    dirty: bool,
}

impl RunRegistry {
    /// Load the registry at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Missing`] when the file is absent,
    /// [`RegistryError::Malformed`] when it is not a JSON object or `runs` is
    /// missing or not an object, and [`RegistryError::Io`] on read failure.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = fsio::bounded_read_to_string(path, fsio::MAX_DOCUMENT_SIZE)
            .map_err(|e| RegistryError::io(format!("read {}", path.display()), e))?
            .ok_or_else(|| RegistryError::Missing {
                path: path.to_path_buf(),
            })?;
        let document: Value =
            serde_json::from_str(&content).map_err(|e| RegistryError::Malformed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Self::from_value(path, document)
    }

    /// Wrap an already-parsed document.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Malformed`] if the shape is wrong.
    pub fn from_value(path: &Path, document: Value) -> Result<Self, RegistryError> {
        let malformed = |reason: &str| RegistryError::Malformed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        let obj = document
            .as_object()
            .ok_or_else(|| malformed("top level is not an object"))?;
        // Without a `runs` map nothing can vouch for a worker, so the
        // document counts as unreadable and lock heals fail closed.
        match obj.get("runs") {
            Some(runs) if runs.is_object() => {},
            Some(_) => return Err(malformed("`runs` is not an object")),
            None => return Err(malformed("`runs` is missing")),
        }
        Ok(Self {
            path: path.to_path_buf(),
            document,
            dirty: false,
        })
    }

    fn runs_map(&self) -> Option<&Map<String, Value>> {
        self.document.get("runs").and_then(Value::as_object)
    }

    /// Every well-formed run, in key order.
    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs_map()
            .map(|runs| {
                runs.iter()
                    .filter_map(|(id, value)| RunRecord::from_value(id, value))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark run `id` ended with a synthetic error outcome.
    ///
    /// Returns `false` if the run does not exist or has already ended.
    pub fn mark_ended(&mut self, id: &str, reason: &str, now_ms: u64) -> bool {
        let Some(run) = self
            .document
            .get_mut("runs")
            .and_then(Value::as_object_mut)
            .and_then(|runs| runs.get_mut(id))
            .and_then(Value::as_object_mut)
        else {
            return false;
        };
        if run.get("endedAt").is_some_and(truthy) {
            return false;
        }
        let error: String = reason.chars().take(MAX_OUTCOME_ERROR_LENGTH).collect();
        run.insert("endedAt".to_string(), json!(now_ms));
        run.insert(
            "outcome".to_string(),
            json!({ "status": "error", "error": error }),
        );
        run.insert("cleanupHandled".to_string(), json!(true));
        run.insert("cleanupCompletedAt".to_string(), json!(now_ms));
        self.dirty = true;
        true
    }

    /// Whether [`Self::mark_ended`] changed anything since load.
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The underlying document.
    pub const fn document(&self) -> &Value {
        &self.document
    }

    /// Atomically write the document back (pretty JSON, trailing newline).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] on failure.
    pub fn save(&self) -> Result<(), RegistryError> {
        let mut body = serde_json::to_string_pretty(&self.document)
            .map_err(|e| RegistryError::io("serialize run registry", io::Error::other(e)))?;
        body.push('\n');
        fsio::atomic_write(&self.path, body.as_bytes())
            .map_err(|e| RegistryError::io(format!("write {}", self.path.display()), e))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Store
// ─────────────────────────────────────────────────────────────────────────────

/// One session store entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionEntry {
    /// Last update in milliseconds.
    pub updated_at_ms: Option<f64>,
    /// Transcript identifier.
    pub session_id: Option<String>,
}

/// The session store: child session key to session metadata.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    entries: BTreeMap<String, SessionEntry>,
}

impl SessionStore {
    /// Load the store at `path`. A missing or malformed store is empty: runs
    /// then have no heartbeat and fall back to the grace period.
    pub fn load(path: &Path) -> Self {
        let content = match fsio::bounded_read_to_string(path, fsio::MAX_DOCUMENT_SIZE) {
            Ok(Some(content)) => content,
            Ok(None) => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "session store unreadable");
                return Self::default();
            },
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(value) => Self::from_value(&value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "session store malformed");
                Self::default()
            },
        }
    }

    /// Build from a parsed document, skipping entries of the wrong shape.
    pub fn from_value(value: &Value) -> Self {
        let entries = value
            .as_object()
            .map(|obj| {
                obj.iter()
                    .filter_map(|(key, entry)| {
                        let entry = entry.as_object()?;
                        Some((
                            key.clone(),
                            SessionEntry {
                                updated_at_ms: entry.get("updatedAt").and_then(Value::as_f64),
                                session_id: entry
                                    .get("sessionId")
                                    .and_then(Value::as_str)
                                    .filter(|s| !s.is_empty())
                                    .map(str::to_string),
                            },
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { entries }
    }

    /// Entry for `child_key`.
    pub fn get(&self, child_key: &str) -> Option<&SessionEntry> {
        self.entries.get(child_key)
    }

    /// Transcript id for `child_key`.
    pub fn session_id_for(&self, child_key: &str) -> Option<&str> {
        self.get(child_key)?.session_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn registry(value: Value) -> RunRegistry {
        RunRegistry::from_value(Path::new("runs.json"), value).expect("registry")
    }

    #[test]
    fn run_fields_are_read_leniently() {
        let reg = registry(json!({
            "runs": {
                "a": { "label": "apply-greenhouse", "startedAt": 1_000_000, "endedAt": null },
                "b": { "label": "search", "createdAt": "2000000", "endedAt": 5 },
                "c": { "task": "run `python3 scripts/subagent-lock.py lock apply` first",
                       "startedAt": 0, "createdAt": 3_000_000 },
                "d": "not an object",
                "e": { "label": "apply-lever", "startedAt": "soon" }
            }
        }));
        let runs = reg.runs();
        assert_eq!(runs.len(), 4);

        assert!(runs[0].is_apply_run() && runs[0].is_running());
        assert_eq!(runs[0].age_secs(1_010.0), 10.0);

        assert!(!runs[1].is_apply_run());
        assert!(!runs[1].is_running());
        assert_eq!(runs[1].started_at_ms, Some(2_000_000.0));

        assert!(runs[2].is_apply_run());
        assert_eq!(runs[2].started_at_ms, Some(3_000_000.0));

        assert_eq!(runs[3].started_at_ms, None);
        assert_eq!(runs[3].age_secs(99_999.0), 0.0);
    }

    #[test]
    fn missing_start_is_epoch_zero() {
        let reg = registry(json!({ "runs": { "a": { "label": "apply-ashby" } } }));
        assert_eq!(reg.runs()[0].age_secs(500.0), 500.0);
    }

    #[test]
    fn lane_mentions_are_case_insensitive() {
        let reg = registry(json!({ "runs": { "a": { "label": "Apply-Greenhouse-Acme" } } }));
        let run = &reg.runs()[0];
        assert!(run.mentions_lane("greenhouse"));
        assert!(!run.mentions_lane("lever"));
    }

    #[test]
    fn mark_ended_preserves_foreign_fields() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("runs.json");
        fs::write(
            &path,
            r#"{"version": 3, "runs": {"a": {"label": "apply-ashby", "startedAt": 1, "extra": [1, 2]}}}"#,
        )
        .expect("seed");

        let mut reg = RunRegistry::load(&path).expect("load");
        assert!(!reg.is_dirty());
        assert!(reg.mark_ended("a", "orphan-run-stale-ttl", 42_000));
        assert!(!reg.mark_ended("a", "again", 43_000));
        assert!(!reg.mark_ended("missing", "x", 43_000));
        reg.save().expect("save");

        let saved: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(saved["version"], json!(3));
        assert_eq!(saved["runs"]["a"]["extra"], json!([1, 2]));
        assert_eq!(saved["runs"]["a"]["endedAt"], json!(42_000));
        assert_eq!(
            saved["runs"]["a"]["outcome"],
            json!({ "status": "error", "error": "orphan-run-stale-ttl" })
        );
        assert_eq!(saved["runs"]["a"]["cleanupHandled"], json!(true));
        assert_eq!(saved["runs"]["a"]["cleanupCompletedAt"], json!(42_000));
    }

    #[test]
    fn malformed_and_missing_registries_are_errors() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("runs.json");
        assert!(matches!(
            RunRegistry::load(&path),
            Err(RegistryError::Missing { .. })
        ));
        fs::write(&path, "{\"runs\": [").expect("seed");
        assert!(matches!(
            RunRegistry::load(&path),
            Err(RegistryError::Malformed { .. })
        ));
        fs::write(&path, "{\"runs\": []}").expect("seed");
        assert!(matches!(
            RunRegistry::load(&path),
            Err(RegistryError::Malformed { .. })
        ));
        fs::write(&path, "{}").expect("seed");
        assert!(matches!(
            RunRegistry::load(&path),
            Err(RegistryError::Malformed { .. })
        ));
        fs::write(&path, "{\"runs\": {}}").expect("seed");
        assert!(RunRegistry::load(&path).expect("empty runs").runs().is_empty());
    }

    #[test]
    fn session_store_skips_bad_entries() {
        let store = SessionStore::from_value(&json!({
            "k1": { "updatedAt": 1_000, "sessionId": "s1" },
            "k2": "bogus",
            "k3": { "sessionId": "" }
        }));
        assert_eq!(store.session_id_for("k1"), Some("s1"));
        assert!(store.get("k2").is_none());
        assert_eq!(store.session_id_for("k3"), None);
    }

    #[test]
    fn unreadable_session_store_is_empty() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("sessions.json");
        fs::write(&path, "not json").expect("seed");
        assert!(SessionStore::load(&path).get("k1").is_none());
    }
}
