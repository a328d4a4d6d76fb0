//! Operating rules for subagent sessions, checked against transcript tool
//! calls.
//!
//! Rules only apply once a session has identified itself as a subagent (a
//! non-cron user message matching the subagent prompt). Violations are
//! deduplicated by digest and appended to `guardrails.jsonl`.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::GuardConfig;

/// Longest detail kept in a violation record.
pub const MAX_DETAIL_LENGTH: usize = 800;

/// Longest detail carried into a termination reason.
const MAX_TERMINATION_DETAIL_LENGTH: usize = 300;

static FORBIDDEN_GATEWAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bopenclaw\s+gateway\b").expect("gateway regex is valid")
});

static FORM_FILLER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)form-filler\.js").expect("form filler regex is valid"));

static SUBAGENT_PROMPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(you are a subagent|subagent-lock(?:\.py)?\s+lock\s+apply|apply to (ashby|greenhouse|lever) jobs)",
    )
    .expect("subagent prompt regex is valid")
});

/// A guard rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardRule {
    /// Subagent tried to drive the gateway.
    ForbiddenGatewayCommand,
    /// Form filler loaded from outside the canonical helper paths.
    NonCanonicalFormFillerPath,
    /// Browser request passed as a JSON string.
    BrowserRequestStringified,
    /// Inline evaluate script that reimplements the form filler.
    NonCanonicalFormFillerScript,
}

impl GuardRule {
    /// Stable rule identifier.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ForbiddenGatewayCommand => "FORBIDDEN_GATEWAY_COMMAND",
            Self::NonCanonicalFormFillerPath => "NON_CANONICAL_FORM_FILLER_PATH",
            Self::BrowserRequestStringified => "BROWSER_REQUEST_STRINGIFIED",
            Self::NonCanonicalFormFillerScript => "NON_CANONICAL_FORM_FILLER_SCRIPT",
        }
    }

    /// Whether a violation force-ends the session's apply run.
    pub const fn terminates_run(self) -> bool {
        !matches!(self, Self::NonCanonicalFormFillerScript)
    }
}

impl fmt::Display for GuardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session guard flags, persisted in the watch state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionGuard {
    /// The session identified itself as a subagent.
    pub is_subagent: bool,
    /// A canonical form filler was read or executed.
    pub canonical_form_filler_seen: bool,
    /// Last scan that saw activity (epoch seconds).
    pub last_seen_ts: u64,
}

/// A rule hit before deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHit {
    /// Rule broken.
    pub rule: GuardRule,
    /// Offending command, path or description.
    pub detail: String,
}

/// A recorded violation, one line of `guardrails.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardViolation {
    /// When it was recorded (RFC 3339).
    pub timestamp_iso: String,
    /// Transcript id.
    pub session_id: String,
    /// Transcript file name.
    pub session_file: String,
    /// Rule broken.
    pub rule: GuardRule,
    /// Offending command, path or description.
    pub detail: String,
}

impl GuardViolation {
    /// Build a violation record stamped `now`.
    pub fn new(session_id: &str, session_file: &str, hit: &RuleHit, now: f64) -> Self {
        let timestamp_iso = DateTime::<Utc>::from_timestamp(now as i64, 0)
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        Self {
            timestamp_iso,
            session_id: session_id.to_string(),
            session_file: session_file.to_string(),
            rule: hit.rule,
            detail: truncate(&hit.detail, MAX_DETAIL_LENGTH),
        }
    }

    /// Reason written into the run outcome when this violation ends a run.
    pub fn termination_reason(&self) -> String {
        format!(
            "{}: {}",
            self.rule,
            truncate(&self.detail, MAX_TERMINATION_DETAIL_LENGTH)
        )
    }
}

/// Dedup digest of a violation.
pub fn violation_digest(session_id: &str, rule: GuardRule, detail: &str) -> String {
    let input = format!("{session_id}|{rule}|{detail}");
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Whether a user message marks its session as a subagent. Cron-triggered
/// messages never do.
pub fn is_subagent_prompt(text: &str) -> bool {
    !text.trim_start().to_ascii_lowercase().starts_with("[cron:") && SUBAGENT_PROMPT_RE.is_match(text)
}

/// Lexical normalization: drops `.` and resolves `..` without touching the
/// filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(base) = directories::BaseDirs::new() {
            return base.home_dir().join(rest);
        }
    }
    PathBuf::from(raw)
}

fn string_arg<'a>(arguments: &'a Value, keys: &[&str]) -> Option<&'a str> {
    let obj = arguments.as_object()?;
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
}

/// Checks tool calls against the guard rules.
#[derive(Debug, Clone)]
pub struct Guard {
    workspace: PathBuf,
    canonical: BTreeSet<PathBuf>,
}

impl Guard {
    /// Guard resolving relative helper paths against `workspace`.
    pub fn new(workspace: &Path, config: &GuardConfig) -> Self {
        let canonical = config
            .canonical_helper_paths
            .iter()
            .map(|p| normalize_path(&workspace.join(p)))
            .collect();
        Self {
            workspace: workspace.to_path_buf(),
            canonical,
        }
    }

    /// Whether `raw` (possibly quoted, relative or `~`-prefixed) names a
    /// canonical helper.
    pub fn is_canonical_path(&self, raw: &str) -> bool {
        let trimmed = raw.trim().trim_matches(['"', '\'']);
        if trimmed.is_empty() {
            return false;
        }
        let expanded = expand_home(trimmed);
        let candidate = if expanded.is_absolute() {
            normalize_path(&expanded)
        } else {
            normalize_path(&self.workspace.join(expanded))
        };
        self.canonical.contains(&candidate)
    }

    fn command_uses_canonical(&self, command: &str) -> bool {
        command
            .split_whitespace()
            .any(|token| FORM_FILLER_RE.is_match(token) && self.is_canonical_path(token))
    }

    /// Inspect one tool call, updating `session` flags. Returns every rule
    /// the call breaks.
    pub fn inspect(&self, tool: &str, arguments: &Value, session: &mut SessionGuard) -> Vec<RuleHit> {
        let mut hits = Vec::new();
        let mut hit = |rule, detail: &str| {
            hits.push(RuleHit {
                rule,
                detail: detail.to_string(),
            });
        };
        match tool {
            "read" => {
                let Some(path) = string_arg(arguments, &["file_path", "path"]) else {
                    return Vec::new();
                };
                if FORM_FILLER_RE.is_match(path) {
                    if self.is_canonical_path(path) {
                        session.canonical_form_filler_seen = true;
                    } else if session.is_subagent {
                        hit(GuardRule::NonCanonicalFormFillerPath, path);
                    }
                }
            },
            "exec" => {
                let Some(command) =
                    string_arg(arguments, &["command", "cmd"]).filter(|c| !c.is_empty())
                else {
                    return Vec::new();
                };
                if FORM_FILLER_RE.is_match(command) {
                    if self.command_uses_canonical(command) {
                        session.canonical_form_filler_seen = true;
                    } else if session.is_subagent {
                        hit(GuardRule::NonCanonicalFormFillerPath, command);
                    }
                }
                if session.is_subagent && FORBIDDEN_GATEWAY_RE.is_match(command) {
                    hit(GuardRule::ForbiddenGatewayCommand, command);
                }
            },
            "browser" if session.is_subagent => {
                if browser_request_is_stringified(arguments) {
                    hit(
                        GuardRule::BrowserRequestStringified,
                        "browser request was a JSON string (expected object request={...})",
                    );
                } else if evaluate_script(arguments).is_some_and(looks_like_form_filler)
                    && !session.canonical_form_filler_seen
                {
                    hit(
                        GuardRule::NonCanonicalFormFillerScript,
                        "evaluate script looked like full form filler without canonical path read",
                    );
                }
            },
            _ => {},
        }
        hits
    }
}

fn browser_request_is_stringified(arguments: &Value) -> bool {
    arguments
        .get("request")
        .and_then(Value::as_str)
        .is_some_and(|request| {
            let payload = request.trim().to_ascii_lowercase();
            payload.contains("\"kind\"") && payload.contains("evaluate")
        })
}

fn evaluate_script(arguments: &Value) -> Option<&str> {
    if !arguments.is_object() {
        return None;
    }
    let request = arguments
        .get("request")
        .filter(|r| r.is_object())
        .unwrap_or(arguments);
    if request.get("kind").and_then(Value::as_str) != Some("evaluate") {
        return None;
    }
    request
        .get("script")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| request.get("fn").and_then(Value::as_str))
}

fn looks_like_form_filler(script: &str) -> bool {
    let lower = script.to_ascii_lowercase();
    lower.contains("const profile") && (lower.contains("detectats") || lower.contains("firstname"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn guard() -> Guard {
        Guard::new(Path::new("/ws"), &GuardConfig::default())
    }

    fn subagent() -> SessionGuard {
        SessionGuard {
            is_subagent: true,
            ..SessionGuard::default()
        }
    }

    #[test]
    fn subagent_prompt_detection_ignores_cron() {
        assert!(is_subagent_prompt("You are a subagent. Apply to Lever jobs."));
        assert!(is_subagent_prompt("first run subagent-lock.py lock apply lever"));
        assert!(!is_subagent_prompt("[cron:abc] you are a subagent"));
        assert!(!is_subagent_prompt("summarize the queue"));
    }

    #[test]
    fn canonical_paths_resolve_relative_and_dotted_forms() {
        let g = guard();
        assert!(g.is_canonical_path("skills/apply-lever/scripts/form-filler.js"));
        assert!(g.is_canonical_path("'/ws/skills/apply-ashby/./scripts/form-filler.js'"));
        assert!(g.is_canonical_path("/ws/tmp/../skills/apply-greenhouse/scripts/form-filler.js"));
        assert!(!g.is_canonical_path("/tmp/form-filler.js"));
        assert!(!g.is_canonical_path(""));
    }

    #[test]
    fn reads_outside_canonical_paths_flag_subagents_only() {
        let g = guard();
        let args = json!({ "file_path": "/tmp/form-filler.js" });

        let mut orchestrator = SessionGuard::default();
        assert!(g.inspect("read", &args, &mut orchestrator).is_empty());

        let mut session = subagent();
        let hits = g.inspect("read", &args, &mut session);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rule, GuardRule::NonCanonicalFormFillerPath);

        let canonical = json!({ "path": "skills/apply-lever/scripts/form-filler.js" });
        assert!(g.inspect("read", &canonical, &mut session).is_empty());
        assert!(session.canonical_form_filler_seen);
    }

    #[test]
    fn gateway_commands_are_forbidden() {
        let g = guard();
        let mut session = subagent();
        let hits = g.inspect(
            "exec",
            &json!({ "command": "pnpm openclaw  Gateway restart" }),
            &mut session,
        );
        assert_eq!(
            hits.iter().map(|h| h.rule).collect::<Vec<_>>(),
            vec![GuardRule::ForbiddenGatewayCommand]
        );
        assert!(GuardRule::ForbiddenGatewayCommand.terminates_run());
    }

    #[test]
    fn exec_of_canonical_helper_is_allowed() {
        let g = guard();
        let mut session = subagent();
        let hits = g.inspect(
            "exec",
            &json!({ "cmd": "node skills/apply-ashby/scripts/form-filler.js --url x" }),
            &mut session,
        );
        assert!(hits.is_empty());
        assert!(session.canonical_form_filler_seen);

        let hits = g.inspect(
            "exec",
            &json!({ "cmd": "node /tmp/form-filler.js" }),
            &mut session,
        );
        assert_eq!(hits[0].rule, GuardRule::NonCanonicalFormFillerPath);
    }

    #[test]
    fn browser_rules() {
        let g = guard();
        let mut session = subagent();
        let stringified = json!({ "request": "{\"kind\": \"evaluate\", \"fn\": \"x\"}" });
        assert_eq!(
            g.inspect("browser", &stringified, &mut session)[0].rule,
            GuardRule::BrowserRequestStringified
        );

        let filler = json!({ "request": {
            "kind": "evaluate",
            "script": "const profile = {}; document.querySelector('#firstName')" } });
        let hits = g.inspect("browser", &filler, &mut session);
        assert_eq!(hits[0].rule, GuardRule::NonCanonicalFormFillerScript);
        assert!(!hits[0].rule.terminates_run());

        session.canonical_form_filler_seen = true;
        assert!(g.inspect("browser", &filler, &mut session).is_empty());
    }

    #[test]
    fn violation_records_truncate_and_digest_is_stable() {
        let hit = RuleHit {
            rule: GuardRule::ForbiddenGatewayCommand,
            detail: "x".repeat(1000),
        };
        let v = GuardViolation::new("s1", "s1.jsonl", &hit, 0.0);
        assert_eq!(v.detail.len(), MAX_DETAIL_LENGTH);
        assert_eq!(v.timestamp_iso, "1970-01-01T00:00:00Z");
        assert_eq!(
            v.termination_reason().len(),
            "FORBIDDEN_GATEWAY_COMMAND: ".len() + 300
        );
        assert_eq!(
            violation_digest("s1", hit.rule, "d"),
            violation_digest("s1", hit.rule, "d")
        );
        assert_ne!(
            violation_digest("s1", hit.rule, "d"),
            violation_digest("s2", hit.rule, "d")
        );
    }
}
