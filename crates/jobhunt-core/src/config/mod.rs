//! Configuration parsing and management.
//!
//! Every timing constant the coordination layer uses (lane TTLs, claim TTL,
//! grace periods, heartbeat timeouts, transcript windows) is read from a TOML
//! file so operators can tune them without a rebuild. All fields default to the
//! values the pipeline has been running with, so an absent file is valid.
//!
//! ```toml
//! [paths]
//! workspace = "/srv/jobhunt"
//!
//! [lanes]
//! default_ttl_secs = 1200
//!
//! [lanes.ttl_secs]
//! greenhouse = 2700
//!
//! [claims]
//! ttl_secs = 2400
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::lane_lock::validate_lane_name;

/// Environment variable overriding the jobhunt home directory.
pub const HOME_ENV_VAR: &str = "JOBHUNT_HOME";

/// Name of the configuration file inside the home directory.
pub const CONFIG_FILE_NAME: &str = "jobhunt.toml";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct JobhuntConfig {
    /// Filesystem locations of owned and collaborator-owned documents.
    pub paths: PathsConfig,
    /// Lane lock TTLs and lock-side liveness thresholds.
    pub lanes: LanesConfig,
    /// Job claim lease settings.
    pub claims: ClaimsConfig,
    /// Orphan reconciler thresholds.
    pub reconcile: ReconcileConfig,
    /// Transcript guardrail settings.
    pub guard: GuardConfig,
    /// Dispatch snapshot settings.
    pub dispatch: DispatchConfig,
}

/// Filesystem layout.
///
/// Relative paths are resolved against the home directory by
/// [`JobhuntConfig::resolve_paths`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the backlog, dedup index, tracker and lock files.
    pub workspace: PathBuf,
    /// Run registry owned by the worker supervisor.
    pub runs_registry: PathBuf,
    /// Session metadata store owned by the worker supervisor.
    pub session_store: PathBuf,
    /// Directory containing `<session-id>.jsonl` transcripts.
    pub session_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("workspace"),
            runs_registry: PathBuf::from("subagents/runs.json"),
            session_store: PathBuf::from("sessions/sessions.json"),
            session_dir: PathBuf::from("sessions"),
        }
    }
}

/// Lane lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanesConfig {
    /// Per-lane TTL overrides in seconds.
    pub ttl_secs: BTreeMap<String, u64>,
    /// TTL for lanes without an override.
    pub default_ttl_secs: u64,
    /// Minimum lock age before the orphan cross-check may clear it.
    pub orphan_grace_secs: u64,
    /// Heartbeat age after which a run no longer corroborates a lock.
    pub heartbeat_timeout_secs: u64,
}

impl Default for LanesConfig {
    fn default() -> Self {
        let ttl_secs = [
            ("ashby", 15 * 60),
            ("ashby2", 15 * 60),
            ("greenhouse", 45 * 60),
            ("lever", 15 * 60),
        ]
        .into_iter()
        .map(|(lane, ttl)| (lane.to_string(), ttl))
        .collect();
        Self {
            ttl_secs,
            default_ttl_secs: 20 * 60,
            orphan_grace_secs: 90,
            heartbeat_timeout_secs: 10 * 60,
        }
    }
}

impl LanesConfig {
    /// TTL in seconds for `lane`.
    pub fn ttl_for(&self, lane: &str) -> u64 {
        self.ttl_secs
            .get(lane)
            .copied()
            .unwrap_or(self.default_ttl_secs)
    }

    /// Largest TTL any lane can have; used as the run stale ceiling for lock
    /// corroboration.
    pub fn max_ttl(&self) -> u64 {
        self.ttl_secs
            .values()
            .copied()
            .max()
            .unwrap_or(self.default_ttl_secs)
    }
}

/// Claim registry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimsConfig {
    /// Claim lease length. Must exceed the longest worker session.
    pub ttl_secs: u64,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self { ttl_secs: 40 * 60 }
    }
}

/// Orphan reconciler thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Startup grace period before heartbeat staleness counts.
    pub grace_secs: u64,
    /// Heartbeat age after which a run is abandoned.
    pub heartbeat_timeout_secs: u64,
    /// Absolute run age after which a run is abandoned regardless of
    /// heartbeat.
    pub stale_secs: u64,
    /// Only transcripts modified within this window are scanned.
    pub transcript_window_secs: u64,
    /// Upper bound on tracked transcript files.
    pub max_tracked_transcripts: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            grace_secs: 90,
            heartbeat_timeout_secs: 180,
            stale_secs: 20 * 60,
            transcript_window_secs: 18 * 3600,
            max_tracked_transcripts: 300,
        }
    }
}

/// Guardrail settings for transcript scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Helper script paths (relative to the workspace, or absolute) that
    /// subagents are allowed to use for form filling.
    pub canonical_helper_paths: Vec<PathBuf>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            canonical_helper_paths: ["ashby", "greenhouse", "lever"]
                .into_iter()
                .map(|lane| PathBuf::from(format!("skills/apply-{lane}/scripts/form-filler.js")))
                .collect(),
        }
    }
}

/// Dispatch snapshot settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Lanes reported by the dispatch snapshot, in order.
    pub lanes: Vec<String>,
    /// Lanes that are configured but currently disabled by policy.
    pub disabled_lanes: Vec<String>,
    /// Companies that are never auto-applied to (matched case-insensitively).
    pub no_auto_companies: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lanes: vec![
                "ashby".to_string(),
                "greenhouse".to_string(),
                "lever".to_string(),
            ],
            disabled_lanes: Vec::new(),
            no_auto_companies: ["openai", "databricks", "pinterest", "deepmind", "google deepmind"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

impl JobhuntConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Load `path` if it exists, otherwise return the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be parsed or validated.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check semantic constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("lanes.default_ttl_secs", self.lanes.default_ttl_secs),
            ("lanes.heartbeat_timeout_secs", self.lanes.heartbeat_timeout_secs),
            ("claims.ttl_secs", self.claims.ttl_secs),
            ("reconcile.heartbeat_timeout_secs", self.reconcile.heartbeat_timeout_secs),
            ("reconcile.stale_secs", self.reconcile.stale_secs),
            ("reconcile.transcript_window_secs", self.reconcile.transcript_window_secs),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{field} must be positive")));
            }
        }
        for (lane, ttl) in &self.lanes.ttl_secs {
            validate_lane_name(lane)
                .map_err(|e| ConfigError::Validation(format!("lanes.ttl_secs: {e}")))?;
            if *ttl == 0 {
                return Err(ConfigError::Validation(format!(
                    "lanes.ttl_secs.{lane} must be positive"
                )));
            }
        }
        for lane in self.dispatch.lanes.iter().chain(&self.dispatch.disabled_lanes) {
            validate_lane_name(lane)
                .map_err(|e| ConfigError::Validation(format!("dispatch: {e}")))?;
        }
        if self.reconcile.max_tracked_transcripts == 0 {
            return Err(ConfigError::Validation(
                "reconcile.max_tracked_transcripts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve relative paths against `home`.
    #[must_use]
    pub fn resolve_paths(mut self, home: &Path) -> Self {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = home.join(&*p);
            }
        };
        resolve(&mut self.paths.workspace);
        resolve(&mut self.paths.runs_registry);
        resolve(&mut self.paths.session_store);
        resolve(&mut self.paths.session_dir);
        self
    }
}

/// Resolve the jobhunt home directory.
///
/// Checks `$JOBHUNT_HOME` first, then falls back to `~/.jobhunt`.
///
/// # Errors
///
/// Returns [`ConfigError::HomeResolution`] when no home directory can be
/// determined.
pub fn jobhunt_home_dir() -> Result<PathBuf, ConfigError> {
    if let Some(override_dir) = std::env::var_os(HOME_ENV_VAR) {
        let path = PathBuf::from(override_dir);
        if !path.as_os_str().is_empty() {
            return Ok(path);
        }
    }
    let base_dirs = directories::BaseDirs::new().ok_or_else(|| {
        ConfigError::HomeResolution("could not resolve home directory".to_string())
    })?;
    Ok(base_dirs.home_dir().join(".jobhunt"))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),

    /// Home directory could not be determined.
    #[error("cannot resolve jobhunt home directory: {0}")]
    HomeResolution(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_pipeline_defaults() {
        let config = JobhuntConfig::from_toml("").expect("empty config");
        assert_eq!(config.lanes.ttl_for("ashby"), 900);
        assert_eq!(config.lanes.ttl_for("greenhouse"), 2700);
        assert_eq!(config.lanes.ttl_for("lever"), 900);
        assert_eq!(config.lanes.ttl_for("workday"), 1200);
        assert_eq!(config.lanes.max_ttl(), 2700);
        assert_eq!(config.lanes.orphan_grace_secs, 90);
        assert_eq!(config.claims.ttl_secs, 2400);
        assert_eq!(config.reconcile.heartbeat_timeout_secs, 180);
        assert_eq!(config.reconcile.stale_secs, 1200);
        assert_eq!(config.reconcile.max_tracked_transcripts, 300);
    }

    #[test]
    fn lane_ttl_overrides_merge_over_nothing() {
        let config = JobhuntConfig::from_toml(
            r#"
            [lanes]
            default_ttl_secs = 600

            [lanes.ttl_secs]
            workday = 3600
            "#,
        )
        .expect("parse");
        assert_eq!(config.lanes.ttl_for("workday"), 3600);
        // An explicit table replaces the default map entirely.
        assert_eq!(config.lanes.ttl_for("greenhouse"), 600);
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let err = JobhuntConfig::from_toml("[claims]\nttl_secs = 0\n").expect_err("zero ttl");
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("claims.ttl_secs")));
    }

    #[test]
    fn invalid_lane_name_is_rejected() {
        let err = JobhuntConfig::from_toml("[lanes.ttl_secs]\n\"../etc\" = 60\n")
            .expect_err("traversal lane");
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn unknown_toml_is_a_parse_error() {
        let err = JobhuntConfig::from_toml("[claims\n").expect_err("bad toml");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn relative_paths_resolve_against_home() {
        let home = Path::new("/tmp/jh-home");
        let config = JobhuntConfig::from_toml("[paths]\nsession_dir = \"/abs/sessions\"\n")
            .expect("parse")
            .resolve_paths(home);
        assert_eq!(config.paths.workspace, home.join("workspace"));
        assert_eq!(config.paths.runs_registry, home.join("subagents/runs.json"));
        assert_eq!(config.paths.session_dir, PathBuf::from("/abs/sessions"));
    }

    #[test]
    fn missing_file_loads_defaults_and_round_trips() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = JobhuntConfig::load_or_default(&path).expect("defaults");
        assert_eq!(config, JobhuntConfig::default());

        std::fs::write(&path, config.to_toml().expect("serialize")).expect("write");
        assert_eq!(JobhuntConfig::from_file(&path).expect("reload"), config);
    }
}
