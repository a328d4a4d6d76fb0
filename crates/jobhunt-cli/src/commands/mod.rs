//! CLI command implementations.
//!
//! Every command returns a `u8` exit code. Results go to stdout (text, or
//! JSON with `--json`); diagnostics go to stderr.

use jobhunt_core::backlog::{BacklogError, BacklogStore};
use jobhunt_core::claim::ClaimRegistry;
use jobhunt_core::config::JobhuntConfig;
use jobhunt_core::lane_lock::LaneLockManager;
use jobhunt_core::layout::WorkspaceLayout;
use jobhunt_core::reconcile::liveness::{LivenessThresholds, RegistryLivenessOracle};
use serde::Serialize;

pub mod backlog;
pub mod claim;
pub mod dispatch;
pub mod lock;
pub mod reconcile;

/// Exit codes shared by every command.
pub mod exit_codes {
    /// Success, including expected no-ops.
    pub const SUCCESS: u8 = 0;
    /// Runtime failure (I/O, unreadable collaborator state).
    pub const ERROR: u8 = 1;
    /// Invalid input or a refused unsafe operation.
    pub const INVALID_ARGS: u8 = 2;
}

/// Resolved configuration plus output mode.
#[derive(Debug)]
pub struct CommandContext {
    config: JobhuntConfig,
    layout: WorkspaceLayout,
    json: bool,
}

impl CommandContext {
    pub fn new(config: JobhuntConfig, json: bool) -> Self {
        Self {
            layout: WorkspaceLayout::new(config.paths.workspace.clone()),
            config,
            json,
        }
    }

    pub const fn config(&self) -> &JobhuntConfig {
        &self.config
    }

    pub const fn json(&self) -> bool {
        self.json
    }

    pub fn store(&self) -> BacklogStore {
        BacklogStore::new(
            self.layout.clone(),
            self.config.dispatch.no_auto_companies.clone(),
        )
    }

    pub fn claims(&self) -> ClaimRegistry {
        ClaimRegistry::new(
            self.layout.claims_dir.clone(),
            self.layout.claims_lock.clone(),
            self.config.claims.ttl_secs,
        )
    }

    /// Lane locks corroborated against the run registry on disk.
    pub fn locks(&self) -> LaneLockManager<RegistryLivenessOracle> {
        let paths = &self.config.paths;
        let mut known_lanes: Vec<String> = self
            .config
            .dispatch
            .lanes
            .iter()
            .chain(self.config.lanes.ttl_secs.keys())
            .cloned()
            .collect();
        known_lanes.sort();
        known_lanes.dedup();
        let oracle = RegistryLivenessOracle::new(
            paths.runs_registry.clone(),
            paths.session_store.clone(),
            paths.session_dir.clone(),
            known_lanes,
            LivenessThresholds::for_lanes(&self.config.lanes),
        );
        LaneLockManager::new(
            self.layout.locks_dir.clone(),
            self.config.lanes.clone(),
            oracle,
        )
    }
}

/// Machine-readable error body.
#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    code: &'a str,
    message: &'a str,
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    );
}

/// Report an error and return `exit_code`.
pub fn output_error(json_output: bool, code: &str, message: &str, exit_code: u8) -> u8 {
    if json_output {
        let error = ErrorResponse { code, message };
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&error).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        eprintln!("ERROR: {message}");
    }
    exit_code
}

/// Exit code for a backlog error: rejections are the caller's fault.
pub fn backlog_error(json_output: bool, error: &BacklogError) -> u8 {
    if error.is_rejection() {
        output_error(
            json_output,
            "rejected",
            &error.to_string(),
            exit_codes::INVALID_ARGS,
        )
    } else {
        output_error(json_output, "backlog_error", &error.to_string(), exit_codes::ERROR)
    }
}
