//! `jobhunt lock` - lane lock commands.
//!
//! # Exit Codes
//!
//! - 0: Success (a `LOCKED` answer from `check` is a success)
//! - 1: Filesystem error
//! - 2: Invalid lane name

use clap::Subcommand;
use jobhunt_core::lane_lock::{LaneCheck, LaneLockError};
use serde::Serialize;

use super::{CommandContext, exit_codes, output_error, print_json};

/// Lane lock subcommands.
#[derive(Debug, Subcommand)]
pub enum LockCommand {
    /// Report whether the lane is held, healing orphaned or expired locks
    Check {
        /// Lane name (e.g. ashby, greenhouse, lever)
        lane: String,
    },
    /// Take the lane lock, replacing any existing one
    Acquire {
        /// Lane name
        lane: String,
    },
    /// Remove the lane lock
    Release {
        /// Lane name
        lane: String,
    },
}

#[derive(Debug, Serialize)]
struct CheckResponse<'a> {
    lane: &'a str,
    #[serde(flatten)]
    check: LaneCheck,
}

#[derive(Debug, Serialize)]
struct AcquireResponse<'a> {
    lane: &'a str,
    acquired_at: f64,
    ttl_secs: u64,
}

#[derive(Debug, Serialize)]
struct ReleaseResponse<'a> {
    lane: &'a str,
    released: bool,
}

pub fn run_lock(cmd: &LockCommand, ctx: &CommandContext) -> u8 {
    let locks = ctx.locks();
    let result = match cmd {
        LockCommand::Check { lane } => locks.check(lane).map(|check| {
            if ctx.json() {
                print_json(&CheckResponse { lane, check });
            } else {
                println!("{check}");
            }
        }),
        LockCommand::Acquire { lane } => locks.acquire(lane).map(|lock| {
            if ctx.json() {
                print_json(&AcquireResponse {
                    lane,
                    acquired_at: lock.acquired_at,
                    ttl_secs: lock.ttl_secs,
                });
            } else {
                println!("LOCKED apply-{lane}");
            }
        }),
        LockCommand::Release { lane } => locks.release(lane).map(|released| {
            if ctx.json() {
                print_json(&ReleaseResponse { lane, released });
            } else if released {
                println!("UNLOCKED apply-{lane}");
            } else {
                println!("UNLOCKED (no lock existed)");
            }
        }),
    };
    match result {
        Ok(()) => exit_codes::SUCCESS,
        Err(e @ LaneLockError::InvalidLane(_)) => output_error(
            ctx.json(),
            "invalid_lane",
            &e.to_string(),
            exit_codes::INVALID_ARGS,
        ),
        Err(e) => output_error(ctx.json(), "lock_error", &e.to_string(), exit_codes::ERROR),
    }
}
