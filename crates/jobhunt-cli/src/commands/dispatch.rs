//! `jobhunt dispatch-status` - per-lane readiness for the scheduler.
//!
//! # Exit Codes
//!
//! - 0: Snapshot printed (even when no lane is ready)
//! - 1: Backlog, lock or claim state unreadable

use jobhunt_core::dispatch::dispatch_snapshot;
use jobhunt_core::fsio;

use super::{CommandContext, exit_codes, output_error, print_json};

pub fn run_dispatch_status(ctx: &CommandContext) -> u8 {
    let snapshot = dispatch_snapshot(
        &ctx.store(),
        &ctx.locks(),
        &ctx.claims(),
        &ctx.config().dispatch,
        fsio::now_epoch_secs(),
    );
    match snapshot {
        Ok(snapshot) => {
            if ctx.json() {
                print_json(&snapshot);
            } else {
                println!("{snapshot}");
            }
            exit_codes::SUCCESS
        },
        Err(e) => output_error(ctx.json(), "dispatch_failed", &e.to_string(), exit_codes::ERROR),
    }
}
