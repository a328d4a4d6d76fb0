//! `jobhunt reconcile` - one orphan reconciliation pass.
//!
//! # Exit Codes
//!
//! - 0: Pass completed (whether or not anything changed)
//! - 1: Collaborator state unreadable or a write failed; nothing was written
//! - 3: Another pass holds the reconcile lock

use jobhunt_core::reconcile::{ReconcileError, Reconciler};

use super::{CommandContext, output_error, print_json};

/// Exit codes for the reconcile command.
pub mod exit_codes {
    /// Pass completed.
    pub const SUCCESS: u8 = 0;
    /// Pass failed.
    pub const ERROR: u8 = 1;
    /// Another pass is running.
    pub const BUSY: u8 = 3;
}

pub fn run_reconcile(ctx: &CommandContext, dry_run: bool) -> u8 {
    let reconciler = Reconciler::new(ctx.config().clone());
    match reconciler.run(dry_run) {
        Ok(receipt) => {
            if ctx.json() {
                print_json(&receipt);
            } else {
                println!("{}", receipt.summary());
                for run in &receipt.runs_ended {
                    println!("  ended {} ({}): {}", run.run_id, run.label, run.reason);
                }
                for healed in &receipt.locks_healed {
                    println!("  healed apply-{}: {}", healed.lane, healed.reason);
                }
                for claim in &receipt.claims_swept {
                    println!("  swept claim {}s | {}", claim.age_secs, claim.url);
                }
            }
            exit_codes::SUCCESS
        },
        Err(ReconcileError::Busy) => output_error(
            ctx.json(),
            "busy",
            "another reconcile pass is running",
            exit_codes::BUSY,
        ),
        Err(e) => output_error(ctx.json(), "reconcile_failed", &e.to_string(), exit_codes::ERROR),
    }
}
