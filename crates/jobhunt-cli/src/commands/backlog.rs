//! Backlog mutation commands: `mark-applied`, `skip`, `compact`, `add`,
//! `check-dedup` and `rebuild-dedup`.
//!
//! # Exit Codes
//!
//! - 0: Success (a duplicate `add` is a success)
//! - 1: Filesystem error
//! - 2: Invalid URL or record, or a refused `mark-applied`
//!
//! The text output of `mark-applied` is read back from worker transcripts:
//! `QUEUE: Marked COMPLETED` counts as a successful application and the
//! refusal line counts as a failure.

use jobhunt_core::backlog::mutate::{
    self, DiscoveryRecord, EnqueueOutcome, MARK_APPLIED_REFUSAL, MARKED_COMPLETED_MARKER,
    TrackerChange,
};
use jobhunt_core::backlog::{BacklogError, DedupVerdict, UpsertOutcome};

use super::{CommandContext, backlog_error, exit_codes, output_error, print_json};

pub fn mark_applied(ctx: &CommandContext, url: &str, company: &str, title: &str, force: bool) -> u8 {
    let report = match mutate::mark_applied(
        &ctx.store(),
        url,
        company,
        title,
        force,
        mutate::local_now(),
    ) {
        Ok(report) => report,
        Err(BacklogError::Refused { reason, .. }) => {
            return output_error(
                ctx.json(),
                "refused",
                &format!(
                    "{MARK_APPLIED_REFUSAL} because {reason}. Re-run with --force only for manual correction."
                ),
                exit_codes::INVALID_ARGS,
            );
        },
        Err(e) => return backlog_error(ctx.json(), &e),
    };
    if ctx.json() {
        print_json(&report);
        return exit_codes::SUCCESS;
    }
    if report.archived > 0 {
        println!("{MARKED_COMPLETED_MARKER}");
    } else {
        println!("QUEUE: Not PENDING or not found");
    }
    match report.dedup {
        UpsertOutcome::Inserted | UpsertOutcome::Updated => println!("DEDUP: Updated to APPLIED"),
        UpsertOutcome::Unchanged => println!("DEDUP: Already APPLIED"),
    }
    match report.tracker {
        TrackerChange::Added => println!("TRACKER: Added entry"),
        TrackerChange::AlreadyPresent => println!("TRACKER: Already exists"),
        TrackerChange::Missing => println!("TRACKER: File not found, skipping"),
    }
    println!("DONE: {} — {}", report.company, report.title);
    exit_codes::SUCCESS
}

pub fn skip(ctx: &CommandContext, url: &str, reason: &str) -> u8 {
    match mutate::skip(&ctx.store(), url, reason, mutate::local_now()) {
        Ok(report) => {
            if ctx.json() {
                print_json(&report);
            } else {
                if report.archived > 0 {
                    println!("REMOVED: {}", report.url);
                } else {
                    println!("NOT FOUND in queue: {}", report.url);
                }
                println!("DEDUP: Marked SKIPPED");
            }
            exit_codes::SUCCESS
        },
        Err(e) => backlog_error(ctx.json(), &e),
    }
}

pub fn compact(ctx: &CommandContext) -> u8 {
    match mutate::compact(&ctx.store(), mutate::local_now()) {
        Ok(report) => {
            if ctx.json() {
                print_json(&report);
            } else if report.archived() == 0 {
                println!("Nothing to compact ({} entries live)", report.live());
            } else {
                println!(
                    "COMPACTED: {} -> {} live (archived {} completed, {} skipped)",
                    report.before,
                    report.live(),
                    report.archived_completed,
                    report.archived_skipped
                );
            }
            exit_codes::SUCCESS
        },
        Err(e) => backlog_error(ctx.json(), &e),
    }
}

pub fn add(ctx: &CommandContext, raw: &str) -> u8 {
    let record: DiscoveryRecord = match serde_json::from_str(raw) {
        Ok(record) => record,
        Err(e) => {
            return output_error(
                ctx.json(),
                "invalid_json",
                &format!("Invalid JSON: {e}"),
                exit_codes::INVALID_ARGS,
            );
        },
    };
    let no_auto = &ctx.config().dispatch.no_auto_companies;
    match mutate::enqueue(&ctx.store(), &record, no_auto, mutate::local_now()) {
        Ok(outcome) => {
            if ctx.json() {
                print_json(&outcome);
            } else {
                match outcome {
                    EnqueueOutcome::Added { pending, .. } => println!(
                        "ADDED [{}] {} — {} ({pending} pending)",
                        record.score, record.company, record.title
                    ),
                    EnqueueOutcome::Duplicate { source } => println!(
                        "DUPLICATE — {} — {} already in {source}",
                        record.company, record.title
                    ),
                }
            }
            exit_codes::SUCCESS
        },
        Err(e) => backlog_error(ctx.json(), &e),
    }
}

pub fn check_dedup(ctx: &CommandContext, url: &str, company: &str, title: &str) -> u8 {
    match mutate::check_dedup(&ctx.store(), url, company, title) {
        Ok(verdict) => {
            if ctx.json() {
                print_json(&verdict);
            } else {
                match verdict {
                    DedupVerdict::New => println!("NEW"),
                    DedupVerdict::Duplicate { record } => println!("DUPLICATE {record}"),
                }
            }
            exit_codes::SUCCESS
        },
        Err(e) => backlog_error(ctx.json(), &e),
    }
}

pub fn rebuild_dedup(ctx: &CommandContext) -> u8 {
    match mutate::merge_dedup(&ctx.store()) {
        Ok(report) => {
            if ctx.json() {
                print_json(&report);
            } else {
                println!(
                    "DEDUP: rebuilt {} -> {} records",
                    report.before, report.after
                );
            }
            exit_codes::SUCCESS
        },
        Err(e) => backlog_error(ctx.json(), &e),
    }
}
