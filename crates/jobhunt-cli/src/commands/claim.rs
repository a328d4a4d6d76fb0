//! `jobhunt claim`, `release` and `list-claims`.
//!
//! # Exit Codes
//!
//! - 0: Success (`CLAIMED_BY_OTHER` and `NOT_FOUND` are answers, not errors)
//! - 1: Filesystem error
//! - 2: Empty URL

use jobhunt_core::claim::{ClaimError, ClaimOutcome};
use serde::Serialize;

use super::{CommandContext, exit_codes, output_error, print_json};

#[derive(Debug, Serialize)]
struct ReleaseResponse<'a> {
    url: &'a str,
    outcome: &'static str,
}

fn claim_error(json_output: bool, error: &ClaimError) -> u8 {
    match error {
        ClaimError::EmptyUrl => output_error(
            json_output,
            "invalid_url",
            &error.to_string(),
            exit_codes::INVALID_ARGS,
        ),
        _ => output_error(json_output, "claim_error", &error.to_string(), exit_codes::ERROR),
    }
}

pub fn claim(ctx: &CommandContext, url: &str) -> u8 {
    match ctx.claims().claim(url) {
        Ok(outcome) => {
            if ctx.json() {
                print_json(&outcome);
            } else {
                println!("{}", outcome.as_str());
            }
            if let ClaimOutcome::ClaimedByOther { age_secs, .. } = outcome {
                tracing::debug!(url, age_secs, "claim held by another worker");
            }
            exit_codes::SUCCESS
        },
        Err(e) => claim_error(ctx.json(), &e),
    }
}

pub fn release(ctx: &CommandContext, url: &str) -> u8 {
    match ctx.claims().release(url) {
        Ok(outcome) => {
            if ctx.json() {
                print_json(&ReleaseResponse {
                    url,
                    outcome: outcome.as_str(),
                });
            } else {
                println!("{}", outcome.as_str());
            }
            exit_codes::SUCCESS
        },
        Err(e) => claim_error(ctx.json(), &e),
    }
}

pub fn list(ctx: &CommandContext) -> u8 {
    let claims = match ctx.claims().list() {
        Ok(claims) => claims,
        Err(e) => return claim_error(ctx.json(), &e),
    };
    if ctx.json() {
        print_json(&claims);
    } else if claims.is_empty() {
        println!("No active claims");
    } else {
        for info in &claims {
            let expired = if info.expired { " EXPIRED" } else { "" };
            let pid = if info.pid == 0 {
                "?".to_string()
            } else {
                info.pid.to_string()
            };
            println!("  {}s{expired} | pid={pid} | {}", info.age_secs, info.url);
        }
    }
    exit_codes::SUCCESS
}
