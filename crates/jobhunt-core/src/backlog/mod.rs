//! The shared job backlog and the documents that travel with it.
//!
//! The live backlog (`job-queue.md`) is written by several independent worker
//! processes. All access goes through [`BacklogStore`], which brackets every
//! read with a shared advisory lock and every mutation with an exclusive one.
//! Status changes happen only through the functions in [`mutate`].

pub mod archive;
pub mod dedup;
pub mod document;
pub mod mutate;
pub mod store;
pub mod tracker;
pub mod url;

use std::io;

use thiserror::Error;

pub use dedup::{DedupIndex, DedupRecord, DedupStatus, DedupVerdict, UpsertOutcome};
pub use document::{BacklogCounts, BacklogDocument, EntryStatus, JobEntry, SectionKind};
pub use store::{BacklogSnapshot, BacklogStore, Transaction};
pub use url::{LaneHint, is_valid_http_url, normalize_url, url_match_key};

/// Errors raised by backlog reads and mutations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BacklogError {
    /// Filesystem failure.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The argument is not a full http(s) URL.
    #[error("invalid url '{0}': a full http(s) url is required")]
    InvalidUrl(String),

    /// A mutation was refused because the entry is not in a state that allows
    /// it.
    #[error("refusing to {action} {url}: {reason}")]
    Refused {
        /// Mutation that was refused.
        action: &'static str,
        /// Target URL.
        url: String,
        /// Why the target state does not allow it.
        reason: String,
    },

    /// A discovery record could not be accepted.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// An entry still marked live was about to be archived.
    #[error("entry {0} is still live and cannot be archived")]
    LiveEntry(String),
}

impl BacklogError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the error is a refusal or invalid input rather than a runtime
    /// failure.
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl(_) | Self::Refused { .. } | Self::InvalidRecord(_)
        )
    }
}
