//! The only code paths that change an entry's status.
//!
//! Every mutator runs inside one [`BacklogStore::transaction`], so the read of
//! the live backlog, the side-document updates and the rewrite all happen
//! under the same exclusive lock. Each mutator is idempotent: re-running it
//! after success changes nothing.

use std::collections::HashSet;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::archive::ArchiveBatch;
use super::dedup::{DedupIndex, DedupRecord, DedupStatus, DedupVerdict, UpsertOutcome};
use super::BacklogError;
use super::document::{
    BacklogDocument, Block, EntryStatus, IN_PROGRESS_HEADING, JobEntry, PENDING_HEADING,
    SectionKind, field_value,
};
use super::store::{BacklogStore, Transaction};
use super::url::{is_valid_http_url, normalize_url, url_match_key};

/// Printed on a successful mark-applied; transcripts are scanned for it.
pub const MARKED_COMPLETED_MARKER: &str = "QUEUE: Marked COMPLETED";

/// Leading text of a mark-applied refusal; transcripts are scanned for it.
pub const MARK_APPLIED_REFUSAL: &str = "Refusing to mark APPLIED";

/// Header written at the top of a rebuilt dedup index.
pub const DEDUP_HEADER: [&str; 3] = [
    "# Dedup Index",
    "# Format: URL | Company | Title | Status | Date",
    "",
];

const NOT_LIVE_REASON: &str = "URL is not in PENDING queue state";

/// Wall-clock local time, the timestamp base for archive stamps and dedup
/// dates.
pub fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

fn day(now: NaiveDateTime) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn stamp(now: NaiveDateTime) -> String {
    now.format("%Y-%m-%d %H:%M").to_string()
}

fn require_url(url: &str) -> Result<String, BacklogError> {
    if is_valid_http_url(url) {
        Ok(normalize_url(url))
    } else {
        Err(BacklogError::InvalidUrl(url.trim().to_string()))
    }
}

fn first_non_empty(preferred: &str, fallback: &str) -> String {
    if preferred.trim().is_empty() {
        fallback.trim().to_string()
    } else {
        preferred.trim().to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mark applied
// ─────────────────────────────────────────────────────────────────────────────

/// Effect on the tracker document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerChange {
    /// A new block was added.
    Added,
    /// The URL was already tracked.
    AlreadyPresent,
    /// The workspace has no tracker document.
    Missing,
}

/// Outcome of [`mark_applied`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkAppliedReport {
    /// Normalized URL.
    pub url: String,
    /// Company recorded.
    pub company: String,
    /// Title recorded.
    pub title: String,
    /// Number of backlog entries moved to the archive.
    pub archived: usize,
    /// Effect on the dedup index.
    pub dedup: UpsertOutcome,
    /// Effect on the tracker.
    pub tracker: TrackerChange,
}

/// Mark `url` as applied.
///
/// Moves the entry to the archive with `Status: COMPLETED` and an `Applied`
/// date, advances the dedup record to APPLIED and records the application in
/// the tracker. Unless `force` is set, refuses when the URL is not currently
/// pending or in progress.
///
/// # Errors
///
/// Returns [`BacklogError::InvalidUrl`] for a non-http(s) argument,
/// [`BacklogError::Refused`] when the entry is not live and `force` is unset,
/// and [`BacklogError::Io`] on filesystem failure.
pub fn mark_applied(
    store: &BacklogStore,
    url: &str,
    company: &str,
    title: &str,
    force: bool,
    now: NaiveDateTime,
) -> Result<MarkAppliedReport, BacklogError> {
    let url = require_url(url)?;
    let today = day(now);
    let key = url_match_key(&url);
    store.transaction(|tx| {
        let live = tx
            .document
            .entries()
            .any(|e| e.key() == key && e.status.is_live());
        if !live && !force {
            let recorded = tx.dedup()?.lookup(&url).map(|r| r.status.clone());
            let reason = match recorded {
                Some(status) if status.rank() >= DedupStatus::Skipped.rank() => {
                    format!("{NOT_LIVE_REASON} (dedup index has it as {status})")
                },
                _ => NOT_LIVE_REASON.to_string(),
            };
            warn!(url = %url, reason = %reason, "mark-applied refused");
            return Err(BacklogError::Refused {
                action: "mark applied",
                url: url.clone(),
                reason,
            });
        }

        let removed = tx.document.remove(&url);
        let source = removed.first();
        let company = first_non_empty(company, source.map_or("", |e| e.company.as_str()));
        let title = first_non_empty(title, source.map_or("", |e| e.title.as_str()));

        let mut leaving = Vec::with_capacity(removed.len());
        for mut entry in removed {
            entry.set_status_field(EntryStatus::Completed);
            if !entry.lines.iter().any(|l| field_value(l, "Applied").is_some()) {
                entry.push_field("Applied", &today);
            }
            leaving.push(entry);
        }
        let archived = leaving.len();
        if archived > 0 {
            stage_archive(tx, leaving, now)?;
            tx.document.refresh_stats();
        }

        let dedup = tx
            .dedup()?
            .upsert(&url, &company, &title, DedupStatus::Applied, &today);
        let tracker = match tx.tracker()? {
            Some(tracker) => {
                if tracker.add_applied(&company, &title, &url, &today) {
                    TrackerChange::Added
                } else {
                    TrackerChange::AlreadyPresent
                }
            },
            None => TrackerChange::Missing,
        };

        info!(url = %url, archived, forced = force && !live, "marked applied");
        Ok(MarkAppliedReport {
            url: url.clone(),
            company,
            title,
            archived,
            dedup,
            tracker,
        })
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Skip
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of [`skip`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipReport {
    /// Normalized URL.
    pub url: String,
    /// Number of backlog entries moved to the archive.
    pub archived: usize,
    /// Effect on the dedup index.
    pub dedup: UpsertOutcome,
}

/// Permanently pass over `url`.
///
/// Archives any backlog entries for the URL with `Status: SKIPPED` and the
/// reason, and records SKIPPED in the dedup index even when the URL was not in
/// the backlog, so discovery does not bring it back.
///
/// # Errors
///
/// Returns [`BacklogError::InvalidUrl`] for a non-http(s) argument and
/// [`BacklogError::Io`] on filesystem failure.
pub fn skip(
    store: &BacklogStore,
    url: &str,
    reason: &str,
    now: NaiveDateTime,
) -> Result<SkipReport, BacklogError> {
    let url = require_url(url)?;
    let reason = first_non_empty(reason, "manual skip");
    let today = day(now);
    store.transaction(|tx| {
        let removed = tx.document.remove(&url);
        let (company, title) = removed
            .first()
            .map(|e| (e.company.clone(), e.title.clone()))
            .unwrap_or_default();

        let mut leaving = Vec::with_capacity(removed.len());
        for mut entry in removed {
            if entry.status.is_live() {
                entry.set_status_field(EntryStatus::Skipped);
                if !entry.lines.iter().any(|l| field_value(l, "Reason").is_some()) {
                    entry.push_field("Reason", &reason);
                }
            }
            leaving.push(entry);
        }
        let archived = leaving.len();
        if archived > 0 {
            stage_archive(tx, leaving, now)?;
            tx.document.refresh_stats();
        }

        let dedup = tx
            .dedup()?
            .upsert(&url, &company, &title, DedupStatus::Skipped, &today);
        info!(url = %url, archived, reason = %reason, "skipped");
        Ok(SkipReport {
            url: url.clone(),
            archived,
            dedup,
        })
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Compact
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of [`compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactReport {
    /// Entries in the backlog before compaction.
    pub before: usize,
    /// Completed entries archived.
    pub archived_completed: usize,
    /// Skipped entries archived.
    pub archived_skipped: usize,
    /// Pending entries left live.
    pub pending: usize,
    /// In-progress entries left live.
    pub in_progress: usize,
}

impl CompactReport {
    /// Entries left in the live backlog.
    pub const fn live(&self) -> usize {
        self.pending + self.in_progress
    }

    /// Entries moved to the archive.
    pub const fn archived(&self) -> usize {
        self.archived_completed + self.archived_skipped
    }
}

/// Move every completed and skipped entry to the archive and rewrite the live
/// backlog in canonical layout.
///
/// Does nothing when no entry needs archiving.
///
/// # Errors
///
/// Returns [`BacklogError::Io`] on filesystem failure.
pub fn compact(store: &BacklogStore, now: NaiveDateTime) -> Result<CompactReport, BacklogError> {
    store.transaction(|tx| {
        let before = tx.document.entries().count();
        let mut leaving = Vec::new();
        let mut in_progress = Vec::new();
        let mut pending = Vec::new();
        let mut no_auto = Vec::new();
        for entry in tx.document.entries().cloned() {
            match entry.status {
                EntryStatus::InProgress => in_progress.push(entry),
                EntryStatus::Pending if entry.section == SectionKind::NoAuto => no_auto.push(entry),
                EntryStatus::Pending => pending.push(entry),
                EntryStatus::Completed | EntryStatus::Skipped => leaving.push(entry),
            }
        }

        let archived_completed = leaving
            .iter()
            .filter(|e| e.status == EntryStatus::Completed)
            .count();
        let report = CompactReport {
            before,
            archived_completed,
            archived_skipped: leaving.len() - archived_completed,
            pending: pending.len() + no_auto.len(),
            in_progress: in_progress.len(),
        };
        if leaving.is_empty() {
            info!(live = report.live(), "nothing to compact");
            return Ok(report);
        }

        pending.sort_by(|a, b| b.priority_score.cmp(&a.priority_score));
        let rebuilt = render_compacted(&tx.document, &report, &no_auto, &in_progress, &pending, now);
        tx.document = BacklogDocument::parse(&rebuilt);
        stage_archive(tx, leaving, now)?;
        info!(
            archived = report.archived(),
            live = report.live(),
            "backlog compacted"
        );
        Ok(report)
    })
}

/// Queue `entries` for the archive under one stamp.
///
/// Entries already archived under the same URL and status are left out. The
/// archive is appended before the backlog is rewritten, so a retry after a
/// failed rewrite would otherwise archive the same entry twice.
fn stage_archive(
    tx: &mut Transaction<'_>,
    entries: Vec<JobEntry>,
    now: NaiveDateTime,
) -> Result<(), BacklogError> {
    let archived: HashSet<(String, EntryStatus)> = tx
        .archived_entries()?
        .into_iter()
        .filter(|e| !e.url.is_empty())
        .map(|e| (e.key(), e.status))
        .collect();
    let mut batch = ArchiveBatch::default();
    for entry in entries {
        if archived.contains(&(entry.key(), entry.status)) {
            debug!(url = %entry.url, status = %entry.status, "already archived");
            continue;
        }
        batch
            .push(entry)
            .map_err(|live| BacklogError::LiveEntry(live.url))?;
    }
    tx.append_archive(batch.render(&stamp(now)));
    Ok(())
}

fn render_compacted(
    document: &BacklogDocument,
    report: &CompactReport,
    no_auto: &[JobEntry],
    in_progress: &[JobEntry],
    pending: &[JobEntry],
    now: NaiveDateTime,
) -> String {
    let mut title = None;
    let mut carried = Vec::new();
    let mut scoring = Vec::new();
    let mut no_auto_text = Vec::new();
    let mut heading = String::new();

    for block in document.blocks() {
        match block {
            Block::Heading { line, .. } => heading = line.trim().to_string(),
            Block::Text { section, line } => {
                let in_header = *section == SectionKind::Preamble || heading.contains("Queue Stats");
                if in_header {
                    if title.is_none() && line.starts_with("# ") {
                        title = Some(line.clone());
                    }
                    if line.contains("Last Search:") || line.contains("Last Application Cycle:") {
                        carried.push(line.clone());
                    }
                } else if heading.starts_with("## Scoring Formula") {
                    scoring.push(line.clone());
                } else if *section == SectionKind::NoAuto {
                    no_auto_text.push(line.clone());
                }
            },
            Block::Entry(_) => {},
        }
    }

    let mut out: Vec<String> = vec![
        title.unwrap_or_else(|| "# Job Priority Queue".to_string()),
        "## Queue Stats".to_string(),
        format!(
            "- Pending: {} | In Progress: {} | Last compaction: {}",
            report.pending,
            report.in_progress,
            stamp(now)
        ),
    ];
    out.extend(carried);
    out.push(String::new());

    let section_heading = |kind: SectionKind| {
        document.blocks().iter().find_map(|b| match b {
            Block::Heading { kind: k, line } if *k == kind => Some(line.clone()),
            _ => None,
        })
    };
    if let Some(scoring_heading) = document.blocks().iter().find_map(|b| match b {
        Block::Heading { line, .. } if line.trim().starts_with("## Scoring Formula") => {
            Some(line.clone())
        },
        _ => None,
    }) {
        out.push(scoring_heading);
        push_trimmed(&mut out, &scoring);
        out.push(String::new());
    }
    if let Some(no_auto_heading) = section_heading(SectionKind::NoAuto) {
        out.push(no_auto_heading);
        push_trimmed(&mut out, &no_auto_text);
        out.push(String::new());
        for entry in no_auto {
            out.push(entry.clean_text());
            out.push(String::new());
        }
    }

    out.push(IN_PROGRESS_HEADING.to_string());
    out.push(String::new());
    if in_progress.is_empty() {
        out.push("(none)".to_string());
        out.push(String::new());
    }
    for entry in in_progress {
        out.push(entry.clean_text());
        out.push(String::new());
    }

    out.push(PENDING_HEADING.to_string());
    out.push(String::new());
    for entry in pending {
        out.push(entry.clean_text());
        out.push(String::new());
    }

    let mut text = out.join("\n").trim_end().to_string();
    text.push('\n');
    text
}

fn push_trimmed(out: &mut Vec<String>, lines: &[String]) {
    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());
    if let (Some(start), Some(end)) = (start, end) {
        out.push(String::new());
        out.extend(lines[start..=end].iter().cloned());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Enqueue
// ─────────────────────────────────────────────────────────────────────────────

/// A discovered posting, as produced by the search agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryRecord {
    /// Priority score.
    pub score: i64,
    /// Hiring company.
    pub company: String,
    /// Role title.
    pub title: String,
    /// Posting URL.
    pub url: String,
    /// Location.
    pub location: Option<String>,
    /// Salary range.
    pub salary: Option<String>,
    /// Short company description.
    pub company_info: Option<String>,
    /// Visa sponsorship note.
    pub h1b: Option<String>,
    /// Discovery source.
    pub source: Option<String>,
    /// Score components.
    pub score_breakdown: Option<String>,
    /// Why the role is a match.
    pub why_match: Option<String>,
    /// Whether auto-apply is allowed; `None` means allowed.
    pub auto_apply: Option<bool>,
}

impl DiscoveryRecord {
    fn to_entry(&self, auto_apply: bool, now: NaiveDateTime) -> JobEntry {
        let company = first_non_empty(&self.company, "Unknown");
        let title = first_non_empty(&self.title, "Unknown");
        let mut lines = vec![
            format!("### [{}] {company} — {title}", self.score),
            format!(
                "- **Score Breakdown:** {}",
                self.score_breakdown
                    .clone()
                    .unwrap_or_else(|| format!("total={}", self.score))
            ),
            format!("- **URL:** {}", normalize_url(&self.url)),
            format!(
                "- **Location:** {}",
                self.location.as_deref().unwrap_or("Unknown")
            ),
        ];
        let optional = [
            ("Salary", &self.salary),
            ("Company", &self.company_info),
            ("H-1B", &self.h1b),
        ];
        for (name, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                lines.push(format!("- **{name}:** {value}"));
            }
        }
        lines.push(format!(
            "- **Source:** {}",
            self.source.as_deref().unwrap_or("Search Agent")
        ));
        lines.push(format!("- **Discovered:** {}", stamp(now)));
        lines.push("- **Status:** PENDING".to_string());
        if !auto_apply {
            lines.push("- **Auto-Apply:** NO".to_string());
        }
        if let Some(why) = self.why_match.as_deref().filter(|v| !v.trim().is_empty()) {
            lines.push(format!("- **Why notable:** {why}"));
        }
        JobEntry::from_lines(lines, SectionKind::Pending)
    }
}

/// Outcome of [`enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnqueueOutcome {
    /// Added to the pending section.
    Added {
        /// Pending entries after the insert.
        pending: usize,
        /// Whether auto-apply is allowed for the new entry.
        auto_apply: bool,
    },
    /// Already known.
    Duplicate {
        /// Where the match was found (`backlog` or `dedup`).
        source: String,
    },
}

/// Add a discovered posting to the pending section, keeping it ordered by
/// score.
///
/// # Errors
///
/// Returns [`BacklogError::InvalidRecord`] when the record has no valid URL
/// and [`BacklogError::Io`] on filesystem failure.
pub fn enqueue(
    store: &BacklogStore,
    record: &DiscoveryRecord,
    no_auto_companies: &[String],
    now: NaiveDateTime,
) -> Result<EnqueueOutcome, BacklogError> {
    if !is_valid_http_url(&record.url) {
        return Err(BacklogError::InvalidRecord(format!(
            "url '{}' is not a full http(s) url",
            record.url
        )));
    }
    let url = normalize_url(&record.url);
    store.transaction(|tx| {
        let in_backlog = tx.document.find(&url).is_some()
            || (!record.company.trim().is_empty()
                && !record.title.trim().is_empty()
                && tx
                    .document
                    .find_company_title(&record.company, &record.title)
                    .is_some());
        if in_backlog {
            return Ok(EnqueueOutcome::Duplicate {
                source: "backlog".to_string(),
            });
        }
        if let DedupVerdict::Duplicate { .. } =
            tx.dedup()?.check(&url, &record.company, &record.title)
        {
            return Ok(EnqueueOutcome::Duplicate {
                source: "dedup".to_string(),
            });
        }

        let blocked = no_auto_companies
            .iter()
            .any(|c| c.eq_ignore_ascii_case(record.company.trim()));
        let auto_apply = record.auto_apply.unwrap_or(true) && !blocked;
        let entry = record.to_entry(auto_apply, now);
        let (company, title) = (entry.company.clone(), entry.title.clone());
        tx.document.insert_pending(entry);
        tx.document.refresh_stats();
        tx.dedup()?
            .upsert(&url, &company, &title, DedupStatus::Pending, &day(now));

        let pending = tx.document.counts().pending;
        info!(url = %url, score = record.score, pending, "enqueued");
        Ok(EnqueueOutcome::Added {
            pending,
            auto_apply,
        })
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Dedup
// ─────────────────────────────────────────────────────────────────────────────

/// Check a posting against the dedup index.
///
/// # Errors
///
/// Returns [`BacklogError::Io`] if the index cannot be read.
pub fn check_dedup(
    store: &BacklogStore,
    url: &str,
    company: &str,
    title: &str,
) -> Result<DedupVerdict, BacklogError> {
    Ok(store.read_dedup()?.check(url, company, title))
}

/// Outcome of [`merge_dedup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Records before the rebuild.
    pub before: usize,
    /// Records after the rebuild.
    pub after: usize,
}

const fn dedup_status_for(status: EntryStatus) -> DedupStatus {
    match status {
        EntryStatus::Pending | EntryStatus::InProgress => DedupStatus::Pending,
        EntryStatus::Completed => DedupStatus::Completed,
        EntryStatus::Skipped => DedupStatus::Skipped,
    }
}

fn entry_record(entry: &JobEntry) -> DedupRecord {
    DedupRecord {
        url: entry.url.clone(),
        company: first_non_empty(&entry.company, "Unknown"),
        title: first_non_empty(&entry.title, "Unknown"),
        status: dedup_status_for(entry.status),
        date: String::new(),
    }
}

/// Rebuild the dedup index from the existing index, the tracker, the live
/// backlog and the archive, in that order of precedence.
///
/// # Errors
///
/// Returns [`BacklogError::Io`] on filesystem failure.
pub fn merge_dedup(store: &BacklogStore) -> Result<MergeReport, BacklogError> {
    store.transaction(|tx| {
        let existing: Vec<DedupRecord> = tx.dedup()?.records().cloned().collect();
        let before = existing.len();
        let tracked: Vec<DedupRecord> = tx
            .tracker()?
            .map(|t| t.entries())
            .unwrap_or_default()
            .into_iter()
            .map(|e| DedupRecord {
                url: e.url,
                company: e.company,
                title: e.title,
                status: DedupStatus::Applied,
                date: e.date_applied,
            })
            .collect();
        let live: Vec<DedupRecord> = rebuild_candidates(&tx.document);
        let archived: Vec<DedupRecord> = tx.archived_entries()?.iter().map(entry_record).collect();

        let header: Vec<String> = DEDUP_HEADER.iter().map(ToString::to_string).collect();
        let rebuilt = DedupIndex::rebuild(
            &header,
            existing.into_iter().chain(tracked).chain(live).chain(archived),
        );
        let after = rebuilt.len();
        replace_if_changed(tx, rebuilt)?;
        info!(before, after, "dedup index rebuilt");
        Ok(MergeReport { before, after })
    })
}

fn rebuild_candidates(document: &BacklogDocument) -> Vec<DedupRecord> {
    document
        .entries()
        .filter(|e| !e.url.is_empty())
        .map(entry_record)
        .collect()
}

fn replace_if_changed(tx: &mut Transaction<'_>, rebuilt: DedupIndex) -> Result<(), BacklogError> {
    if tx.dedup()?.render() != rebuilt.render() {
        tx.replace_dedup(rebuilt)?;
    }
    Ok(())
}
