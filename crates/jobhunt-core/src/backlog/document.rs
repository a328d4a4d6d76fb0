//! Tolerant parser and renderer for the backlog document.
//!
//! The backlog is a loosely structured markdown file maintained by both this
//! crate and external collaborators. The parser is a finite-state line
//! scanner: `##` headings switch the current section, `### [` lines (and any
//! `###` line inside an entry-bearing section) open an entry that extends to
//! the next `##`/`###` line, and everything else is kept as verbatim text.
//! Nothing is dropped: an entry whose header cannot be parsed is still an
//! entry (flagged `malformed`, classified Pending), and an unmodified document
//! renders back byte-for-byte.
//!
//! ```text
//! # Job Priority Queue
//! - Pending: 2 | In Progress: 0
//! ## PENDING (sorted by priority score, highest first)
//! ### [350] Acme — Staff Engineer
//! - **URL:** https://jobs.ashbyhq.com/acme/1
//! - **Location:** Remote
//! ```

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::url::{LaneHint, url_match_key};

/// Markers that disable auto-apply when they appear anywhere in an entry.
pub const NO_AUTO_MARKERS: [&str; 4] = [
    "DO NOT AUTO-APPLY",
    "OPENAI LIMIT",
    "Auto-Apply: NO",
    "NO-AUTO",
];

/// Heading written for the live pending section.
pub const PENDING_HEADING: &str = "## PENDING (sorted by priority score, highest first)";

/// Heading written for the live in-progress section.
pub const IN_PROGRESS_HEADING: &str = "## IN PROGRESS";

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a job entry.
///
/// Entries only move forward: `PENDING → IN_PROGRESS → {COMPLETED, SKIPPED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    /// Waiting to be dispatched.
    Pending,
    /// A worker is acting on the entry.
    InProgress,
    /// Application submitted.
    Completed,
    /// Permanently passed over.
    Skipped,
}

impl EntryStatus {
    /// Whether the entry still belongs in the live backlog.
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    fn from_field(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" | "INPROGRESS" => Some(Self::InProgress),
            "COMPLETED" | "APPLIED" => Some(Self::Completed),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Skipped => "SKIPPED",
        })
    }
}

/// Section of the document a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    /// Everything before the first `##` heading.
    Preamble,
    /// `## IN PROGRESS`.
    InProgress,
    /// `## PENDING...`.
    Pending,
    /// `## ... DO NOT AUTO-APPLY ...`; entries are pending but never
    /// auto-applied.
    NoAuto,
    /// `## COMPLETED...`.
    Completed,
    /// `## SKIPPED...`.
    Skipped,
    /// Any other `##` heading.
    Other,
}

impl SectionKind {
    fn classify(heading: &str) -> Self {
        let upper = heading.to_ascii_uppercase();
        if upper.contains("DO NOT AUTO-APPLY") {
            Self::NoAuto
        } else if upper.starts_with("## IN PROGRESS") {
            Self::InProgress
        } else if upper.starts_with("## PENDING") {
            Self::Pending
        } else if upper.starts_with("## COMPLETED") {
            Self::Completed
        } else if upper.starts_with("## SKIPPED") {
            Self::Skipped
        } else {
            Self::Other
        }
    }

    /// Whether any `###` line in this section is an entry, parseable or not.
    const fn holds_entries(self) -> bool {
        matches!(
            self,
            Self::InProgress | Self::Pending | Self::NoAuto | Self::Completed | Self::Skipped
        )
    }

    const fn implied_status(self) -> EntryStatus {
        match self {
            Self::InProgress => EntryStatus::InProgress,
            Self::Completed => EntryStatus::Completed,
            Self::Skipped => EntryStatus::Skipped,
            Self::Preamble | Self::Pending | Self::NoAuto | Self::Other => EntryStatus::Pending,
        }
    }
}

/// One candidate application parsed from the backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEntry {
    /// Posting URL as written (not normalized).
    pub url: String,
    /// Hiring company.
    pub company: String,
    /// Role title.
    pub title: String,
    /// Priority score; higher is dispatched first.
    pub priority_score: i64,
    /// Resolved lifecycle state.
    pub status: EntryStatus,
    /// Lane derived from the URL.
    pub lane_hint: LaneHint,
    /// False when any no-auto marker or policy applies.
    pub auto_apply_allowed: bool,
    /// Location field, if present.
    pub location: String,
    /// Salary field, if present.
    pub salary: String,
    /// Section the entry was found in.
    pub section: SectionKind,
    /// True when the header line did not match `### [score] Company — Title`.
    pub malformed: bool,
    /// Verbatim source lines, header first.
    #[serde(skip)]
    pub lines: Vec<String>,
}

impl JobEntry {
    /// Case-insensitive identity key of the entry's URL.
    pub fn key(&self) -> String {
        url_match_key(&self.url)
    }

    /// Whether the entry carries an explicit `**Status:**` field.
    pub fn has_status_field(&self) -> bool {
        self.lines.iter().any(|l| field_value(l, "Status").is_some())
    }

    /// Set (or replace) the `**Status:**` field and the resolved status.
    pub fn set_status_field(&mut self, status: EntryStatus) {
        self.status = status;
        let line = format!("- **Status:** {status}");
        if let Some(existing) = self
            .lines
            .iter_mut()
            .find(|l| field_value(l, "Status").is_some())
        {
            *existing = line;
        } else {
            self.push_field_line(line);
        }
    }

    /// Append a `- **name:** value` field after the last non-blank line.
    pub fn push_field(&mut self, name: &str, value: &str) {
        self.push_field_line(format!("- **{name}:** {value}"));
    }

    fn push_field_line(&mut self, line: String) {
        let insert_at = self
            .lines
            .iter()
            .rposition(|l| !l.trim().is_empty())
            .map_or(self.lines.len(), |i| i + 1);
        self.lines.insert(insert_at, line);
    }

    /// Entry text without trailing blank lines or standalone HTML comments.
    pub fn clean_text(&self) -> String {
        let kept: Vec<&str> = self
            .lines
            .iter()
            .map(String::as_str)
            .filter(|l| !is_html_comment(l))
            .collect();
        let end = kept
            .iter()
            .rposition(|l| !l.trim().is_empty())
            .map_or(0, |i| i + 1);
        kept[..end].join("\n")
    }

    /// Build an entry from its raw lines, resolving fields and status.
    pub fn from_lines(lines: Vec<String>, section: SectionKind) -> Self {
        let header = lines.first().map_or("", |l| l.trim());
        let (priority_score, company, title, malformed) = match HEADER_RE.captures(header) {
            Some(caps) => (
                caps[1].parse().unwrap_or(0),
                caps[2].trim().to_string(),
                caps[3].trim().to_string(),
                false,
            ),
            None => (
                0,
                String::new(),
                header.trim_start_matches('#').trim().to_string(),
                true,
            ),
        };

        let mut url = String::new();
        let mut location = String::new();
        let mut salary = String::new();
        let mut explicit_status = None;
        let mut applied_marker = false;
        let mut reason_marker = false;
        let mut no_auto = section == SectionKind::NoAuto;

        for line in &lines {
            if let Some(v) = field_value(line, "URL") {
                url = v.to_string();
            } else if let Some(v) = field_value(line, "Location") {
                location = v.to_string();
            } else if let Some(v) = field_value(line, "Salary") {
                salary = v.to_string();
            } else if let Some(v) = field_value(line, "Status") {
                let word: String = v
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                    .collect();
                explicit_status = explicit_status.or_else(|| EntryStatus::from_field(&word));
            } else if field_value(line, "Applied").is_some() {
                applied_marker = true;
            } else if field_value(line, "Reason").is_some() {
                reason_marker = true;
            }
            if NO_AUTO_MARKERS.iter().any(|m| line.contains(m))
                || field_value(line, "Auto-Apply").is_some_and(|v| v.eq_ignore_ascii_case("no"))
            {
                no_auto = true;
            }
        }

        let status = explicit_status.unwrap_or(if applied_marker {
            EntryStatus::Completed
        } else if reason_marker {
            EntryStatus::Skipped
        } else {
            section.implied_status()
        });

        Self {
            lane_hint: LaneHint::from_url(&url),
            url,
            company,
            title,
            priority_score,
            status,
            auto_apply_allowed: !no_auto,
            location,
            salary,
            section,
            malformed,
            lines,
        }
    }
}

/// Value of a `- **Name:** value` line, if `line` is that field.
pub fn field_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.trim().strip_prefix("- **")?;
    let rest = rest.strip_prefix(name)?;
    let rest = rest.strip_prefix(":**")?;
    Some(rest.trim())
}

fn is_html_comment(line: &str) -> bool {
    let t = line.trim();
    t.starts_with("<!--") && t.ends_with("-->")
}

static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^###\s+\[(-?\d+)\]\s+(.+?)(?:\s*[—–]\s*|\s+-\s+)(.+)$")
        .expect("entry header regex is valid")
});

static STATS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Pending:\s*(\d+)\s*\|\s*In Progress:\s*(\d+)").expect("stats regex is valid")
});

fn is_entry_header(line: &str) -> bool {
    line.trim_start().starts_with("### [")
}

fn is_section_heading(line: &str) -> bool {
    line.trim_start().starts_with("## ")
}

fn is_subheading(line: &str) -> bool {
    line.trim_start().starts_with("### ")
}

// ─────────────────────────────────────────────────────────────────────────────
// Document
// ─────────────────────────────────────────────────────────────────────────────

/// A structural unit of the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// A line that is neither a heading nor part of an entry.
    Text {
        /// Section the line belongs to.
        section: SectionKind,
        /// Verbatim line.
        line: String,
    },
    /// A `##` section heading.
    Heading {
        /// Classification of the heading.
        kind: SectionKind,
        /// Verbatim heading line.
        line: String,
    },
    /// A job entry with all of its lines.
    Entry(JobEntry),
}

/// Aggregate counts over a parsed document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogCounts {
    /// Entries resolved as Pending.
    pub pending: usize,
    /// Entries resolved as InProgress.
    pub in_progress: usize,
    /// Entries resolved as Completed.
    pub completed: usize,
    /// Entries resolved as Skipped.
    pub skipped: usize,
    /// Entries whose header could not be parsed.
    pub malformed: usize,
}

impl BacklogCounts {
    /// Total number of entries.
    pub const fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.skipped
    }
}

/// In-memory form of the backlog document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BacklogDocument {
    blocks: Vec<Block>,
}

impl BacklogDocument {
    /// Parse document text. Never fails; see the module docs for the rules.
    pub fn parse(content: &str) -> Self {
        let mut blocks = Vec::new();
        let mut section = SectionKind::Preamble;
        let mut current: Option<Vec<String>> = None;
        let mut entry_section = section;

        for line in content.split('\n') {
            let heading = is_section_heading(line);
            let subheading = is_subheading(line);
            if heading || subheading {
                if let Some(lines) = current.take() {
                    blocks.push(Block::Entry(JobEntry::from_lines(lines, entry_section)));
                }
            }
            if heading {
                section = SectionKind::classify(line.trim());
                blocks.push(Block::Heading {
                    kind: section,
                    line: line.to_string(),
                });
            } else if subheading && (is_entry_header(line) || section.holds_entries()) {
                entry_section = section;
                current = Some(vec![line.to_string()]);
            } else if let Some(lines) = current.as_mut() {
                lines.push(line.to_string());
            } else {
                blocks.push(Block::Text {
                    section,
                    line: line.to_string(),
                });
            }
        }
        if let Some(lines) = current.take() {
            blocks.push(Block::Entry(JobEntry::from_lines(lines, entry_section)));
        }
        Self { blocks }
    }

    /// Render back to text.
    pub fn render(&self) -> String {
        let mut lines: Vec<&str> = Vec::new();
        for block in &self.blocks {
            match block {
                Block::Text { line, .. } | Block::Heading { line, .. } => lines.push(line),
                Block::Entry(entry) => lines.extend(entry.lines.iter().map(String::as_str)),
            }
        }
        lines.join("\n")
    }

    /// All blocks in document order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// All entries in document order.
    pub fn entries(&self) -> impl Iterator<Item = &JobEntry> {
        self.blocks.iter().filter_map(|b| match b {
            Block::Entry(e) => Some(e),
            _ => None,
        })
    }

    /// Apply a company-level no-auto policy to every entry.
    pub fn apply_no_auto_companies(&mut self, companies: &[String]) {
        for block in &mut self.blocks {
            if let Block::Entry(entry) = block {
                let company = entry.company.to_ascii_lowercase();
                if companies.iter().any(|c| c.eq_ignore_ascii_case(&company)) {
                    entry.auto_apply_allowed = false;
                }
            }
        }
    }

    /// Aggregate counts by resolved status.
    pub fn counts(&self) -> BacklogCounts {
        let mut counts = BacklogCounts::default();
        for entry in self.entries() {
            match entry.status {
                EntryStatus::Pending => counts.pending += 1,
                EntryStatus::InProgress => counts.in_progress += 1,
                EntryStatus::Completed => counts.completed += 1,
                EntryStatus::Skipped => counts.skipped += 1,
            }
            if entry.malformed {
                counts.malformed += 1;
            }
        }
        counts
    }

    /// `(pending, in_progress)` as declared by the stats line, if any.
    pub fn declared_stats(&self) -> Option<(usize, usize)> {
        self.blocks.iter().find_map(|b| match b {
            Block::Text { line, .. } => STATS_RE
                .captures(line)
                .and_then(|c| Some((c[1].parse().ok()?, c[2].parse().ok()?))),
            _ => None,
        })
    }

    /// First entry whose URL matches `url` after normalization.
    pub fn find(&self, url: &str) -> Option<&JobEntry> {
        let key = url_match_key(url);
        self.entries().find(|e| !e.url.is_empty() && e.key() == key)
    }

    /// First entry matching company and title case-insensitively.
    pub fn find_company_title(&self, company: &str, title: &str) -> Option<&JobEntry> {
        self.entries().find(|e| {
            e.company.eq_ignore_ascii_case(company.trim())
                && e.title.eq_ignore_ascii_case(title.trim())
        })
    }

    /// Remove every entry whose URL matches `url`, returning them in order.
    pub fn remove(&mut self, url: &str) -> Vec<JobEntry> {
        let key = url_match_key(url);
        let mut removed = Vec::new();
        self.blocks.retain(|b| match b {
            Block::Entry(e) if !e.url.is_empty() && e.key() == key => {
                removed.push(e.clone());
                false
            },
            _ => true,
        });
        removed
    }

    /// Insert a pending entry, keeping the pending section ordered by score
    /// (highest first). Creates the pending section if it does not exist.
    pub fn insert_pending(&mut self, mut entry: JobEntry) {
        if entry.lines.last().is_none_or(|l| !l.trim().is_empty()) {
            entry.lines.push(String::new());
        }
        entry.section = SectionKind::Pending;

        let Some(heading_idx) = self.blocks.iter().position(|b| {
            matches!(
                b,
                Block::Heading {
                    kind: SectionKind::Pending,
                    ..
                }
            )
        }) else {
            self.ensure_trailing_blank();
            self.blocks.push(Block::Heading {
                kind: SectionKind::Pending,
                line: PENDING_HEADING.to_string(),
            });
            self.blocks.push(Block::Text {
                section: SectionKind::Pending,
                line: String::new(),
            });
            self.blocks.push(Block::Entry(entry));
            return;
        };

        let section_end = self.blocks[heading_idx + 1..]
            .iter()
            .position(|b| matches!(b, Block::Heading { .. }))
            .map_or(self.blocks.len(), |i| heading_idx + 1 + i);

        let mut insert_at = None;
        let mut last_entry = None;
        for idx in heading_idx + 1..section_end {
            if let Block::Entry(existing) = &self.blocks[idx] {
                if insert_at.is_none() && existing.priority_score < entry.priority_score {
                    insert_at = Some(idx);
                }
                last_entry = Some(idx);
            }
        }
        let idx = insert_at.unwrap_or_else(|| {
            last_entry.map_or_else(
                || {
                    // Skip the blank line(s) directly under the heading.
                    let mut i = heading_idx + 1;
                    while i < section_end
                        && matches!(&self.blocks[i], Block::Text { line, .. } if line.trim().is_empty())
                    {
                        i += 1;
                    }
                    i
                },
                |last| last + 1,
            )
        });
        if let Some(Block::Entry(prev)) = idx.checked_sub(1).and_then(|i| self.blocks.get_mut(i)) {
            if prev.lines.last().is_some_and(|l| !l.trim().is_empty()) {
                prev.lines.push(String::new());
            }
        }
        self.blocks.insert(idx, Block::Entry(entry));
    }

    /// Rewrite the `Pending: N | In Progress: M` line to the current counts.
    ///
    /// Returns whether a stats line was found.
    pub fn refresh_stats(&mut self) -> bool {
        let counts = self.counts();
        let mut found = false;
        for block in &mut self.blocks {
            if let Block::Text { line, .. } = block {
                if STATS_RE.is_match(line) {
                    let replacement = format!(
                        "Pending: {} | In Progress: {}",
                        counts.pending, counts.in_progress
                    );
                    let updated = STATS_RE
                        .replace(line.as_str(), replacement.as_str())
                        .into_owned();
                    *line = updated;
                    found = true;
                    break;
                }
            }
        }
        found
    }

    fn ensure_trailing_blank(&mut self) {
        let needs_blank = match self.blocks.last_mut() {
            Some(Block::Entry(entry)) => {
                if entry.lines.last().is_some_and(|l| !l.trim().is_empty()) {
                    entry.lines.push(String::new());
                }
                false
            },
            Some(Block::Text { line, .. }) => !line.trim().is_empty(),
            Some(Block::Heading { .. }) => true,
            None => false,
        };
        if needs_blank {
            self.blocks.push(Block::Text {
                section: SectionKind::Other,
                line: String::new(),
            });
        }
    }
}
