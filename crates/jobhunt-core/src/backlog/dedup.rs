//! Flat dedup index: one `url | company | title | STATUS | date` line per
//! posting ever seen.
//!
//! The index is what keeps discovery from re-adding postings that were already
//! applied to or skipped. Lines that do not parse as records (comments, the
//! header, legacy short rows) are preserved verbatim on rewrite.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::url::{normalize_url, url_match_key};

/// Status column of a dedup record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DedupStatus {
    /// Still in the live backlog.
    Pending,
    /// Application submitted.
    Applied,
    /// Completed (legacy synonym of applied written by older tooling).
    Completed,
    /// Passed over on purpose.
    Skipped,
    /// Entered by hand by the operator.
    Manual,
    /// Status could not be determined.
    Unknown,
    /// Any other value, kept as written.
    #[serde(untagged)]
    Other(String),
}

impl DedupStatus {
    /// Parse a status column value.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Self::Pending,
            "APPLIED" => Self::Applied,
            "COMPLETED" => Self::Completed,
            "SKIPPED" => Self::Skipped,
            "MANUAL" => Self::Manual,
            "UNKNOWN" | "" => Self::Unknown,
            _ => Self::Other(value.trim().to_string()),
        }
    }

    /// Forward-progress rank: a record never moves to a lower rank.
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Unknown | Self::Other(_) => 0,
            Self::Pending => 1,
            Self::Skipped | Self::Manual => 2,
            Self::Applied | Self::Completed => 3,
        }
    }
}

impl fmt::Display for DedupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("PENDING"),
            Self::Applied => f.write_str("APPLIED"),
            Self::Completed => f.write_str("COMPLETED"),
            Self::Skipped => f.write_str("SKIPPED"),
            Self::Manual => f.write_str("MANUAL"),
            Self::Unknown => f.write_str("UNKNOWN"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// One parsed dedup row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    /// Posting URL.
    pub url: String,
    /// Company column.
    pub company: String,
    /// Title column.
    pub title: String,
    /// Status column.
    pub status: DedupStatus,
    /// Date column (`YYYY-MM-DD` or empty).
    pub date: String,
}

impl DedupRecord {
    /// Render as an index line.
    pub fn to_line(&self) -> String {
        format!(
            "{} | {} | {} | {} | {}",
            self.url,
            sanitize(&self.company),
            sanitize(&self.title),
            self.status,
            self.date
        )
    }

    fn key(&self) -> String {
        url_match_key(&self.url)
    }
}

impl fmt::Display for DedupRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

fn sanitize(column: &str) -> String {
    column.replace('|', "/").trim().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DedupLine {
    Raw(String),
    Record { record: DedupRecord, raw: Option<String> },
}

/// Result of checking a posting against the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DedupVerdict {
    /// Never seen.
    New,
    /// Already recorded.
    Duplicate {
        /// The matching record.
        record: DedupRecord,
    },
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// A new row was appended.
    Inserted,
    /// An existing row was updated (and any duplicates collapsed).
    Updated,
    /// The row already had this status or a more advanced one.
    Unchanged,
}

/// In-memory dedup index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupIndex {
    lines: Vec<DedupLine>,
    trailing_newline: bool,
}

impl DedupIndex {
    /// Parse index text. Never fails.
    pub fn parse(content: &str) -> Self {
        let trailing_newline = content.ends_with('\n');
        let body = content.strip_suffix('\n').unwrap_or(content);
        let lines = if body.is_empty() && !trailing_newline {
            Vec::new()
        } else {
            body.split('\n').map(parse_line).collect()
        };
        Self {
            lines,
            trailing_newline: trailing_newline || content.is_empty(),
        }
    }

    /// Render back to text. Untouched lines are byte-identical.
    pub fn render(&self) -> String {
        let mut out = self
            .lines
            .iter()
            .map(|line| match line {
                DedupLine::Raw(raw) | DedupLine::Record { raw: Some(raw), .. } => raw.clone(),
                DedupLine::Record { record, raw: None } => record.to_line(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }

    /// All parsed records in file order.
    pub fn records(&self) -> impl Iterator<Item = &DedupRecord> {
        self.lines.iter().filter_map(|l| match l {
            DedupLine::Record { record, .. } => Some(record),
            DedupLine::Raw(_) => None,
        })
    }

    /// Record for `url`, compared after normalization.
    pub fn lookup(&self, url: &str) -> Option<&DedupRecord> {
        let key = url_match_key(url);
        self.records().find(|r| r.key() == key)
    }

    /// Record matching company and title case-insensitively.
    pub fn lookup_company_title(&self, company: &str, title: &str) -> Option<&DedupRecord> {
        let (company, title) = (company.trim(), title.trim());
        if company.is_empty() || title.is_empty() {
            return None;
        }
        self.records().find(|r| {
            r.company.eq_ignore_ascii_case(company) && r.title.eq_ignore_ascii_case(title)
        })
    }

    /// Check a posting by URL and, when given, by company and title.
    pub fn check(&self, url: &str, company: &str, title: &str) -> DedupVerdict {
        self.lookup(url)
            .or_else(|| self.lookup_company_title(company, title))
            .map_or(DedupVerdict::New, |record| DedupVerdict::Duplicate {
                record: record.clone(),
            })
    }

    /// Insert or advance the record for `url`.
    ///
    /// A record never moves backward in [`DedupStatus::rank`]. When several
    /// rows share the normalized URL, the first is updated and the rest are
    /// dropped so the index keeps one canonical row per posting.
    pub fn upsert(
        &mut self,
        url: &str,
        company: &str,
        title: &str,
        status: DedupStatus,
        date: &str,
    ) -> UpsertOutcome {
        let key = url_match_key(url);
        let mut first = None;
        let mut duplicates = Vec::new();
        for (idx, line) in self.lines.iter().enumerate() {
            if let DedupLine::Record { record, .. } = line {
                if record.key() == key {
                    if first.is_none() {
                        first = Some(idx);
                    } else {
                        duplicates.push(idx);
                    }
                }
            }
        }

        let Some(first) = first else {
            self.lines.push(DedupLine::Record {
                record: DedupRecord {
                    url: normalize_url(url),
                    company: non_empty_or(company, "Unknown"),
                    title: non_empty_or(title, "Unknown"),
                    status,
                    date: date.to_string(),
                },
                raw: None,
            });
            self.trailing_newline = true;
            return UpsertOutcome::Inserted;
        };

        for idx in duplicates.iter().rev() {
            self.lines.remove(*idx);
        }
        let collapsed = !duplicates.is_empty();

        let DedupLine::Record { record, raw } = &mut self.lines[first] else {
            return UpsertOutcome::Unchanged;
        };
        if status.rank() <= record.status.rank() {
            return if collapsed {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Unchanged
            };
        }
        record.status = status;
        record.date = date.to_string();
        if !company.trim().is_empty() {
            record.company = company.trim().to_string();
        }
        if !title.trim().is_empty() {
            record.title = title.trim().to_string();
        }
        *raw = None;
        UpsertOutcome::Updated
    }

    /// Number of parsed records.
    pub fn len(&self) -> usize {
        self.records().count()
    }

    /// Whether the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild the index from candidate records, one row per normalized URL.
    ///
    /// Earlier candidates win; template (`example.com`) and non-http URLs are
    /// dropped.
    /// `header` lines are written first.
    pub fn rebuild<I>(header: &[String], candidates: I) -> Self
    where
        I: IntoIterator<Item = DedupRecord>,
    {
        let mut by_key: BTreeMap<String, DedupRecord> = BTreeMap::new();
        for candidate in candidates {
            let url = candidate.url.trim();
            let lower = url.to_ascii_lowercase();
            if !lower.starts_with("http")
                || lower.contains("//example.com")
                || lower.contains("//www.example.com")
            {
                continue;
            }
            by_key.entry(url_match_key(url)).or_insert(DedupRecord {
                url: normalize_url(url),
                ..candidate
            });
        }
        let mut lines: Vec<DedupLine> = header.iter().cloned().map(DedupLine::Raw).collect();
        lines.extend(
            by_key
                .into_values()
                .map(|record| DedupLine::Record { record, raw: None }),
        );
        Self {
            lines,
            trailing_newline: true,
        }
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn parse_line(line: &str) -> DedupLine {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("URL") {
        return DedupLine::Raw(line.to_string());
    }
    let parts: Vec<&str> = trimmed.split('|').map(str::trim).collect();
    if parts.len() < 4 {
        return DedupLine::Raw(line.to_string());
    }
    DedupLine::Record {
        record: DedupRecord {
            url: parts[0].to_string(),
            company: parts[1].to_string(),
            title: parts[2].to_string(),
            status: DedupStatus::parse(parts[3]),
            date: parts.get(4).copied().unwrap_or_default().to_string(),
        },
        raw: Some(line.to_string()),
    }
}
