//! The application tracker: one `### Company — Title` block per submitted
//! application.

use std::sync::LazyLock;

use regex::Regex;

use super::document::field_value;
use super::url::url_match_key;

const FOLLOW_UPS_HEADING: &str = "## Priority Follow-ups";

static TRACKER_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^###\s+\[?(.+?)\]?\s*(?:[—–]|\s-\s)\s*(.+?)\s*$")
        .expect("tracker header regex is valid")
});

/// One application recorded in the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerEntry {
    /// Company.
    pub company: String,
    /// Role title.
    pub title: String,
    /// Posting link.
    pub url: String,
    /// `Date Applied` value, empty when absent.
    pub date_applied: String,
}

/// Application tracker document, kept as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerDocument {
    content: String,
}

impl TrackerDocument {
    /// Wrap tracker text.
    pub fn parse(content: &str) -> Self {
        Self {
            content: content.to_string(),
        }
    }

    /// Current text.
    pub fn render(&self) -> String {
        self.content.clone()
    }

    /// Whether any tracker line mentions `url` (after normalization).
    pub fn contains_url(&self, url: &str) -> bool {
        let key = url_match_key(url);
        !key.is_empty() && self.content.to_ascii_lowercase().contains(&key)
    }

    /// Record an application unless the URL is already tracked.
    ///
    /// The block goes before `## Priority Follow-ups` when that heading
    /// exists, otherwise at the end. Returns whether the tracker changed.
    pub fn add_applied(&mut self, company: &str, title: &str, url: &str, date: &str) -> bool {
        if self.contains_url(url) {
            return false;
        }
        let company = if company.trim().is_empty() { "Unknown" } else { company.trim() };
        let title = if title.trim().is_empty() { "Unknown" } else { title.trim() };
        let block = format!(
            "\n### {company} — {title}\n\
             - **Stage:** Applied\n\
             - **Date Applied:** {date}\n\
             - **Link:** {url}\n\
             - **Notes:** Auto-applied by agent\n"
        );
        if let Some(pos) = self.content.find(FOLLOW_UPS_HEADING) {
            self.content.insert_str(pos, &format!("{block}\n"));
        } else {
            self.content.push_str(&block);
        }
        true
    }

    /// Every block that carries a link.
    pub fn entries(&self) -> Vec<TrackerEntry> {
        let mut out = Vec::new();
        let mut current: Option<TrackerEntry> = None;
        for line in self.content.lines() {
            if let Some(caps) = TRACKER_HEADER_RE.captures(line.trim_end()) {
                out.extend(current.take().filter(|e| !e.url.is_empty()));
                current = Some(TrackerEntry {
                    company: caps[1].trim().to_string(),
                    title: caps[2].trim().to_string(),
                    url: String::new(),
                    date_applied: String::new(),
                });
                continue;
            }
            if line.starts_with("## ") {
                out.extend(current.take().filter(|e| !e.url.is_empty()));
                continue;
            }
            let Some(entry) = current.as_mut() else {
                continue;
            };
            if let Some(link) = field_value(line, "Link").or_else(|| field_value(line, "URL")) {
                entry.url = link.to_string();
            } else if let Some(date) = field_value(line, "Date Applied") {
                entry.date_applied = date.to_string();
            }
        }
        out.extend(current.filter(|e| !e.url.is_empty()));
        out
    }
}
