//! Posting URL normalization and lane attribution.
//!
//! The same posting reaches the backlog through several discovery paths,
//! sometimes with a trailing slash and sometimes pointing at the ATS
//! `/application` sub-page. [`normalize_url`] maps all of those onto one
//! canonical form, and [`url_match_key`] is the case-insensitive comparison key
//! used wherever two URLs are checked for identity.

use std::fmt;

use serde::{Deserialize, Serialize};

const APPLICATION_SUFFIX: &str = "/application";

/// Canonical form of a posting URL.
///
/// Strips surrounding whitespace, trailing slashes, and any number of trailing
/// `/application` segments.
pub fn normalize_url(url: &str) -> String {
    let mut current = url.trim();
    loop {
        let trimmed = current.trim_end_matches('/');
        let stripped = strip_suffix_ignore_case(trimmed, APPLICATION_SUFFIX).unwrap_or(trimmed);
        if stripped.len() == current.len() {
            return stripped.to_string();
        }
        current = stripped;
    }
}

/// Case-insensitive identity key for a posting URL.
pub fn url_match_key(url: &str) -> String {
    normalize_url(url).to_ascii_lowercase()
}

/// Whether `value` is a full `http(s)://host...` URL.
pub fn is_valid_http_url(value: &str) -> bool {
    let candidate = value.trim();
    let rest = if let Some(rest) = strip_prefix_ignore_case(candidate, "https://") {
        rest
    } else if let Some(rest) = strip_prefix_ignore_case(candidate, "http://") {
        rest
    } else {
        return false;
    };
    if candidate.chars().any(char::is_whitespace) {
        return false;
    }
    let host_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..host_end];
    let host = authority.rsplit('@').next().unwrap_or(authority);
    !host.is_empty() && !host.starts_with(':')
}

fn strip_suffix_ignore_case<'a>(value: &'a str, suffix: &str) -> Option<&'a str> {
    let split = value.len().checked_sub(suffix.len())?;
    let (head, tail) = (value.get(..split)?, value.get(split..)?);
    tail.eq_ignore_ascii_case(suffix).then_some(head)
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

/// ATS integration a posting belongs to, derived from its URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneHint {
    /// Ashby-hosted posting.
    Ashby,
    /// Greenhouse-hosted posting.
    Greenhouse,
    /// Lever-hosted posting.
    Lever,
    /// Anything without a dedicated lane.
    Other,
}

impl LaneHint {
    const PATTERNS: [(Self, &'static [&'static str]); 3] = [
        (Self::Ashby, &["ashbyhq.com"]),
        (Self::Greenhouse, &["greenhouse.io", "gh_jid="]),
        (Self::Lever, &["lever.co"]),
    ];

    /// Derive the lane hint from a posting URL.
    pub fn from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        Self::PATTERNS
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| lower.contains(p)))
            .map_or(Self::Other, |(hint, _)| *hint)
    }

    /// Lane-name form of the hint.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ashby => "ashby",
            Self::Greenhouse => "greenhouse",
            Self::Lever => "lever",
            Self::Other => "other",
        }
    }

    /// Whether entries with this hint are served by the named lane.
    ///
    /// Numbered lanes (`ashby2`) share the entries of their base lane.
    pub fn served_by(self, lane: &str) -> bool {
        let base = lane.trim_end_matches(|c: char| c.is_ascii_digit());
        base.eq_ignore_ascii_case(self.as_str())
    }
}

impl fmt::Display for LaneHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
