//! Append-only archive of entries that left the live backlog.

use super::document::{BacklogDocument, EntryStatus, JobEntry};

/// Entries leaving the backlog in one archival step.
#[derive(Debug, Clone, Default)]
pub struct ArchiveBatch {
    /// Applied entries.
    pub completed: Vec<JobEntry>,
    /// Skipped entries.
    pub skipped: Vec<JobEntry>,
}

impl ArchiveBatch {
    /// Sort `entry` into the group matching its status. Live entries are
    /// rejected and handed back.
    pub fn push(&mut self, entry: JobEntry) -> Result<(), JobEntry> {
        match entry.status {
            EntryStatus::Completed => self.completed.push(entry),
            EntryStatus::Skipped => self.skipped.push(entry),
            EntryStatus::Pending | EntryStatus::InProgress => return Err(entry),
        }
        Ok(())
    }

    /// Number of entries in the batch.
    pub fn len(&self) -> usize {
        self.completed.len() + self.skipped.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Archive text for this batch under `## Archived <stamp>`.
    ///
    /// Every entry is written with an explicit status field so the archive
    /// classifies the same way on re-read. Returns an empty string for an
    /// empty batch.
    pub fn render(&self, stamp: &str) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = format!("\n\n## Archived {stamp}\n\n");
        for (label, status, group) in [
            ("COMPLETED", EntryStatus::Completed, &self.completed),
            ("SKIPPED", EntryStatus::Skipped, &self.skipped),
        ] {
            if group.is_empty() {
                continue;
            }
            out.push_str(&format!("### {label} ({} entries)\n\n", group.len()));
            for entry in group {
                let mut entry = entry.clone();
                if !entry.has_status_field() {
                    entry.set_status_field(status);
                }
                out.push_str(entry.clean_text().trim());
                out.push_str("\n\n");
            }
        }
        out
    }
}

/// Entries found in archive text.
pub fn parse_entries(content: &str) -> Vec<JobEntry> {
    BacklogDocument::parse(content).entries().cloned().collect()
}
