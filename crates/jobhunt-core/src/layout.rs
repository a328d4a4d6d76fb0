//! On-disk layout of a jobhunt workspace.

use std::path::{Path, PathBuf};

/// Every file the coordination core owns, derived from the workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    /// Workspace root.
    pub root: PathBuf,
    /// Live backlog document.
    pub queue: PathBuf,
    /// Append-only archive of completed and skipped entries.
    pub archive: PathBuf,
    /// Flat dedup index.
    pub dedup: PathBuf,
    /// Application tracker.
    pub tracker: PathBuf,
    /// Advisory lock guarding backlog transactions.
    pub queue_lock: PathBuf,
    /// Directory holding lane locks.
    pub locks_dir: PathBuf,
    /// Directory holding per-resource claims.
    pub claims_dir: PathBuf,
    /// Advisory lock guarding the claims directory.
    pub claims_lock: PathBuf,
    /// Reconciler state directory.
    pub state_dir: PathBuf,
}

impl WorkspaceLayout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let locks_dir = root.join(".locks");
        let state_dir = root.join("state");
        Self {
            queue: root.join("job-queue.md"),
            archive: root.join("job-queue-archive.md"),
            dedup: root.join("dedup-index.md"),
            tracker: root.join("job-tracker.md"),
            queue_lock: root.join(".queue.lock"),
            claims_dir: locks_dir.join("claims"),
            claims_lock: locks_dir.join("claims.lock"),
            locks_dir,
            state_dir,
            root,
        }
    }

    /// Persisted reconciler state.
    pub fn watch_state(&self) -> PathBuf {
        self.state_dir.join("watch-state.json")
    }

    /// Guard violation log.
    pub fn guardrails_log(&self) -> PathBuf {
        self.state_dir.join("guardrails.jsonl")
    }

    /// Reconcile receipts directory.
    pub fn receipts_dir(&self) -> PathBuf {
        self.state_dir.join("receipts")
    }

    /// Single-instance lock for reconciliation passes.
    pub fn reconcile_lock(&self) -> PathBuf {
        self.state_dir.join("reconcile.lock")
    }

    /// Workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_the_root() {
        let layout = WorkspaceLayout::new("/w");
        assert_eq!(layout.queue, PathBuf::from("/w/job-queue.md"));
        assert_eq!(layout.queue_lock, PathBuf::from("/w/.queue.lock"));
        assert_eq!(layout.locks_dir, PathBuf::from("/w/.locks"));
        assert_eq!(layout.claims_lock, PathBuf::from("/w/.locks/claims.lock"));
        assert_eq!(
            layout.reconcile_lock(),
            PathBuf::from("/w/state/reconcile.lock")
        );
    }
}
