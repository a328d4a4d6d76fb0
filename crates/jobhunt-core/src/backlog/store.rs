//! Lock-scoped access to the live backlog and its side documents.
//!
//! The backlog document is replaced by rename, so the advisory lock lives on a
//! separate `.queue.lock` file whose inode never changes. Readers take the
//! lock shared, transactions take it exclusive for the whole
//! read-compute-rewrite cycle.

use std::fs::File;

use fs2::FileExt;
use tracing::debug;

use super::BacklogError;
use super::archive;
use super::dedup::DedupIndex;
use super::document::{BacklogCounts, BacklogDocument, JobEntry};
use super::tracker::TrackerDocument;
use crate::fsio;
use crate::layout::WorkspaceLayout;

/// Point-in-time view of the backlog.
#[derive(Debug, Clone)]
pub struct BacklogSnapshot {
    /// Parsed document.
    pub document: BacklogDocument,
    /// Entry counts by status.
    pub counts: BacklogCounts,
}

/// Held advisory lock on `.queue.lock`; released on drop.
struct QueueLock {
    file: File,
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Handle to a workspace's backlog documents.
#[derive(Debug, Clone)]
pub struct BacklogStore {
    layout: WorkspaceLayout,
    no_auto_companies: Vec<String>,
    max_size: u64,
}

impl BacklogStore {
    /// Store over `layout`. `no_auto_companies` marks entries of those
    /// companies as not auto-appliable on every read.
    pub fn new(layout: WorkspaceLayout, no_auto_companies: Vec<String>) -> Self {
        Self {
            layout,
            no_auto_companies,
            max_size: fsio::MAX_DOCUMENT_SIZE,
        }
    }

    /// Workspace layout this store operates on.
    pub const fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    fn lock(&self, exclusive: bool) -> Result<QueueLock, BacklogError> {
        let path = &self.layout.queue_lock;
        let file = fsio::open_lock_file(path)
            .map_err(|e| BacklogError::io(format!("open {}", path.display()), e))?;
        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|e| BacklogError::io(format!("lock {}", path.display()), e))?;
        Ok(QueueLock { file })
    }

    fn load_document(&self) -> Result<BacklogDocument, BacklogError> {
        let path = &self.layout.queue;
        let content = fsio::bounded_read_to_string(path, self.max_size)
            .map_err(|e| BacklogError::io(format!("read {}", path.display()), e))?;
        let mut document = BacklogDocument::parse(content.as_deref().unwrap_or_default());
        document.apply_no_auto_companies(&self.no_auto_companies);
        Ok(document)
    }

    fn load_text(&self, path: &std::path::Path) -> Result<Option<String>, BacklogError> {
        fsio::bounded_read_to_string(path, self.max_size)
            .map_err(|e| BacklogError::io(format!("read {}", path.display()), e))
    }

    /// Read the backlog under a shared lock.
    ///
    /// A missing document reads as an empty backlog.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError::Io`] if the lock or the document cannot be
    /// read.
    pub fn read(&self) -> Result<BacklogSnapshot, BacklogError> {
        let _guard = self.lock(false)?;
        let document = self.load_document()?;
        let counts = document.counts();
        Ok(BacklogSnapshot { document, counts })
    }

    /// Read the dedup index under a shared lock.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError::Io`] if the lock or the index cannot be read.
    pub fn read_dedup(&self) -> Result<DedupIndex, BacklogError> {
        let _guard = self.lock(false)?;
        Ok(DedupIndex::parse(
            &self.load_text(&self.layout.dedup)?.unwrap_or_default(),
        ))
    }

    /// Replace the whole backlog document under an exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError::Io`] if locking or writing fails.
    pub fn rewrite(&self, content: &str) -> Result<(), BacklogError> {
        let _guard = self.lock(true)?;
        self.write(&self.layout.queue, content)
    }

    fn write(&self, path: &std::path::Path, content: &str) -> Result<(), BacklogError> {
        fsio::atomic_write(path, content.as_bytes())
            .map_err(|e| BacklogError::io(format!("write {}", path.display()), e))
    }

    /// Run `f` against a fresh read of the backlog while holding the exclusive
    /// lock, then persist whatever it changed.
    ///
    /// Side documents touched through the [`Transaction`] are written under the
    /// same lock: archive appends first, then the dedup index and tracker, and
    /// the live backlog last. Nothing is written if `f` fails.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or [`BacklogError::Io`] on lock, read or
    /// write failure.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, BacklogError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, BacklogError>,
    {
        let _guard = self.lock(true)?;
        let document = self.load_document()?;
        let original = document.render();
        let mut tx = Transaction {
            store: self,
            document,
            dedup: None,
            tracker: None,
            archive: Vec::new(),
        };
        let out = f(&mut tx)?;
        tx.commit(&original)?;
        Ok(out)
    }
}

/// Mutable view of the backlog and its side documents inside
/// [`BacklogStore::transaction`].
pub struct Transaction<'a> {
    store: &'a BacklogStore,
    /// Live backlog as read at the start of the transaction.
    pub document: BacklogDocument,
    dedup: Option<(DedupIndex, String)>,
    tracker: Option<Option<(TrackerDocument, String)>>,
    archive: Vec<String>,
}

impl Transaction<'_> {
    /// Dedup index, loaded on first use.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError::Io`] if the index cannot be read.
    pub fn dedup(&mut self) -> Result<&mut DedupIndex, BacklogError> {
        let loaded = match self.dedup.take() {
            Some(loaded) => loaded,
            None => {
                let text = self
                    .store
                    .load_text(&self.store.layout.dedup)?
                    .unwrap_or_default();
                (DedupIndex::parse(&text), text)
            },
        };
        Ok(&mut self.dedup.insert(loaded).0)
    }

    /// Replace the dedup index wholesale.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError::Io`] if the current index cannot be read.
    pub fn replace_dedup(&mut self, index: DedupIndex) -> Result<(), BacklogError> {
        *self.dedup()? = index;
        Ok(())
    }

    /// Application tracker, or `None` when the workspace has no tracker.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError::Io`] if the tracker exists but cannot be read.
    pub fn tracker(&mut self) -> Result<Option<&mut TrackerDocument>, BacklogError> {
        let loaded = match self.tracker.take() {
            Some(loaded) => loaded,
            None => self
                .store
                .load_text(&self.store.layout.tracker)?
                .map(|text| (TrackerDocument::parse(&text), text)),
        };
        Ok(self
            .tracker
            .insert(loaded)
            .as_mut()
            .map(|(tracker, _)| tracker))
    }

    /// Entries currently in the archive document.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError::Io`] if the archive exists but cannot be read.
    pub fn archived_entries(&self) -> Result<Vec<JobEntry>, BacklogError> {
        let text = self
            .store
            .load_text(&self.store.layout.archive)?
            .unwrap_or_default();
        Ok(archive::parse_entries(&text))
    }

    /// Queue `text` for appending to the archive on commit.
    pub fn append_archive(&mut self, text: String) {
        if !text.is_empty() {
            self.archive.push(text);
        }
    }

    fn commit(self, original: &str) -> Result<(), BacklogError> {
        let store = self.store;
        let layout = &store.layout;
        for chunk in &self.archive {
            fsio::append(&layout.archive, chunk.as_bytes()).map_err(|e| {
                BacklogError::io(format!("append {}", layout.archive.display()), e)
            })?;
        }
        if let Some((index, before)) = &self.dedup {
            let rendered = index.render();
            if rendered != *before {
                store.write(&layout.dedup, &rendered)?;
                debug!(path = %layout.dedup.display(), "dedup index rewritten");
            }
        }
        if let Some(Some((tracker, before))) = &self.tracker {
            let rendered = tracker.render();
            if rendered != *before {
                store.write(&layout.tracker, &rendered)?;
                debug!(path = %layout.tracker.display(), "tracker rewritten");
            }
        }
        let rendered = self.document.render();
        if rendered != original {
            store.write(&layout.queue, &rendered)?;
            debug!(path = %layout.queue.display(), "backlog rewritten");
        }
        Ok(())
    }
}
