//! Filesystem primitives shared by every store in the crate.
//!
//! All persisted documents are replaced through [`atomic_write`] (temp file in
//! the target directory, fsync, rename) so readers never observe a partially
//! written file. Reads of collaborator-owned files go through
//! [`bounded_read_to_string`] to cap memory use on crafted inputs.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum size of any document read by the core (16 MiB).
pub const MAX_DOCUMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Seconds since the Unix epoch, with sub-second precision.
pub fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// RFC 3339 UTC timestamp with millisecond precision for `epoch_secs`.
pub fn epoch_to_rfc3339(epoch_secs: f64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis((epoch_secs * 1000.0) as i64)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Whole seconds since the Unix epoch.
pub fn current_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Modification time of `path` as epoch seconds.
pub fn mtime_epoch_secs(path: &Path) -> io::Result<f64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0))
}

/// Create a directory tree with mode 0o700 on Unix.
pub fn create_dir_restricted(path: &Path) -> io::Result<()> {
    if let Ok(metadata) = fs::symlink_metadata(path) {
        if metadata.is_dir() {
            return Ok(());
        }
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path exists but is not a directory: {}", path.display()),
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)
    }
}

/// Atomic write: temp file in the target's directory, fsync, then rename.
pub fn atomic_write(target: &Path, data: &[u8]) -> io::Result<()> {
    if fs::symlink_metadata(target).is_ok_and(|m| m.is_dir()) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("target path is a directory: {}", target.display()),
        ));
    }
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    create_dir_restricted(parent)?;

    let temp = tempfile::NamedTempFile::new_in(parent)?;
    let mut file = temp.as_file();
    file.write_all(data)?;
    file.sync_all()?;
    temp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Append `data` to `path`, creating the file (and its directory) if needed.
pub fn append(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_restricted(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(data)?;
    file.flush()
}

/// Read a UTF-8 file with a size bound.
///
/// Returns `Ok(None)` when the file does not exist.
pub fn bounded_read_to_string(path: &Path, max_size: u64) -> io::Result<Option<String>> {
    Ok(bounded_read_with_mtime(path, max_size)?.map(|(content, _)| content))
}

/// [`bounded_read_to_string`] plus the file's modification time as epoch
/// seconds, both taken from the same open handle.
pub fn bounded_read_with_mtime(path: &Path, max_size: u64) -> io::Result<Option<(String, f64)>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mtime = file
        .metadata()?
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let mut buf = Vec::new();
    file.take(max_size.saturating_add(1)).read_to_end(&mut buf)?;
    if buf.len() as u64 > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "file {} exceeds maximum size {max_size} bytes",
                path.display()
            ),
        ));
    }
    String::from_utf8(buf)
        .map(|content| Some((content, mtime)))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Remove a file, treating "already gone" as success.
///
/// Returns whether a file was actually removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Open (creating if needed) a lock file used only as an flock target.
pub fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_restricted(parent)?;
    }
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Best-effort hostname for lock diagnostics.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content_and_creates_parents() {
        let dir = tempfile::tempdir().expect("temp dir");
        let target = dir.path().join("nested").join("doc.md");

        atomic_write(&target, b"first").expect("first write");
        atomic_write(&target, b"second").expect("second write");

        assert_eq!(fs::read_to_string(&target).expect("read"), "second");
        let leftovers: Vec<_> = fs::read_dir(target.parent().expect("parent"))
            .expect("read dir")
            .collect();
        assert_eq!(leftovers.len(), 1, "no temp files left behind");
    }

    #[test]
    fn atomic_write_rejects_directory_target() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = atomic_write(dir.path(), b"x").expect_err("directory target");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn bounded_read_missing_file_is_none() {
        let dir = tempfile::tempdir().expect("temp dir");
        let got = bounded_read_to_string(&dir.path().join("absent"), 1024).expect("read");
        assert!(got.is_none());
    }

    #[test]
    fn bounded_read_rejects_oversized_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("big");
        fs::write(&path, vec![b'a'; 64]).expect("write");

        let err = bounded_read_to_string(&path, 16).expect_err("too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(
            bounded_read_to_string(&path, 64).expect("fits").as_deref(),
            Some("a".repeat(64).as_str())
        );
    }

    #[test]
    fn remove_if_exists_is_idempotent() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("f");
        fs::write(&path, "x").expect("write");
        assert!(remove_if_exists(&path).expect("remove"));
        assert!(!remove_if_exists(&path).expect("second remove"));
    }

    #[test]
    fn append_accumulates_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("logs").join("a.jsonl");
        append(&path, b"one\n").expect("append");
        append(&path, b"two\n").expect("append");
        assert_eq!(fs::read_to_string(&path).expect("read"), "one\ntwo\n");
    }
}
