use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;

use crate::error::FsError;
use crate::fs::{DiskUsage, FileStat};

/// Runs a blocking filesystem walk off the async workers.
pub(super) async fn blocking<T, F>(f: F) -> Result<T, FsError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, FsError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FsError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

fn map_io(err: io::Error, display: &Path) -> FsError {
    if err.kind() == io::ErrorKind::NotFound {
        FsError::NotFound(display.to_path_buf())
    } else {
        FsError::Io(err)
    }
}

fn require_directory(full: &Path, display: &Path) -> Result<(), FsError> {
    let metadata = std::fs::metadata(full).map_err(|e| map_io(e, display))?;
    if metadata.is_dir() {
        Ok(())
    } else {
        Err(FsError::NotADirectory(display.to_path_buf()))
    }
}

pub(super) fn list(full: &Path, display: &Path) -> Result<Vec<String>, FsError> {
    require_directory(full, display)?;
    let mut names = vec![];
    for entry in std::fs::read_dir(full).map_err(|e| map_io(e, display))? {
        let entry = entry?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

pub(super) fn walk(full: &Path, display: &Path, files_only: bool) -> Result<Vec<String>, FsError> {
    require_directory(full, display)?;
    let mut entries = vec![];
    for entry in WalkDir::new(full).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| FsError::Io(e.into()))?;
        if files_only && !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(full) {
            entries.push(rel.to_string_lossy().into_owned());
        }
    }
    Ok(entries)
}

pub(super) fn stat(full: &Path, display: &Path) -> Result<FileStat, FsError> {
    let metadata = std::fs::metadata(full).map_err(|e| map_io(e, display))?;
    let modified = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(FileStat {
        size: metadata.len(),
        modified,
        is_directory: metadata.is_dir(),
        permissions: metadata.permissions().mode() & 0o7777,
    })
}

pub(super) fn disk_usage(full: &Path, display: &Path) -> Result<DiskUsage, FsError> {
    std::fs::metadata(full).map_err(|e| map_io(e, display))?;
    let mut usage = DiskUsage::default();
    // A symlinked root counts as the link itself, as `find -P` does.
    let walker = WalkDir::new(full)
        .follow_links(false)
        .follow_root_links(false);
    for entry in walker {
        let entry = entry.map_err(|e| FsError::Io(e.into()))?;
        if entry.file_type().is_file() {
            let metadata = entry.metadata().map_err(|e| FsError::Io(e.into()))?;
            usage.total_bytes += metadata.len();
            usage.file_count += 1;
        }
    }
    Ok(usage)
}

/// Local counterpart of `test -e`, `test -d` and `test -f`.
pub(super) fn test(full: &Path, flag: &str) -> bool {
    match flag {
        "-d" => full.is_dir(),
        "-f" => full.is_file(),
        _ => full.exists(),
    }
}
