//! Unified filesystem accessor.
//!
//! The same nine operations work against any target. Local targets map to
//! `std::fs` and `walkdir`; every other target turns each operation into one
//! shell command on the target's channel and parses the output back into the
//! same shapes. Pattern matching always happens here, on this side, so both
//! paths agree on what a pattern means.
//!
//! The Python twin of this module (`clusterfn_fs.py`) ships inside every
//! package and gives the remote function the same operations.

mod local;
mod remote;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};

use crate::error::FsError;
use crate::session::{self, Channel};
use crate::target::ExecutionTarget;

/// Module name of the Python accessor inside a package.
pub const PYTHON_MODULE_NAME: &str = "clusterfn_fs";

/// Source of the Python accessor.
pub const PYTHON_MODULE_SOURCE: &str = include_str!("fs/clusterfn_fs.py");

/// The public accessor functions, by their Python names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FsFunction {
    #[serde(rename = "list")]
    List,
    #[serde(rename = "find")]
    Find,
    #[serde(rename = "stat")]
    Stat,
    #[serde(rename = "exists")]
    Exists,
    #[serde(rename = "isDirectory")]
    IsDirectory,
    #[serde(rename = "isFile")]
    IsFile,
    #[serde(rename = "glob")]
    Glob,
    #[serde(rename = "diskUsage")]
    DiskUsage,
    #[serde(rename = "countMatching")]
    CountMatching,
}

impl FsFunction {
    pub const ALL: [FsFunction; 9] = [
        FsFunction::List,
        FsFunction::Find,
        FsFunction::Stat,
        FsFunction::Exists,
        FsFunction::IsDirectory,
        FsFunction::IsFile,
        FsFunction::Glob,
        FsFunction::DiskUsage,
        FsFunction::CountMatching,
    ];

    pub fn python_name(self) -> &'static str {
        match self {
            FsFunction::List => "list",
            FsFunction::Find => "find",
            FsFunction::Stat => "stat",
            FsFunction::Exists => "exists",
            FsFunction::IsDirectory => "isDirectory",
            FsFunction::IsFile => "isFile",
            FsFunction::Glob => "glob",
            FsFunction::DiskUsage => "diskUsage",
            FsFunction::CountMatching => "countMatching",
        }
    }

    pub fn from_python_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.python_name() == name)
    }
}

impl fmt::Display for FsFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.python_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub size: u64,
    /// Modification time in whole seconds since the Unix epoch.
    #[serde(rename = "modifiedTime")]
    pub modified: i64,
    pub is_directory: bool,
    /// Permission bits (`mode & 0o7777`).
    pub permissions: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub file_count: u64,
}

enum Backend {
    Local,
    Remote(Arc<dyn Channel>),
}

/// Filesystem operations bound to one target.
pub struct FileSystem {
    target: Arc<ExecutionTarget>,
    backend: Backend,
}

impl FileSystem {
    /// Binds a target. Remote targets need the channel they are reached by;
    /// local targets must not be given one.
    pub fn new(
        target: Arc<ExecutionTarget>,
        channel: Option<Arc<dyn Channel>>,
    ) -> Result<Self, FsError> {
        let backend = match (target.is_remote(), channel) {
            (false, None) => Backend::Local,
            (true, Some(channel)) => Backend::Remote(channel),
            (false, Some(_)) => {
                return Err(FsError::UnexpectedOutput {
                    command: "bind".to_string(),
                    output: format!("target '{}' is local but a channel was given", target.name),
                })
            }
            (true, None) => {
                return Err(FsError::UnexpectedOutput {
                    command: "bind".to_string(),
                    output: format!("target '{}' is remote but has no channel", target.name),
                })
            }
        };
        Ok(Self { target, backend })
    }

    /// Binds a target, opening its channel if it needs one.
    pub async fn connect(target: Arc<ExecutionTarget>) -> Result<Self, FsError> {
        let channel = if target.is_remote() {
            Some(session::connect(&target).await?)
        } else {
            None
        };
        Self::new(target, channel)
    }

    pub fn target(&self) -> &ExecutionTarget {
        &self.target
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.target.resolve(path)
    }

    /// Names of the entries of a directory, sorted.
    pub async fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        let full = self.resolve(path);
        let mut names = match &self.backend {
            Backend::Local => {
                let display = PathBuf::from(path);
                local::blocking(move || local::list(&full, &display)).await?
            }
            Backend::Remote(channel) => remote::list(channel.as_ref(), &full, path).await?,
        };
        names.sort();
        Ok(names)
    }

    /// Entries anywhere below `path` whose name matches `pattern`.
    pub async fn find(&self, pattern: &str, path: &str) -> Result<Vec<String>, FsError> {
        let matcher = name_matcher(pattern)?;
        let entries = self.walk(path, false).await?;
        Ok(collect_matches(path, entries, |rel| {
            matcher.is_match(base_name(rel))
        }))
    }

    pub async fn stat(&self, path: &str) -> Result<FileStat, FsError> {
        let full = self.resolve(path);
        match &self.backend {
            Backend::Local => {
                let display = PathBuf::from(path);
                local::blocking(move || local::stat(&full, &display)).await
            }
            Backend::Remote(channel) => remote::stat(channel.as_ref(), &full, path).await,
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool, FsError> {
        self.test(path, "-e").await
    }

    pub async fn is_directory(&self, path: &str) -> Result<bool, FsError> {
        self.test(path, "-d").await
    }

    pub async fn is_file(&self, path: &str) -> Result<bool, FsError> {
        self.test(path, "-f").await
    }

    /// Paths below `path` matching `pattern` relative to it. `*` stays
    /// within one path component, `**` spans any number of them.
    pub async fn glob(&self, pattern: &str, path: &str) -> Result<Vec<String>, FsError> {
        let matcher = path_matcher(pattern)?;
        let entries = self.walk(path, false).await?;
        Ok(collect_matches(path, entries, |rel| matcher.is_match(rel)))
    }

    /// Total size and number of regular files at or below `path`.
    pub async fn disk_usage(&self, path: &str) -> Result<DiskUsage, FsError> {
        let full = self.resolve(path);
        match &self.backend {
            Backend::Local => {
                let display = PathBuf::from(path);
                local::blocking(move || local::disk_usage(&full, &display)).await
            }
            Backend::Remote(channel) => remote::disk_usage(channel.as_ref(), &full, path).await,
        }
    }

    /// Number of regular files below `path` whose name matches `pattern`.
    pub async fn count_matching(&self, path: &str, pattern: &str) -> Result<usize, FsError> {
        let matcher = name_matcher(pattern)?;
        let entries = self.walk(path, true).await?;
        Ok(entries
            .iter()
            .filter(|rel| matcher.is_match(base_name(rel)))
            .count())
    }

    async fn test(&self, path: &str, flag: &'static str) -> Result<bool, FsError> {
        let full = self.resolve(path);
        match &self.backend {
            Backend::Local => local::blocking(move || Ok(local::test(&full, flag))).await,
            Backend::Remote(channel) => remote::test(channel.as_ref(), &full, flag).await,
        }
    }

    /// Paths relative to `path` of every entry below it.
    async fn walk(&self, path: &str, files_only: bool) -> Result<Vec<String>, FsError> {
        let full = self.resolve(path);
        match &self.backend {
            Backend::Local => {
                let display = PathBuf::from(path);
                local::blocking(move || local::walk(&full, &display, files_only)).await
            }
            Backend::Remote(channel) => {
                remote::walk(channel.as_ref(), &full, path, files_only).await
            }
        }
    }
}

fn name_matcher(pattern: &str) -> Result<GlobMatcher, FsError> {
    build_matcher(pattern, false)
}

fn path_matcher(pattern: &str) -> Result<GlobMatcher, FsError> {
    build_matcher(pattern, true)
}

fn build_matcher(pattern: &str, literal_separator: bool) -> Result<GlobMatcher, FsError> {
    GlobBuilder::new(pattern)
        .literal_separator(literal_separator)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|source| FsError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

fn base_name(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

/// Joins a result onto the path the caller asked about, the way the caller
/// wrote it.
pub(crate) fn display_join(path: &str, rel: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        format!("/{}", rel)
    } else if trimmed.is_empty() || trimmed == "." {
        rel.to_string()
    } else {
        format!("{}/{}", trimmed, rel)
    }
}

fn collect_matches(
    path: &str,
    entries: Vec<String>,
    mut keep: impl FnMut(&str) -> bool,
) -> Vec<String> {
    let mut matches: Vec<String> = entries
        .into_iter()
        .filter(|rel| keep(rel))
        .map(|rel| display_join(path, &rel))
        .collect();
    matches.sort();
    matches
}

fn not_found(path: &str) -> FsError {
    FsError::NotFound(Path::new(path).to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::session::LocalChannel;
    use crate::target::{Connection, ExecutionTarget};

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("data/nested")).unwrap();
        std::fs::write(root.join("data/a.csv"), "1,2\n").unwrap();
        std::fs::write(root.join("data/b.csv"), "3,4,5\n").unwrap();
        std::fs::write(root.join("data/nested/c.csv"), "6\n").unwrap();
        std::fs::write(root.join("data/notes.txt"), "hello").unwrap();
        std::fs::write(root.join("data/.hidden"), "").unwrap();
        dir
    }

    fn local_fs(root: &Path) -> FileSystem {
        FileSystem::new(Arc::new(ExecutionTarget::local(root)), None).unwrap()
    }

    /// A "remote" target whose channel is a local shell, so the command
    /// translation path runs against real files.
    fn fake_remote_fs(root: &Path) -> FileSystem {
        let target = ExecutionTarget::ssh(Connection::new("fake"), root);
        let channel: Arc<dyn Channel> =
            Arc::new(LocalChannel::new("fake", Duration::from_secs(30)));
        FileSystem::new(Arc::new(target), Some(channel)).unwrap()
    }

    #[test]
    fn test_python_names_round_trip() {
        for function in FsFunction::ALL {
            assert_eq!(
                FsFunction::from_python_name(function.python_name()),
                Some(function)
            );
        }
        assert_eq!(FsFunction::from_python_name("listdir"), None);
        assert_eq!(
            serde_json::to_string(&FsFunction::CountMatching).unwrap(),
            "\"countMatching\""
        );
    }

    #[test]
    fn test_display_join() {
        assert_eq!(display_join("data/", "a.csv"), "data/a.csv");
        assert_eq!(display_join("data", "x/a.csv"), "data/x/a.csv");
        assert_eq!(display_join(".", "a.csv"), "a.csv");
        assert_eq!(display_join("", "a.csv"), "a.csv");
        assert_eq!(display_join("/", "tmp"), "/tmp");
    }

    #[test]
    fn test_binding_requires_matching_channel() {
        let dir = tempfile::tempdir().unwrap();
        let channel: Arc<dyn Channel> =
            Arc::new(LocalChannel::new("x", Duration::from_secs(1)));
        let local = Arc::new(ExecutionTarget::local(dir.path()));
        assert!(FileSystem::new(local, Some(channel)).is_err());
        let remote = Arc::new(ExecutionTarget::ssh(Connection::new("h"), dir.path()));
        assert!(FileSystem::new(remote, None).is_err());
    }

    #[tokio::test]
    async fn test_find_csv_local_and_fake_remote() {
        let dir = fixture();
        let expected = vec![
            "data/a.csv".to_string(),
            "data/b.csv".to_string(),
            "data/nested/c.csv".to_string(),
        ];
        let local = local_fs(dir.path());
        assert_eq!(local.find("*.csv", "data/").await.unwrap(), expected);
        let remote = fake_remote_fs(dir.path());
        assert_eq!(remote.find("*.csv", "data/").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_backends_agree() {
        let dir = fixture();
        let local = local_fs(dir.path());
        let remote = fake_remote_fs(dir.path());

        assert_eq!(
            local.list("data").await.unwrap(),
            remote.list("data").await.unwrap()
        );
        assert_eq!(
            local.glob("**/*.csv", "data").await.unwrap(),
            remote.glob("**/*.csv", "data").await.unwrap()
        );
        assert_eq!(
            local.glob("*.csv", "data").await.unwrap(),
            vec!["data/a.csv".to_string(), "data/b.csv".to_string()]
        );
        assert_eq!(
            local.stat("data/b.csv").await.unwrap(),
            remote.stat("data/b.csv").await.unwrap()
        );
        assert_eq!(
            local.stat("data").await.unwrap().is_directory,
            remote.stat("data").await.unwrap().is_directory
        );
        assert_eq!(
            local.disk_usage("data").await.unwrap(),
            remote.disk_usage("data").await.unwrap()
        );
        assert_eq!(
            local.count_matching("data", "*.csv").await.unwrap(),
            remote.count_matching("data", "*.csv").await.unwrap()
        );
        for path in ["data", "data/a.csv", "missing"] {
            assert_eq!(
                local.exists(path).await.unwrap(),
                remote.exists(path).await.unwrap()
            );
            assert_eq!(
                local.is_directory(path).await.unwrap(),
                remote.is_directory(path).await.unwrap()
            );
            assert_eq!(
                local.is_file(path).await.unwrap(),
                remote.is_file(path).await.unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_missing_paths_are_not_found_on_both_backends() {
        let dir = fixture();
        for fs in [local_fs(dir.path()), fake_remote_fs(dir.path())] {
            assert!(matches!(fs.list("nope").await, Err(FsError::NotFound(_))));
            assert!(matches!(fs.stat("nope").await, Err(FsError::NotFound(_))));
            assert!(matches!(
                fs.find("*", "nope").await,
                Err(FsError::NotFound(_))
            ));
            assert!(matches!(
                fs.disk_usage("nope").await,
                Err(FsError::NotFound(_))
            ));
            assert!(matches!(
                fs.list("data/a.csv").await,
                Err(FsError::NotADirectory(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_local_matches_std_fs() {
        let dir = fixture();
        let fs = local_fs(dir.path());

        let mut direct: Vec<String> = std::fs::read_dir(dir.path().join("data"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        direct.sort();
        assert_eq!(fs.list("data").await.unwrap(), direct);

        let metadata = std::fs::metadata(dir.path().join("data/b.csv")).unwrap();
        let stat = fs.stat("data/b.csv").await.unwrap();
        assert_eq!(stat.size, metadata.len());
        assert!(!stat.is_directory);

        let usage = fs.disk_usage("data").await.unwrap();
        assert_eq!(usage.file_count, 5);
        assert_eq!(usage.total_bytes, 4 + 6 + 2 + 5);
        assert_eq!(fs.count_matching("data", "*.csv").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_symlinked_directories_are_not_followed() {
        let dir = fixture();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("big.bin"), vec![0u8; 1024]).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("linked")).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("data/linked")).unwrap();

        let local = local_fs(dir.path());
        let remote = fake_remote_fs(dir.path());
        assert_eq!(local.disk_usage("linked").await.unwrap(), DiskUsage::default());
        assert_eq!(
            local.disk_usage("linked").await.unwrap(),
            remote.disk_usage("linked").await.unwrap()
        );
        let usage = local.disk_usage("data").await.unwrap();
        assert_eq!(usage.file_count, 5);
        assert_eq!(usage, remote.disk_usage("data").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_pattern() {
        let dir = fixture();
        let fs = local_fs(dir.path());
        assert!(matches!(
            fs.find("[", "data").await,
            Err(FsError::InvalidPattern { .. })
        ));
    }
}
