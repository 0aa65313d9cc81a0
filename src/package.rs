//! Turns a dependency graph into a transferable archive.

mod archive;
mod manifest;

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::analyzer::DependencyGraph;
use crate::error::{ClusterError, Result};
use crate::fs::{PYTHON_MODULE_NAME, PYTHON_MODULE_SOURCE};
use crate::target::ExecutionTarget;

pub use manifest::{ArgumentSlot, CallArguments, PackageManifest, Partition, FORMAT_VERSION};

pub const MANIFEST: &str = "manifest.json";
pub const ENTRY_MODULE: &str = "entry.py";
pub const MODULES_DIR: &str = "modules";
pub const FILES_DIR: &str = "files";

/// A built package: its manifest and the compressed archive.
#[derive(Debug, Clone)]
pub struct Package {
    pub manifest: PackageManifest,
    pub archive: Vec<u8>,
}

impl Package {
    pub fn content_id(&self) -> &str {
        &self.manifest.content_id
    }

    /// Archive file name, unique per content.
    pub fn file_name(&self) -> String {
        format!("{}.tar.gz", self.content_id())
    }

    pub fn members(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        Ok(archive::read(&self.archive)?)
    }

    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, &self.archive)?;
        Ok(path)
    }
}

/// Builds the package for one call of the analyzed function.
pub fn build(
    graph: &DependencyGraph,
    target: &ExecutionTarget,
    arguments: CallArguments,
) -> Result<Package> {
    let mut members: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    members.insert(
        ENTRY_MODULE.to_string(),
        graph.entry_module_source().into_bytes(),
    );
    members.insert(
        format!("{}.py", PYTHON_MODULE_NAME),
        PYTHON_MODULE_SOURCE.as_bytes().to_vec(),
    );
    for module in &graph.modules {
        let contents = std::fs::read(&module.path)?;
        members.insert(member_path(MODULES_DIR, &module.relative), contents);
    }
    for reference in &graph.files {
        collect_files(&graph.source_dir, &reference.literal, &mut members)?;
    }

    let mut requirements = graph.requirements.clone();
    requirements.sort();
    let content_id = content_id(&graph.entry.source, &members, &requirements);

    let mut names: Vec<String> = members.keys().cloned().collect();
    names.push(MANIFEST.to_string());
    names.sort();
    let manifest = PackageManifest {
        format_version: FORMAT_VERSION,
        content_id,
        function: graph.entry.name.clone(),
        entry_module: ENTRY_MODULE.to_string(),
        is_async: graph.entry.is_async,
        members: names,
        requirements,
        fs_bindings: graph.fs_bindings().into_iter().collect(),
        arguments,
        partition: None,
        fs_root: None,
        created_at: Utc::now(),
    };
    members.insert(MANIFEST.to_string(), manifest.to_json()?);

    let archive = archive::write(&members)?;
    let size = archive.len() as u64;
    let limit = target.options.max_package_bytes;
    if size > limit {
        return Err(ClusterError::PackageTooLarge { size, limit });
    }
    info!(
        function = %manifest.function,
        content_id = %manifest.content_id,
        members = manifest.members.len(),
        size,
        "Built package"
    );
    Ok(Package { manifest, archive })
}

/// Deterministic identifier of a package's contents.
pub fn content_id(
    entry_source: &str,
    members: &BTreeMap<String, Vec<u8>>,
    requirements: &[crate::analyzer::Requirement],
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(entry_source.as_bytes());
    for (path, contents) in members.iter().filter(|(path, _)| *path != MANIFEST) {
        hasher.update(&(path.len() as u64).to_le_bytes());
        hasher.update(path.as_bytes());
        hasher.update(&(contents.len() as u64).to_le_bytes());
        hasher.update(contents);
    }
    let mut pins: Vec<String> = requirements.iter().map(|r| r.to_string()).collect();
    pins.sort();
    for pin in pins {
        hasher.update(pin.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

fn member_path(dir: &str, relative: &Path) -> String {
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    format!("{}/{}", dir, parts.join("/"))
}

/// Adds the file or directory a string literal names, if it exists.
fn collect_files(
    source_dir: &Path,
    literal: &str,
    members: &mut BTreeMap<String, Vec<u8>>,
) -> Result<()> {
    let relative = Path::new(literal);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        warn!(path = literal, "Only paths relative to the source directory are bundled");
        return Ok(());
    }
    let full = source_dir.join(relative);
    if full.is_file() {
        members.insert(member_path(FILES_DIR, relative), std::fs::read(&full)?);
    } else if full.is_dir() {
        for entry in WalkDir::new(&full).follow_links(false) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(inner) = entry.path().strip_prefix(source_dir) {
                members.insert(member_path(FILES_DIR, inner), std::fs::read(entry.path())?);
            }
        }
    } else {
        debug!(literal, "String literal does not name a file; not bundled");
    }
    Ok(())
}
