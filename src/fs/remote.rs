use std::path::Path;

use crate::error::FsError;
use crate::fs::{not_found, DiskUsage, FileStat};
use crate::session::{quote_path, Channel, CommandOutput};

const NOT_FOUND_STATUS: i32 = 66;
const NOT_A_DIRECTORY_STATUS: i32 = 67;

fn guard(full: &Path, directory: bool) -> String {
    let p = quote_path(full);
    let mut script = format!("[ -e {p} ] || exit {};", NOT_FOUND_STATUS);
    if directory {
        script.push_str(&format!(" [ -d {p} ] || exit {};", NOT_A_DIRECTORY_STATUS));
    }
    script
}

async fn run(channel: &dyn Channel, script: String, display: &str) -> Result<CommandOutput, FsError> {
    let output = channel.exec(&script).await?;
    match output.status {
        Some(0) => Ok(output),
        Some(NOT_FOUND_STATUS) => Err(not_found(display)),
        Some(NOT_A_DIRECTORY_STATUS) => Err(FsError::NotADirectory(display.into())),
        _ => Err(FsError::UnexpectedOutput {
            command: script,
            output: output.describe_failure(),
        }),
    }
}

/// Splits `find -print0` output into paths relative to the search root.
fn split_entries(stdout: &[u8]) -> Vec<String> {
    let mut entries = vec![];
    let mut start = 0;
    for end in memchr::memchr_iter(0, stdout) {
        let raw = String::from_utf8_lossy(&stdout[start..end]);
        let rel = raw.strip_prefix("./").unwrap_or(&raw);
        if !rel.is_empty() && rel != "." {
            entries.push(rel.to_string());
        }
        start = end + 1;
    }
    entries
}

pub(super) async fn list(
    channel: &dyn Channel,
    full: &Path,
    display: &str,
) -> Result<Vec<String>, FsError> {
    let script = format!(
        "{} cd {} && find . -mindepth 1 -maxdepth 1 -print0",
        guard(full, true),
        quote_path(full)
    );
    let output = run(channel, script, display).await?;
    Ok(split_entries(&output.stdout))
}

pub(super) async fn walk(
    channel: &dyn Channel,
    full: &Path,
    display: &str,
    files_only: bool,
) -> Result<Vec<String>, FsError> {
    let script = format!(
        "{} cd {} && find . -mindepth 1{} -print0",
        guard(full, true),
        quote_path(full),
        if files_only { " -type f" } else { "" }
    );
    let output = run(channel, script, display).await?;
    Ok(split_entries(&output.stdout))
}

pub(super) async fn stat(
    channel: &dyn Channel,
    full: &Path,
    display: &str,
) -> Result<FileStat, FsError> {
    let script = format!(
        "{} stat -L -c '%s %Y %f %a' {}",
        guard(full, false),
        quote_path(full)
    );
    let output = run(channel, script.clone(), display).await?;
    let text = output.stdout_lossy();
    parse_stat(text.trim()).ok_or(FsError::UnexpectedOutput {
        command: script,
        output: text,
    })
}

fn parse_stat(line: &str) -> Option<FileStat> {
    let mut fields = line.split_whitespace();
    let size = fields.next()?.parse().ok()?;
    let modified = fields.next()?.parse().ok()?;
    let mode = u32::from_str_radix(fields.next()?, 16).ok()?;
    let permissions = u32::from_str_radix(fields.next()?, 8).ok()?;
    Some(FileStat {
        size,
        modified,
        is_directory: mode & 0o170000 == 0o040000,
        permissions: permissions & 0o7777,
    })
}

pub(super) async fn disk_usage(
    channel: &dyn Channel,
    full: &Path,
    display: &str,
) -> Result<DiskUsage, FsError> {
    let script = format!(
        "{} find {} -type f -printf '%s\\n'",
        guard(full, false),
        quote_path(full)
    );
    let output = run(channel, script.clone(), display).await?;
    let mut usage = DiskUsage::default();
    for line in output.stdout_lossy().lines().filter(|l| !l.is_empty()) {
        let size: u64 = line.trim().parse().map_err(|_| FsError::UnexpectedOutput {
            command: script.clone(),
            output: line.to_string(),
        })?;
        usage.total_bytes += size;
        usage.file_count += 1;
    }
    Ok(usage)
}

/// `test` with one of `-e`, `-d`, `-f`.
pub(super) async fn test(channel: &dyn Channel, full: &Path, flag: &str) -> Result<bool, FsError> {
    let script = format!("[ {} {} ]", flag, quote_path(full));
    let output = channel.exec(&script).await?;
    match output.status {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(FsError::UnexpectedOutput {
            command: script,
            output: output.describe_failure(),
        }),
    }
}
