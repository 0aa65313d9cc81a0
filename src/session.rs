//! Command channels to execution targets.
//!
//! A `Channel` is the established, authenticated pipe through which every
//! remote operation flows. One channel belongs to one target, and each
//! channel runs one command at a time.

use std::path::Path;
use std::process::Stdio as LocalStdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use openssh::{KnownHosts, Session as SSHSession, SessionBuilder, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::target::{Connection, ExecutionTarget};

/// Exit status used by `read_file` when the file does not exist.
const MISSING_FILE_STATUS: i32 = 44;

/// Number of connection attempts before giving up.
const CONNECT_ATTEMPTS: u32 = 3;

/// Output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code; `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Stderr if there is any, otherwise the exit status. For error messages.
    pub fn describe_failure(&self) -> String {
        let stderr = self.stderr_lossy();
        if !stderr.is_empty() {
            return stderr;
        }
        match self.status {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Human readable name of the other end, for logs and errors.
    fn name(&self) -> &str;

    /// Runs a POSIX shell script and collects its output.
    async fn exec(&self, script: &str) -> Result<CommandOutput, ChannelError>;

    /// Creates or replaces a file with the given contents.
    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), ChannelError>;

    /// Reads a whole file. `Ok(None)` if it does not exist.
    async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, ChannelError> {
        let quoted = quote_path(path);
        let script = format!(
            "[ -f {p} ] || exit {code}; cat {p}",
            p = quoted,
            code = MISSING_FILE_STATUS
        );
        let output = self.exec(&script).await?;
        match output.status {
            Some(0) => Ok(Some(output.stdout)),
            Some(MISSING_FILE_STATUS) => Ok(None),
            _ => Err(ChannelError::Failed(format!(
                "reading {} on {} failed: {}",
                path.display(),
                self.name(),
                output.describe_failure()
            ))),
        }
    }

    async fn close(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Quotes a string for a POSIX shell.
pub fn quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+@%".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

pub fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// Quotes each word and joins them into one command line.
pub fn quote_all<S: AsRef<str>>(words: impl IntoIterator<Item = S>) -> String {
    words.into_iter().map(|w| quote(w.as_ref())).join(" ")
}

/// Runs commands on this machine through `sh -c`.
///
/// Used for local targets, for schedulers whose login node is the current
/// machine, and as a stand-in remote end in tests.
pub struct LocalChannel {
    name: String,
    timeout: Duration,
    lock: Mutex<()>,
}

impl LocalChannel {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exec(&self, script: &str) -> Result<CommandOutput, ChannelError> {
        let _guard = self.lock.lock().await;
        debug!(target_name = %self.name, script, "local exec");
        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .stdin(LocalStdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => Ok(output?.into()),
            Err(_) => Err(ChannelError::Timeout {
                target: self.name.clone(),
                timeout: self.timeout,
            }),
        }
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), ChannelError> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }
}

/// An SSH connection multiplexed through the system `ssh` client.
pub struct SshChannel {
    name: String,
    timeout: Duration,
    /// Commands on one session are serialized.
    session: Mutex<Option<SSHSession>>,
}

impl SshChannel {
    pub async fn connect(connection: &Connection, timeout: Duration) -> Result<Self, ChannelError> {
        let name = connection.destination();
        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Add);
        builder.connect_timeout(timeout);
        if let Some(user) = &connection.user {
            builder.user(user.clone());
        }
        if let Some(port) = connection.port {
            builder.port(port);
        }
        if let Some(keyfile) = &connection.identity_file {
            builder.keyfile(keyfile);
        }

        let mut delay = Duration::from_millis(200);
        let mut attempt = 1;
        let session = loop {
            match builder.connect_mux(&connection.host).await {
                Ok(session) => break session,
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    warn!(host = %name, attempt, error = %e, "Failed to connect, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };
        info!(host = %name, "Connected to host.");
        Ok(Self {
            name,
            timeout,
            session: Mutex::new(Some(session)),
        })
    }

    fn timed_out(&self) -> ChannelError {
        ChannelError::Timeout {
            target: self.name.clone(),
            timeout: self.timeout,
        }
    }
}

#[async_trait]
impl Channel for SshChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exec(&self, script: &str) -> Result<CommandOutput, ChannelError> {
        let guard = self.session.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| ChannelError::Closed(self.name.clone()))?;
        debug!(host = %self.name, script, "ssh exec");
        let mut command = session.command("sh");
        command.arg("-c").arg(script).stdin(Stdio::null());
        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => Ok(output?.into()),
            Err(_) => Err(self.timed_out()),
        }
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), ChannelError> {
        let guard = self.session.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| ChannelError::Closed(self.name.clone()))?;
        let script = match path.parent() {
            Some(parent) => format!(
                "mkdir -p {} && cat > {}",
                quote_path(parent),
                quote_path(path)
            ),
            None => format!("cat > {}", quote_path(path)),
        };
        let upload = upload(session, &script, contents, path);
        match tokio::time::timeout(self.timeout, upload).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out()),
        }
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if let Some(session) = self.session.lock().await.take() {
            info!(host = %self.name, "Terminating connection.");
            session.close().await?;
        }
        Ok(())
    }
}

async fn upload(
    session: &SSHSession,
    script: &str,
    contents: &[u8],
    path: &Path,
) -> Result<(), ChannelError> {
    let mut command = session.command("sh");
    command
        .arg("-c")
        .arg(script)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    let mut child = command.spawn().await?;
    if let Some(mut stdin) = child.stdin().take() {
        stdin.write_all(contents).await?;
        stdin.shutdown().await?;
    }
    let output = child.wait_with_output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ChannelError::Failed(format!(
            "writing {} failed: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Opens the channel a target's operations go through.
///
/// Targets without connection parameters run on this machine.
pub async fn connect(target: &ExecutionTarget) -> Result<Arc<dyn Channel>, ChannelError> {
    let timeout = target.options.command_timeout();
    match &target.connection {
        Some(connection) => Ok(Arc::new(SshChannel::connect(connection, timeout).await?)),
        None => Ok(Arc::new(LocalChannel::new(target.name.clone(), timeout))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain_words_untouched() {
        assert_eq!(quote("data/input.csv"), "data/input.csv");
        assert_eq!(quote("--mem=4G"), "--mem=4G");
    }

    #[test]
    fn test_quote_special_characters() {
        assert_eq!(quote("*.csv"), "'*.csv'");
        assert_eq!(quote("it's"), r#"'it'\''s'"#);
        assert_eq!(quote(""), "''");
        assert_eq!(quote("a b"), "'a b'");
    }

    #[tokio::test]
    async fn test_local_exec_collects_output() {
        let channel = LocalChannel::new("local", Duration::from_secs(10));
        let output = channel.exec("echo hello; echo oops >&2; exit 3").await.unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout_lossy(), "hello\n");
        assert_eq!(output.describe_failure(), "oops");
    }

    #[tokio::test]
    async fn test_local_read_write_file() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalChannel::new("local", Duration::from_secs(10));
        let path = dir.path().join("nested").join("it's.txt");
        assert!(channel.read_file(&path).await.unwrap().is_none());
        channel.write_file(&path, b"payload").await.unwrap();
        assert_eq!(channel.read_file(&path).await.unwrap().unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_local_exec_times_out() {
        let channel = LocalChannel::new("slow", Duration::from_millis(50));
        let err = channel.exec("sleep 5").await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));
    }
}
