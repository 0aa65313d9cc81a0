use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::session::{quote_path, Channel};

/// How long to wait between attempts to take a lock.
const LOCK_RETRY: Duration = Duration::from_secs(1);

/// A lock held by the existence of a directory on the target.
///
/// `mkdir` either creates the directory or fails, atomically, on local and
/// network filesystems alike, so two builders racing for the same
/// environment serialize on it.
pub struct LockedDir {
    channel: Arc<dyn Channel>,
    /// Path to the lock directory.
    path: PathBuf,
    released: bool,
}

impl LockedDir {
    pub async fn acquire(
        channel: Arc<dyn Channel>,
        path: PathBuf,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let script = format!("mkdir {} 2>/dev/null", quote_path(&path));
        let started = Instant::now();
        while !channel.exec(&script).await?.success() {
            if started.elapsed() >= timeout {
                return Err(ChannelError::Timeout {
                    target: format!("lock {} on {}", path.display(), channel.name()),
                    timeout,
                });
            }
            debug!(lock = %path.display(), "Waiting for lock");
            tokio::time::sleep(LOCK_RETRY).await;
        }
        Ok(Self {
            channel,
            path,
            released: false,
        })
    }

    pub async fn release(mut self) -> Result<(), ChannelError> {
        self.released = true;
        let output = self
            .channel
            .exec(&format!("rmdir {}", quote_path(&self.path)))
            .await?;
        if !output.success() {
            warn!(lock = %self.path.display(), error = %output.describe_failure(), "Failed to remove lock");
        }
        Ok(())
    }
}

impl Drop for LockedDir {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropped on an error path; release in the background.
        let channel = self.channel.clone();
        let script = format!("rmdir {}", quote_path(&self.path));
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = channel.exec(&script).await;
            });
        }
    }
}

/// A cancellation signal shared by every task working on one call.
#[derive(Clone)]
pub struct Cancellation {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                // Every sender is gone; nothing can cancel anymore.
                futures::future::pending::<()>().await;
            }
        }
    }
}
