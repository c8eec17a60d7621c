//! Configuration file change watcher
//!
//! A single background task polls the configuration file's metadata and
//! publishes into a latest-signal cell ([`tokio::sync::watch`]). Repeated
//! changes between two reads of the cell collapse into one notification,
//! which is all the driver needs: it reloads whatever the file holds *now*.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio_stream::Stream;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Default interval between two metadata polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Identity of a configuration file at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSignature {
    pub modified: SystemTime,
    pub len: u64,
    /// Platform file identity (inode on Unix, 0 elsewhere)
    pub inode: u64,
}

impl FileSignature {
    /// Read the current signature of `path`
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self::from_metadata(&metadata))
    }

    fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            len: metadata.len(),
            inode: inode(metadata),
        }
    }

    /// Whether this signature reflects an edit relative to `previous`
    ///
    /// An older modification time alone does not count.
    pub fn changed_from(&self, previous: &FileSignature) -> bool {
        self.modified > previous.modified
            || self.len != previous.len
            || self.inode != previous.inode
    }
}

#[cfg(unix)]
fn inode(metadata: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode(_metadata: &Metadata) -> u64 {
    0
}

/// Polls a configuration file for external edits
#[derive(Debug, Clone)]
pub struct ConfigWatcher {
    path: PathBuf,
    interval: Duration,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start watching until `cancel` fires
    ///
    /// The first successful read seeds the baseline silently. Unreadable
    /// polls are skipped. When `cancel` fires the task ends and the returned
    /// signal reports closure.
    pub fn spawn(self, cancel: CancellationToken) -> ChangeSignal {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(self.poll(tx, cancel));
        ChangeSignal { rx }
    }

    async fn poll(self, tx: watch::Sender<Option<FileSignature>>, cancel: CancellationToken) {
        let mut baseline: Option<FileSignature> = None;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!(path = %self.path.display(), interval = ?self.interval, "config watcher started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = match FileSignature::read(&self.path) {
                Ok(signature) => signature,
                Err(e) => {
                    trace!(
                        path = %self.path.display(),
                        error = %e,
                        "config file unreadable, skipping poll"
                    );
                    continue;
                }
            };

            match baseline {
                None => baseline = Some(current),
                Some(previous) if current.changed_from(&previous) => {
                    info!(path = %self.path.display(), "configuration file changed");
                    baseline = Some(current);
                    // overwrite; an unread earlier signal is simply superseded
                    tx.send_replace(Some(current));
                }
                Some(_) => {}
            }
        }

        debug!(path = %self.path.display(), "config watcher stopped");
    }
}

/// Receiving side of a [`ConfigWatcher`]
#[derive(Debug, Clone)]
pub struct ChangeSignal {
    rx: watch::Receiver<Option<FileSignature>>,
}

impl ChangeSignal {
    /// Wait for the next change
    ///
    /// Returns `false` once the watcher has stopped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Signature of the most recent change, if any was seen
    pub fn latest(&self) -> Option<FileSignature> {
        *self.rx.borrow()
    }

    /// Whether the watching task has ended
    pub fn is_closed(&self) -> bool {
        self.rx.has_changed().is_err()
    }

    /// Stream of changes that ends when the watcher stops
    pub fn into_stream(self) -> impl Stream<Item = FileSignature> + Send + 'static {
        use tokio_stream::StreamExt;
        WatchStream::from_changes(self.rx).filter_map(|signature| signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_stream::StreamExt;

    const TICK: Duration = Duration::from_millis(20);

    fn signature(secs: u64, len: u64, inode: u64) -> FileSignature {
        FileSignature {
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
            len,
            inode,
        }
    }

    #[test]
    fn signature_change_rules() {
        let base = signature(100, 10, 1);
        assert!(!base.changed_from(&base));
        assert!(signature(101, 10, 1).changed_from(&base));
        assert!(signature(100, 11, 1).changed_from(&base));
        assert!(signature(100, 10, 2).changed_from(&base));
        assert!(!signature(99, 10, 1).changed_from(&base), "older mtime alone is ignored");
    }

    #[tokio::test]
    async fn first_observation_does_not_signal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "zone_id: z").unwrap();

        let cancel = CancellationToken::new();
        let mut signal = ConfigWatcher::new(file.path()).with_interval(TICK).spawn(cancel.clone());

        let waited = tokio::time::timeout(TICK * 10, signal.changed()).await;
        assert!(waited.is_err(), "no notification for the baseline");
        assert!(signal.latest().is_none());
        cancel.cancel();
    }

    #[tokio::test]
    async fn edit_is_signalled() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "zone_id: z").unwrap();

        let cancel = CancellationToken::new();
        let mut signal = ConfigWatcher::new(file.path()).with_interval(TICK).spawn(cancel.clone());
        tokio::time::sleep(TICK * 3).await;

        writeln!(file, "token: longer content").unwrap();
        file.flush().unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(2), signal.changed())
            .await
            .expect("change observed");
        assert!(changed);
        assert!(signal.latest().is_some());
        cancel.cancel();
    }

    #[tokio::test]
    async fn default_interval_picks_up_edits_within_seconds() {
        assert_eq!(DEFAULT_POLL_INTERVAL, Duration::from_secs(1));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "zone_id: z").unwrap();

        let cancel = CancellationToken::new();
        let mut signal = ConfigWatcher::new(file.path()).spawn(cancel.clone());
        tokio::time::sleep(TICK * 3).await;

        writeln!(file, "token: edited").unwrap();
        file.flush().unwrap();

        let changed = tokio::time::timeout(DEFAULT_POLL_INTERVAL * 3, signal.changed())
            .await
            .expect("edit observed within a few default polls");
        assert!(changed);
        cancel.cancel();
    }

    #[tokio::test]
    async fn missing_file_is_skipped_until_it_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let cancel = CancellationToken::new();
        let mut signal = ConfigWatcher::new(&path).with_interval(TICK).spawn(cancel.clone());
        tokio::time::sleep(TICK * 3).await;
        assert!(!signal.is_closed(), "unreadable file does not stop the watcher");

        // appearing seeds the baseline
        std::fs::write(&path, "zone_id: z\n").unwrap();
        tokio::time::sleep(TICK * 3).await;
        std::fs::write(&path, "zone_id: zz\ntoken: t\n").unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(2), signal.changed())
            .await
            .expect("change observed");
        assert!(changed);
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_closes_the_stream() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let cancel = CancellationToken::new();
        let signal = ConfigWatcher::new(file.path()).with_interval(TICK).spawn(cancel.clone());
        let mut stream = Box::pin(signal.into_stream());

        cancel.cancel();
        let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("stream ends promptly");
        assert!(next.is_none());
    }
}
