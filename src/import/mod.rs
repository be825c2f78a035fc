//! Bringing an externally produced novel database into the working one.
//!
//! Two strategies share the source handling and the single-run guard:
//! [`copy`] replaces the working database file wholesale, [`merge`] upserts
//! the external rows table by table.

pub mod columns;
pub mod copy;
pub mod merge;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::error::{AppError, Result};

pub use merge::SyncReport;

/// File name prefix of the temporary snapshots merges read from.
pub const SNAPSHOT_PREFIX: &str = "nr-reader-import-";

/// Where an external database comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportSource {
    Local(PathBuf),
    Remote(Url),
}

impl ImportSource {
    /// Accepts a plain path, a `file://` URI or an `http(s)://` URL.
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Err(AppError::access(source, "no source selected"));
        }
        let Some((scheme, rest)) = source.split_once("://") else {
            return Ok(ImportSource::Local(PathBuf::from(source)));
        };
        match scheme.to_ascii_lowercase().as_str() {
            "file" => {
                let decoded = urlencoding::decode(rest).map_err(|e| AppError::access(source, e))?;
                Ok(ImportSource::Local(PathBuf::from(decoded.into_owned())))
            }
            "http" | "https" => {
                let url = Url::parse(source).map_err(|e| AppError::access(source, e))?;
                Ok(ImportSource::Remote(url))
            }
            other => Err(AppError::access(source, format!("unsupported scheme '{other}'"))),
        }
    }

    pub fn display(&self) -> String {
        match self {
            ImportSource::Local(path) => path.display().to_string(),
            ImportSource::Remote(url) => url.to_string(),
        }
    }

    /// Make the source readable as a local file. Remote sources, and local
    /// ones when `snapshot` is set, are copied to a temporary file in
    /// `scratch_dir` (the system temp dir if `None`) that is deleted when the
    /// returned value is dropped.
    pub async fn materialize(
        &self,
        client: &Client,
        snapshot: bool,
        scratch_dir: Option<&Path>,
    ) -> Result<LocalCopy> {
        if let ImportSource::Local(path) = self {
            if !snapshot {
                if !path.is_file() {
                    return Err(AppError::access(self.display(), "file not found"));
                }
                return Ok(LocalCopy {
                    path: path.clone(),
                    temp: None,
                });
            }
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix(SNAPSHOT_PREFIX).suffix(".db");
        let temp = match scratch_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let copied = copy::stream_into(self, client, temp.path(), &CopyProgress::default()).await?;
        if copied == 0 {
            return Err(AppError::EmptyCopy);
        }
        tracing::debug!("Copied {} bytes of {} to {}", copied, self.display(), temp.path().display());
        Ok(LocalCopy {
            path: temp.path().to_path_buf(),
            temp: Some(temp),
        })
    }
}

/// A readable local file; owns the temporary copy if one was made.
pub struct LocalCopy {
    path: PathBuf,
    temp: Option<tempfile::NamedTempFile>,
}

impl LocalCopy {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }
}

/// Rejects a second import while one is running.
#[derive(Clone, Default)]
pub struct ImportGuard {
    running: Arc<AtomicBool>,
}

impl ImportGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Result<ImportPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AppError::ImportInProgress)?;
        Ok(ImportPermit {
            running: Arc::clone(&self.running),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

pub struct ImportPermit {
    running: Arc<AtomicBool>,
}

impl Drop for ImportPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Byte counters shared between a running copy and whoever polls it.
#[derive(Debug, Default)]
pub struct CopyProgress {
    copied: AtomicU64,
    /// 0 while the total is unknown.
    total: AtomicU64,
}

impl CopyProgress {
    pub fn set_total(&self, total: Option<u64>) {
        self.total.store(total.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn add(&self, bytes: u64) {
        self.copied.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn copied(&self) -> u64 {
        self.copied.load(Ordering::Relaxed)
    }

    /// `None` when the total size is unknown.
    pub fn fraction(&self) -> Option<f32> {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        Some((self.copied() as f64 / total as f64).min(1.0) as f32)
    }

    pub fn snapshot(&self) -> SyncProgress {
        let copied = self.copied();
        SyncProgress {
            message: format!("Copying database ({} KiB)", copied / 1024),
            fraction: self.fraction(),
        }
    }
}

/// What the progress popup shows.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncProgress {
    pub message: String,
    /// `None` is indeterminate.
    pub fraction: Option<f32>,
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self {
            message: "Waiting".to_string(),
            fraction: Some(0.0),
        }
    }
}

/// Publishes merge progress, never letting the fraction go backwards.
///
/// The watch channel only keeps the latest value for sampling; a listener
/// attached with [`ProgressReporter::with_listener`] receives every report.
pub struct ProgressReporter {
    tx: watch::Sender<SyncProgress>,
    listener: Option<mpsc::UnboundedSender<SyncProgress>>,
}

impl ProgressReporter {
    pub fn new() -> (Self, watch::Receiver<SyncProgress>) {
        let (tx, rx) = watch::channel(SyncProgress::default());
        (Self { tx, listener: None }, rx)
    }

    pub fn with_listener(mut self, listener: mpsc::UnboundedSender<SyncProgress>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn report(&self, message: impl Into<String>, fraction: f32) {
        let previous = self.tx.borrow().fraction.unwrap_or(0.0);
        let progress = SyncProgress {
            message: message.into(),
            fraction: Some(fraction.clamp(0.0, 1.0).max(previous)),
        };
        if let Some(listener) = &self.listener {
            // A closed listener does not stop the import.
            let _ = listener.send(progress.clone());
        }
        self.tx.send_replace(progress);
    }

    pub fn current(&self) -> SyncProgress {
        self.tx.borrow().clone()
    }
}

/// How often headless modes and the TUI sample progress.
pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn http_client() -> Result<Client> {
    let client = Client::builder()
        .timeout(Duration::from_secs(300))
        .connect_timeout(Duration::from_secs(10))
        .user_agent("nr-reader/1.0")
        .build()?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_source_kinds() {
        assert_eq!(
            ImportSource::parse("/data/novel.db").unwrap(),
            ImportSource::Local(PathBuf::from("/data/novel.db"))
        );
        assert_eq!(
            ImportSource::parse("file:///data/my%20novel.db").unwrap(),
            ImportSource::Local(PathBuf::from("/data/my novel.db"))
        );
        assert!(matches!(
            ImportSource::parse("https://example.com/novel.db").unwrap(),
            ImportSource::Remote(_)
        ));
        assert!(matches!(
            ImportSource::parse("content://com.android.provider/1"),
            Err(AppError::ExternalAccess { .. })
        ));
        assert!(ImportSource::parse("  ").is_err());
    }

    #[test]
    fn guard_rejects_second_import_until_permit_dropped() {
        let guard = ImportGuard::new();
        let permit = guard.try_acquire().unwrap();
        assert!(guard.is_running());
        assert!(matches!(guard.clone().try_acquire(), Err(AppError::ImportInProgress)));
        drop(permit);
        assert!(!guard.is_running());
        assert!(guard.try_acquire().is_ok());
    }

    #[test]
    fn reporter_fraction_is_monotonic() {
        let (reporter, rx) = ProgressReporter::new();
        reporter.report("a", 0.3);
        reporter.report("b", 0.2);
        assert_eq!(rx.borrow().fraction, Some(0.3));
        assert_eq!(rx.borrow().message, "b");
        reporter.report("c", 2.0);
        assert_eq!(reporter.current().fraction, Some(1.0));
    }

    #[test]
    fn listener_receives_every_report() {
        let (tx, mut trail) = mpsc::unbounded_channel();
        let (reporter, rx) = ProgressReporter::new();
        let reporter = reporter.with_listener(tx);
        reporter.report("a", 0.1);
        reporter.report("b", 0.2);
        reporter.report("c", 0.1);

        let mut seen = Vec::new();
        while let Ok(progress) = trail.try_recv() {
            seen.push(progress.fraction);
        }
        assert_eq!(seen, vec![Some(0.1), Some(0.2), Some(0.2)]);
        assert_eq!(rx.borrow().message, "c");
    }

    #[test]
    fn copy_progress_is_indeterminate_without_total() {
        let progress = CopyProgress::default();
        progress.add(10);
        assert_eq!(progress.fraction(), None);
        progress.set_total(Some(40));
        assert_eq!(progress.fraction(), Some(0.25));
    }

    #[tokio::test]
    async fn missing_local_source_is_an_access_error() {
        let client = http_client().unwrap();
        let source = ImportSource::Local(PathBuf::from("/nonexistent/novel.db"));
        assert!(matches!(
            source.materialize(&client, false, None).await,
            Err(AppError::ExternalAccess { .. })
        ));
        assert!(matches!(
            source.materialize(&client, true, None).await,
            Err(AppError::ExternalAccess { .. })
        ));
    }
}
