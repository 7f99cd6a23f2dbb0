// Image artifact downloader with digest-keyed on-disk caching.
//
// One downloader instance handles one image reference and owns one
// progress state machine: NotStarted -> Downloading -> Ready | Failed.
// Ready and Failed are terminal; a new reference gets a new instance.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::digest::compute_digest;

/// Kernel artifact file name inside the cache directory.
pub const KERNEL_FILE: &str = "vmlinux";

/// Root filesystem artifact file name inside the cache directory.
pub const DISK_FILE: &str = "rootfs.img";

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image download failed: {0}")]
    DownloadFailed(String),

    #[error("image artifacts not ready (state: {0})")]
    NotReady(DownloadState),

    #[error("image download cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Download lifecycle state. Transitions are monotonic within one
/// downloader instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    NotStarted,
    Downloading,
    Ready,
    Failed,
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadState::NotStarted => "not_started",
            DownloadState::Downloading => "downloading",
            DownloadState::Ready => "ready",
            DownloadState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of download progress, safe to read while a fetch is in flight.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub state: DownloadState,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct DownloaderInner {
    progress: DownloadProgress,
    kernel_path: Option<PathBuf>,
    disk_path: Option<PathBuf>,
    signalled: bool,
}

/// Obtains the kernel and root filesystem artifacts a VM backend needs,
/// caching them under `<data_dir>/images/<digest>/`.
pub struct ImageDownloader {
    image_ref: String,
    digest: String,
    cache_dir: PathBuf,
    artifact_base_url: String,
    client: reqwest::Client,
    inner: Mutex<DownloaderInner>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl ImageDownloader {
    pub fn new(image_ref: &str, data_dir: &Path, artifact_base_url: &str) -> Self {
        let digest = compute_digest(image_ref);
        let cache_dir = data_dir.join("images").join(&digest);
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            image_ref: image_ref.to_string(),
            digest,
            cache_dir,
            artifact_base_url: artifact_base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            inner: Mutex::new(DownloaderInner {
                progress: DownloadProgress {
                    state: DownloadState::NotStarted,
                    bytes_downloaded: 0,
                    total_bytes: 0,
                    error: None,
                    completed_at: None,
                },
                kernel_path: None,
                disk_path: None,
                signalled: false,
            }),
            done_tx,
            done_rx,
        }
    }

    pub fn image_ref(&self) -> &str {
        &self.image_ref
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    fn kernel_path(&self) -> PathBuf {
        self.cache_dir.join(KERNEL_FILE)
    }

    fn disk_path(&self) -> PathBuf {
        self.cache_dir.join(DISK_FILE)
    }

    /// Cache hit requires both artifact files to exist and be non-empty.
    /// A zero-byte file left behind by an interrupted write is a miss.
    pub fn check_cache(&self) -> bool {
        let non_empty = |p: &Path| {
            std::fs::metadata(p)
                .map(|m| m.is_file() && m.len() > 0)
                .unwrap_or(false)
        };
        non_empty(&self.kernel_path()) && non_empty(&self.disk_path())
    }

    /// Begin obtaining the artifacts. On a cache hit this completes
    /// synchronously (state becomes `Ready`, no network I/O); on a miss a
    /// background fetch is spawned and state becomes `Downloading`.
    pub fn start(self: &Arc<Self>) {
        if self.check_cache() {
            info!(image = %self.image_ref, digest = %self.digest, "image cache hit");
            self.mark_ready(self.kernel_path(), self.disk_path());
            return;
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.progress.state != DownloadState::NotStarted {
                debug!(image = %self.image_ref, "download already started");
                return;
            }
            inner.progress.state = DownloadState::Downloading;
        }

        info!(
            image = %self.image_ref,
            digest = %self.digest,
            "image cache miss, starting download"
        );
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.run_download().await {
                this.record_error(&err.to_string());
            }
        });
    }

    async fn run_download(self: &Arc<Self>) -> Result<(), ImageError> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        for file in [KERNEL_FILE, DISK_FILE] {
            let url = format!("{}/{}/{}", self.artifact_base_url, self.digest, file);
            self.fetch_artifact(&url, &self.cache_dir.join(file)).await?;
        }

        self.mark_ready(self.kernel_path(), self.disk_path());
        Ok(())
    }

    /// Stream one artifact to `<dest>.partial`, then rename into place so a
    /// crash mid-download never leaves a plausible-looking cache entry.
    async fn fetch_artifact(&self, url: &str, dest: &Path) -> Result<(), ImageError> {
        debug!(%url, "fetching image artifact");
        let resp = self.client.get(url).send().await?.error_for_status()?;

        if let Some(len) = resp.content_length() {
            let mut inner = self.inner.lock().unwrap();
            inner.progress.total_bytes += len;
        }

        let partial = dest.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            let mut inner = self.inner.lock().unwrap();
            inner.progress.bytes_downloaded += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, dest).await?;
        Ok(())
    }

    fn mark_ready(&self, kernel: PathBuf, disk: PathBuf) {
        let mut inner = self.inner.lock().unwrap();
        inner.progress.state = DownloadState::Ready;
        inner.kernel_path = Some(kernel);
        inner.disk_path = Some(disk);
        if inner.progress.completed_at.is_none() {
            inner.progress.completed_at = Some(Utc::now());
        }
        self.signal_done(&mut inner);
    }

    /// Record a download failure. The error text is overwritten on every
    /// call; `completed_at` keeps the timestamp of the first call and the
    /// completion signal fires exactly once no matter how often this runs.
    pub fn record_error(&self, message: &str) {
        warn!(image = %self.image_ref, error = %message, "image download failed");
        let mut inner = self.inner.lock().unwrap();
        inner.progress.state = DownloadState::Failed;
        inner.progress.error = Some(message.to_string());
        if inner.progress.completed_at.is_none() {
            inner.progress.completed_at = Some(Utc::now());
        }
        self.signal_done(&mut inner);
    }

    fn signal_done(&self, inner: &mut DownloaderInner) {
        if !inner.signalled {
            inner.signalled = true;
            let _ = self.done_tx.send(true);
        }
    }

    /// Artifact paths, available only once the state is exactly `Ready`.
    pub fn get_paths(&self) -> Option<(PathBuf, PathBuf)> {
        let inner = self.inner.lock().unwrap();
        if inner.progress.state != DownloadState::Ready {
            return None;
        }
        match (&inner.kernel_path, &inner.disk_path) {
            (Some(k), Some(d)) => Some((k.clone(), d.clone())),
            _ => None,
        }
    }

    /// Non-blocking progress snapshot.
    pub fn status(&self) -> DownloadProgress {
        self.inner.lock().unwrap().progress.clone()
    }

    /// Block until the download completes or `cancel` fires. Returns `Ok`
    /// on `Ready`, the stored error on `Failed`, and `Cancelled` when the
    /// token wins the race.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), ImageError> {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ImageError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let inner = self.inner.lock().unwrap();
        match inner.progress.state {
            DownloadState::Ready => Ok(()),
            DownloadState::Failed => Err(ImageError::DownloadFailed(
                inner
                    .progress
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown download error".to_string()),
            )),
            state => Err(ImageError::NotReady(state)),
        }
    }
}
