//! Model artifact download over HTTP
//!
//! A deliberately small transport: one GET, at most one redirect hop, the body
//! streamed straight into the models directory. Only one download can be live
//! at a time; the slot is reserved by [`DownloadCoordinator::begin`] and held
//! by the returned [`DownloadSession`] until it is dropped.

use super::registry::ModelDescriptor;
use super::storage::artifact_path;
use crate::error::DownloadError;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode, header};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Progress value reported when the total size is unknown
pub const PROGRESS_INDETERMINATE: i32 = -1;

/// Write buffer size; the body reaches disk in chunks of this size
const WRITE_CHUNK_BYTES: usize = 64 * 1024;

/// A single in-flight download
///
/// Dropping the session frees the coordinator's slot.
pub struct DownloadSession {
    pub descriptor: ModelDescriptor,
    pub target_path: PathBuf,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    cancelled: Arc<AtomicBool>,
    slot: Arc<AtomicBool>,
}

impl DownloadSession {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for DownloadSession {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::SeqCst);
    }
}

/// Converts byte counts into monotonic percentage reports
#[derive(Debug)]
pub struct ProgressReporter {
    total: Option<u64>,
    last: Option<i32>,
}

impl ProgressReporter {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|&t| t > 0),
            last: None,
        }
    }

    /// Percentage for `transferred` bytes, or `-1` when the total is unknown
    pub fn percent(&self, transferred: u64) -> i32 {
        match self.total {
            Some(total) => {
                let pct = (transferred as u128 * 100) / total as u128;
                pct.min(100) as i32
            }
            None => PROGRESS_INDETERMINATE,
        }
    }

    /// Value to report after a chunk, if it differs from the previous report
    pub fn update(&mut self, transferred: u64) -> Option<i32> {
        let pct = self.percent(transferred);
        let next = match self.last {
            Some(prev) if pct <= prev => return None,
            _ => pct,
        };
        self.last = Some(next);
        Some(next)
    }

    /// Final report once the body is complete
    pub fn finish(&mut self) -> Option<i32> {
        let last = if self.total.is_some() {
            100
        } else {
            PROGRESS_INDETERMINATE
        };
        if self.last == Some(last) {
            return None;
        }
        self.last = Some(last);
        Some(last)
    }
}

/// Fetches model artifacts into the models directory
pub struct DownloadCoordinator {
    client: Client,
    models_dir: PathBuf,
    slot: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl DownloadCoordinator {
    /// Create a coordinator with bounded connect and read timeouts
    pub fn new(
        models_dir: PathBuf,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(concat!("local-llm-manager/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            models_dir,
            slot: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create a coordinator from manager configuration
    pub fn from_config(config: &crate::config::ManagerConfig) -> anyhow::Result<Self> {
        Self::new(
            config.models_dir.clone(),
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.read_timeout_secs),
        )
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Whether a session currently holds the slot
    pub fn is_active(&self) -> bool {
        self.slot.load(Ordering::SeqCst)
    }

    /// Reserve the single download slot for `descriptor`
    pub fn begin(&self, descriptor: ModelDescriptor) -> Result<DownloadSession, DownloadError> {
        let Some(target_path) = artifact_path(&self.models_dir, &descriptor.name) else {
            return Err(DownloadError::InvalidName(descriptor.name));
        };
        if self
            .slot
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DownloadError::AlreadyInProgress);
        }
        self.cancel.store(false, Ordering::SeqCst);

        Ok(DownloadSession {
            target_path,
            descriptor,
            bytes_transferred: 0,
            total_bytes: None,
            cancelled: self.cancel.clone(),
            slot: self.slot.clone(),
        })
    }

    /// Request cancellation of the live session
    ///
    /// Returns false when nothing was downloading.
    pub fn cancel(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.cancel.store(true, Ordering::SeqCst);
        tracing::info!("Download cancellation requested");
        true
    }

    /// Download `descriptor`, reporting progress after each chunk
    pub async fn download<F>(
        &self,
        descriptor: &ModelDescriptor,
        progress: F,
    ) -> Result<PathBuf, DownloadError>
    where
        F: FnMut(i32) + Send,
    {
        let session = self.begin(descriptor.clone())?;
        self.run(session, progress).await
    }

    /// Drive a reserved session to completion
    pub async fn run<F>(
        &self,
        mut session: DownloadSession,
        mut progress: F,
    ) -> Result<PathBuf, DownloadError>
    where
        F: FnMut(i32) + Send,
    {
        let name = session.descriptor.name.clone();
        tracing::info!(
            model = %name,
            url = %session.descriptor.download_url,
            target = ?session.target_path,
            "Starting model download"
        );

        if session.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let response = self.open(&session.descriptor.download_url).await?;

        session.total_bytes = response
            .content_length()
            .filter(|&len| len > 0)
            .or(Some(session.descriptor.size_bytes).filter(|&s| s > 0));
        let mut reporter = ProgressReporter::new(session.total_bytes);

        if let Some(parent) = session.target_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::Network(format!("Failed to create models dir: {}", e)))?;
        }

        let file = match File::create(&session.target_path).await {
            Ok(file) => file,
            Err(e) => {
                return Err(DownloadError::Network(format!(
                    "Failed to create {:?}: {}",
                    session.target_path, e
                )));
            }
        };
        let mut writer = BufWriter::with_capacity(WRITE_CHUNK_BYTES, file);
        let mut stream = response.bytes_stream();

        loop {
            if session.is_cancelled() {
                // Partial file stays; a later download overwrites it
                let _ = writer.flush().await;
                drop(stream);
                tracing::info!(
                    model = %name,
                    bytes = session.bytes_transferred,
                    "Download cancelled"
                );
                return Err(DownloadError::Cancelled);
            }

            let chunk = match stream.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    return Err(remove_partial(&session.target_path, e.to_string()).await);
                }
                None => break,
            };

            if let Err(e) = writer.write_all(&chunk).await {
                return Err(remove_partial(&session.target_path, e.to_string()).await);
            }
            session.bytes_transferred += chunk.len() as u64;

            if let Some(pct) = reporter.update(session.bytes_transferred) {
                progress(pct);
            }
        }

        if let Err(e) = writer.flush().await {
            return Err(remove_partial(&session.target_path, e.to_string()).await);
        }
        if let Err(e) = writer.get_ref().sync_all().await {
            return Err(remove_partial(&session.target_path, e.to_string()).await);
        }
        drop(writer);

        if session.bytes_transferred == 0 {
            let _ = tokio::fs::remove_file(&session.target_path).await;
            tracing::warn!(model = %name, "Download produced an empty file");
            return Err(DownloadError::EmptyArtifact);
        }

        if let Some(pct) = reporter.finish() {
            progress(pct);
        }

        tracing::info!(
            model = %name,
            bytes = session.bytes_transferred,
            "Model download complete"
        );
        crate::metrics::record_download_completed(&name, session.bytes_transferred);

        Ok(session.target_path.clone())
    }

    /// Issue the GET, following at most one redirect
    async fn open(&self, url: &str) -> Result<Response, DownloadError> {
        let response = self.client.get(url).send().await.map_err(network)?;

        let response = if is_redirect(response.status()) {
            let next = redirect_target(&response)?;
            tracing::debug!(from = %url, to = %next, "Following redirect");
            let redirected = self.client.get(next).send().await.map_err(network)?;
            if is_redirect(redirected.status()) {
                return Err(DownloadError::TooManyRedirects);
            }
            redirected
        } else {
            response
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Network(format!(
                "HTTP {} from {}",
                status,
                response.url()
            )));
        }

        Ok(response)
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Resolve the `Location` header against the request URL
fn redirect_target(response: &Response) -> Result<reqwest::Url, DownloadError> {
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| DownloadError::Network("Redirect without Location header".to_string()))?;

    response
        .url()
        .join(location)
        .map_err(|e| DownloadError::Network(format!("Invalid redirect location {}: {}", location, e)))
}

fn network(err: reqwest::Error) -> DownloadError {
    DownloadError::Network(err.to_string())
}

async fn remove_partial(path: &Path, message: String) -> DownloadError {
    tracing::warn!(path = ?path, error = %message, "Download failed, removing partial file");
    let _ = tokio::fs::remove_file(path).await;
    DownloadError::Network(message)
}
