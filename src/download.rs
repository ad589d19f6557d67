//! Model weight downloader
//!
//! Streams a weight file over HTTP with throttled progress reporting and
//! explicit cancellation. One download per filename: a second request for
//! the same file fails fast instead of queueing or merging. Every
//! termination path removes the in-flight registration and, on failure or
//! cancellation, the partial output file.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{ManagerError, Result};
use crate::registry::RemoteModelEntry;

/// Progress is emitted at most this often; per-chunk emission is wasted
/// work for any realistic consumer.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Progress callback invoked with throttled download updates
pub type ProgressCallback = Box<dyn Fn(DownloadProgress) + Send + Sync>;

/// Point-in-time download progress
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    /// Percentage complete (0-100)
    pub percent: u8,
    /// Bytes per second since the previous report
    pub speed_bps: f64,
}

impl DownloadProgress {
    pub fn new(downloaded: u64, total: u64, speed_bps: f64) -> Self {
        let percent = if total > 0 {
            ((downloaded as f64 / total as f64) * 100.0).min(100.0) as u8
        } else {
            0
        };
        Self {
            downloaded_bytes: downloaded,
            total_bytes: total,
            percent,
            speed_bps,
        }
    }
}

struct DownloadTicket {
    cancel: Arc<AtomicBool>,
    last: DownloadProgress,
}

/// HTTP downloader with per-filename in-flight tracking
pub struct Downloader {
    models_dir: PathBuf,
    client: reqwest::Client,
    tickets: DashMap<String, DownloadTicket>,
}

impl Downloader {
    pub fn new(models_dir: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            // Weight files are tens of gigabytes; an hour is not generous
            .timeout(Duration::from_secs(3600))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            models_dir,
            client,
            tickets: DashMap::new(),
        })
    }

    /// Download a catalog entry into the models directory.
    ///
    /// Fails with [`ManagerError::Conflict`] when the target file already
    /// exists (without touching the network) or when a download for the
    /// same filename is already in flight. HTTP 401/403 surface as
    /// [`ManagerError::TokenRequired`]/[`ManagerError::AccessForbidden`] so
    /// the caller can prompt for credentials instead of retrying.
    pub async fn download(
        &self,
        entry: &RemoteModelEntry,
        credential: Option<&str>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<PathBuf> {
        let filename = sanitize_local_filename(&entry.filename)?;
        let target = self.models_dir.join(&filename);
        if target.exists() {
            return Err(ManagerError::Conflict(format!(
                "file already exists: {}",
                target.display()
            )));
        }

        let cancel = Arc::new(AtomicBool::new(false));
        match self.tickets.entry(filename.clone()) {
            Entry::Occupied(_) => {
                return Err(ManagerError::Conflict(format!(
                    "download already in progress for {filename}"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(DownloadTicket {
                    cancel: cancel.clone(),
                    last: DownloadProgress::default(),
                });
            }
        }

        let tmp = self.models_dir.join(format!("{filename}.part"));
        let result = self
            .run(entry, &target, &tmp, &filename, &cancel, credential, on_progress)
            .await;

        // Ticket removal and partial-file cleanup happen on every exit path
        self.tickets.remove(&filename);
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    async fn run(
        &self,
        entry: &RemoteModelEntry,
        target: &Path,
        tmp: &Path,
        filename: &str,
        cancel: &AtomicBool,
        credential: Option<&str>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<PathBuf> {
        tracing::info!(url = %entry.url, "starting model download");

        let mut request = self.client.get(&entry.url);
        if let Some(token) = credential {
            request = request.bearer_auth(token);
        }
        let mut response = request.send().await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => return Err(ManagerError::TokenRequired),
            StatusCode::FORBIDDEN => return Err(ManagerError::AccessForbidden),
            status if !status.is_success() => {
                return Err(ManagerError::Http(format!(
                    "download failed with status {status}"
                )));
            }
            _ => {}
        }

        let total = response.content_length().unwrap_or(entry.size_bytes);
        tokio::fs::create_dir_all(&self.models_dir).await?;
        let mut file = File::create(tmp).await?;

        let mut downloaded: u64 = 0;
        let mut bytes_since_report: u64 = 0;
        let mut last_report = Instant::now();

        while let Some(chunk) = response.chunk().await? {
            if cancel.load(Ordering::SeqCst) {
                tracing::info!(filename, "download cancelled");
                return Err(ManagerError::Cancelled);
            }

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            bytes_since_report += chunk.len() as u64;

            let elapsed = last_report.elapsed();
            if elapsed >= PROGRESS_INTERVAL {
                let speed = bytes_since_report as f64 / elapsed.as_secs_f64();
                let progress = DownloadProgress::new(downloaded, total, speed);
                tracing::debug!(
                    filename,
                    "downloaded {} / {} ({}/s)",
                    format_size(downloaded),
                    format_size(total),
                    format_size(speed as u64)
                );
                self.record_progress(filename, progress.clone());
                if let Some(ref callback) = on_progress {
                    callback(progress);
                }
                last_report = Instant::now();
                bytes_since_report = 0;
            }
        }

        file.flush().await?;
        drop(file);

        if total > 0 && downloaded != total {
            return Err(ManagerError::Http(format!(
                "download incomplete: got {downloaded} bytes, expected {total}"
            )));
        }

        validate_gguf_file(tmp, filename).await?;
        tokio::fs::rename(tmp, target).await?;

        let final_total = if total > 0 { total } else { downloaded };
        let progress = DownloadProgress::new(final_total, final_total, 0.0);
        self.record_progress(filename, progress.clone());
        if let Some(ref callback) = on_progress {
            callback(progress);
        }

        tracing::info!(filename, size = %format_size(downloaded), "download complete");
        Ok(target.to_path_buf())
    }

    /// Fire the cancellation token for a filename; returns whether a
    /// download was registered under that name.
    pub fn cancel_download(&self, filename: &str) -> bool {
        match self.tickets.get(filename) {
            Some(ticket) => {
                ticket.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Last reported progress for an in-flight download
    pub fn progress(&self, filename: &str) -> Option<DownloadProgress> {
        self.tickets.get(filename).map(|t| t.last.clone())
    }

    pub fn is_downloading(&self, filename: &str) -> bool {
        self.tickets.contains_key(filename)
    }

    /// Filenames of every download currently in flight
    pub fn active_downloads(&self) -> Vec<String> {
        self.tickets.iter().map(|t| t.key().clone()).collect()
    }

    fn record_progress(&self, filename: &str, progress: DownloadProgress) {
        if let Some(mut ticket) = self.tickets.get_mut(filename) {
            ticket.last = progress;
        }
    }
}

/// Flatten a catalog-supplied filename into a single safe path component
fn sanitize_local_filename(filename: &str) -> Result<String> {
    let trimmed = filename.trim();
    let no_query = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
    let flattened = no_query
        .trim_start_matches('/')
        .replace('\\', "/")
        .replace('/', "__");

    let mut sanitized = String::with_capacity(flattened.len());
    for ch in flattened.chars() {
        let invalid = matches!(ch, '<' | '>' | ':' | '"' | '|' | '?' | '*');
        if invalid || ch.is_control() {
            sanitized.push('_');
        } else {
            sanitized.push(ch);
        }
    }
    while sanitized.ends_with('.') || sanitized.ends_with(' ') {
        sanitized.pop();
    }

    if sanitized.is_empty() {
        return Err(ManagerError::Io("invalid model filename".to_string()));
    }
    Ok(sanitized)
}

/// Reject downloads whose payload is not a GGUF/GGML container (a gated
/// repository serving an HTML error page is the usual culprit).
async fn validate_gguf_file(path: &Path, filename: &str) -> Result<()> {
    if !filename.to_ascii_lowercase().ends_with(".gguf") {
        return Ok(());
    }
    let mut file = File::open(path).await?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .await
        .map_err(|_| ManagerError::Io("downloaded file is too short to be a model".to_string()))?;
    match &magic {
        b"GGUF" | b"ggml" | b"ggjt" | b"ggla" => Ok(()),
        other => Err(ManagerError::Io(format!(
            "downloaded file is not a GGUF model (magic {other:?})"
        ))),
    }
}

/// Human-readable size string
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes as u64)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn entry(filename: &str, url: &str, size: u64) -> RemoteModelEntry {
        RemoteModelEntry {
            name: filename.to_string(),
            filename: filename.to_string(),
            url: url.to_string(),
            size_bytes: size,
            parameter_count: None,
            quantization: None,
            max_context_length: None,
            layer_count: None,
        }
    }

    /// One-shot HTTP server: accepts a single connection and runs `respond`
    async fn serve_once<F, Fut>(respond: F) -> String
    where
        F: FnOnce(tokio::net::TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                respond(stream).await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_existing_file_conflicts_without_network() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.gguf"), b"GGUF....").unwrap();
        let downloader = Downloader::new(dir.path().to_path_buf()).unwrap();

        // Unroutable URL: a network attempt would fail with Http, not Conflict
        let err = downloader
            .download(&entry("model.gguf", "http://203.0.113.1/model.gguf", 8), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Conflict(_)));
        assert!(!downloader.is_downloading("model.gguf"));
    }

    #[tokio::test]
    async fn test_duplicate_download_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(dir.path().to_path_buf()).unwrap();
        downloader.tickets.insert(
            "model.gguf".to_string(),
            DownloadTicket {
                cancel: Arc::new(AtomicBool::new(false)),
                last: DownloadProgress::default(),
            },
        );

        let err = downloader
            .download(&entry("model.gguf", "http://203.0.113.1/model.gguf", 8), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Conflict(_)));
        // The pre-existing registration must not be clobbered by the reject
        assert!(downloader.is_downloading("model.gguf"));
    }

    #[tokio::test]
    async fn test_successful_download_writes_file_and_cleans_ticket() {
        let body = b"GGUFtest-model-payload".to_vec();
        let len = body.len();
        let base = serve_once(move |mut stream| async move {
            let header =
                format!("HTTP/1.1 200 OK\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n");
            stream.write_all(header.as_bytes()).await.unwrap();
            stream.write_all(&body).await.unwrap();
            stream.flush().await.unwrap();
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(dir.path().to_path_buf()).unwrap();
        let path = downloader
            .download(
                &entry("model.gguf", &format!("{base}/model.gguf"), len as u64),
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"GGUFtest-model-payload");
        assert!(!downloader.is_downloading("model.gguf"));
        assert!(downloader.progress("model.gguf").is_none());
        assert!(!dir.path().join("model.gguf.part").exists());
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_token_required() {
        let base = serve_once(|mut stream| async move {
            stream
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(dir.path().to_path_buf()).unwrap();
        let err = downloader
            .download(&entry("gated.gguf", &format!("{base}/gated.gguf"), 8), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::TokenRequired));
        assert!(!downloader.is_downloading("gated.gguf"));
    }

    #[tokio::test]
    async fn test_forbidden_maps_to_access_forbidden() {
        let base = serve_once(|mut stream| async move {
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(dir.path().to_path_buf()).unwrap();
        let err = downloader
            .download(&entry("gated.gguf", &format!("{base}/gated.gguf"), 8), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::AccessForbidden));
    }

    #[tokio::test]
    async fn test_cancel_removes_partial_file_and_ticket() {
        // Drip-feed a large body so the cancel flag is observed mid-stream
        let base = serve_once(|mut stream| async move {
            let header = "HTTP/1.1 200 OK\r\nContent-Length: 10485760\r\nConnection: close\r\n\r\n";
            stream.write_all(header.as_bytes()).await.unwrap();
            for _ in 0..2000 {
                if stream.write_all(&[0u8; 512]).await.is_err() {
                    return;
                }
                let _ = stream.flush().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(Downloader::new(dir.path().to_path_buf()).unwrap());

        let task = {
            let downloader = downloader.clone();
            let url = format!("{base}/big.gguf");
            tokio::spawn(async move {
                downloader
                    .download(&entry("big.gguf", &url, 10_485_760), None, None)
                    .await
            })
        };

        // Let the transfer start, then fire the cancellation token
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(downloader.is_downloading("big.gguf"));
        assert!(downloader.cancel_download("big.gguf"));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ManagerError::Cancelled));
        assert!(!downloader.is_downloading("big.gguf"));
        assert!(!dir.path().join("big.gguf.part").exists());
        assert!(!dir.path().join("big.gguf").exists());
    }

    #[tokio::test]
    async fn test_non_gguf_payload_rejected() {
        let body = b"<html>error page</html>".to_vec();
        let len = body.len();
        let base = serve_once(move |mut stream| async move {
            let header =
                format!("HTTP/1.1 200 OK\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n");
            stream.write_all(header.as_bytes()).await.unwrap();
            stream.write_all(&body).await.unwrap();
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(dir.path().to_path_buf()).unwrap();
        let err = downloader
            .download(&entry("fake.gguf", &format!("{base}/fake.gguf"), len as u64), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Io(_)));
        assert!(!dir.path().join("fake.gguf").exists());
        assert!(!dir.path().join("fake.gguf.part").exists());
    }

    #[test]
    fn test_cancel_unknown_filename_returns_false() {
        let downloader = Downloader::new(PathBuf::from("/tmp/does-not-matter")).unwrap();
        assert!(!downloader.cancel_download("nope.gguf"));
    }

    #[test]
    fn test_sanitize_local_filename() {
        assert_eq!(
            sanitize_local_filename("subdir/model.gguf").unwrap(),
            "subdir__model.gguf"
        );
        assert_eq!(
            sanitize_local_filename("model.gguf?download=true").unwrap(),
            "model.gguf"
        );
        assert!(sanitize_local_filename("  ").is_err());
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(DownloadProgress::new(50, 200, 0.0).percent, 25);
        assert_eq!(DownloadProgress::new(200, 200, 0.0).percent, 100);
        assert_eq!(DownloadProgress::new(10, 0, 0.0).percent, 0);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
    }
}
