//! Base image acquisition.
//!
//! Downloads are funneled through a single coordinator task so concurrent
//! pipelines never fetch the same image twice and the host link is not
//! saturated: callers enqueue a [`DownloadRequest`] and wait on its reply
//! channel while forwarding progress records.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::HutchError;

/// Bytes fetched so far, and the total when the server reported one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

/// One unit of work for the download coordinator.
pub struct DownloadRequest {
    pub url: String,
    pub client: reqwest::Client,
    pub cancel: CancellationToken,
    pub progress_tx: mpsc::Sender<Progress>,
    pub reply_tx: oneshot::Sender<Result<PathBuf, HutchError>>,
}

/// Emit a progress record at most once per this many new bytes.
const PROGRESS_STRIDE: u64 = 4 * 1024 * 1024;

/// Fetch `url` through the download coordinator, forwarding every progress
/// record to `on_progress`. Returns the local path of the image.
pub async fn fetch(
    cancel: &CancellationToken,
    download_tx: &mpsc::Sender<DownloadRequest>,
    client: &reqwest::Client,
    url: &str,
    mut on_progress: impl FnMut(Progress),
) -> Result<PathBuf, HutchError> {
    let (progress_tx, mut progress_rx) = mpsc::channel(16);
    let (reply_tx, mut reply_rx) = oneshot::channel();

    download_tx
        .send(DownloadRequest {
            url: url.to_string(),
            client: client.clone(),
            cancel: cancel.clone(),
            progress_tx,
            reply_tx,
        })
        .await
        .map_err(|_| HutchError::Transport {
            message: "download coordinator is not running".into(),
            source: "request channel closed".into(),
        })?;

    loop {
        tokio::select! {
            Some(p) = progress_rx.recv() => on_progress(p),
            reply = &mut reply_rx => {
                return reply.map_err(|_| HutchError::Transport {
                    message: format!("download of {url} was abandoned"),
                    source: "reply channel closed".into(),
                })?;
            }
            _ = cancel.cancelled() => return Err(HutchError::Cancelled),
        }
    }
}

/// The Download Coordinator: serves requests one at a time until the
/// request channel closes.
pub async fn run_downloader(cache_dir: PathBuf, mut rx: mpsc::Receiver<DownloadRequest>) {
    while let Some(req) = rx.recv().await {
        let result = acquire(&cache_dir, &req).await;
        // Callers may have given up (cancellation); nothing to do then.
        let _ = req.reply_tx.send(result);
    }
}

async fn acquire(cache_dir: &Path, req: &DownloadRequest) -> Result<PathBuf, HutchError> {
    // Non-URL sources are local files: no download, no caching.
    if !req.url.starts_with("http://") && !req.url.starts_with("https://") {
        let path = PathBuf::from(&req.url);
        if !path.exists() {
            return Err(HutchError::io(
                format!("base image not found: {}", path.display()),
                std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            ));
        }
        return Ok(path);
    }

    let filename = req.url.rsplit('/').next().unwrap_or("image.img");

    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| HutchError::io(format!("creating cache dir {}", cache_dir.display()), e))?;

    let dest = cache_dir.join(filename);
    if dest.exists() {
        tracing::info!(path = %dest.display(), "using cached base image");
        return Ok(dest);
    }

    tracing::info!(url = %req.url, "downloading base image");

    let response = req
        .client
        .get(&req.url)
        .send()
        .await
        .map_err(|e| HutchError::Transport {
            message: format!("request to {} failed", req.url),
            source: Box::new(e),
        })?;

    if !response.status().is_success() {
        return Err(HutchError::Transport {
            message: format!("HTTP {} from {}", response.status(), req.url),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let total = response.content_length();
    let tmp_path = dest.with_extension("part");

    // Remove any stale .part file from a previous failed download.
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = download_to_file(&tmp_path, response, total, req).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, &dest).await.map_err(|e| {
        HutchError::io(
            format!("renaming {} to {}", tmp_path.display(), dest.display()),
            e,
        )
    })?;

    tracing::info!(path = %dest.display(), "base image cached");
    Ok(dest)
}

async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    total: Option<u64>,
    req: &DownloadRequest,
) -> Result<(), HutchError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| HutchError::io(format!("creating temp file {}", path.display()), e))?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut last_reported: u64 = 0;

    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => match chunk {
                Some(c) => c.map_err(|e| HutchError::Transport {
                    message: "error reading response body".into(),
                    source: Box::new(e),
                })?,
                None => break,
            },
            _ = req.cancel.cancelled() => return Err(HutchError::Cancelled),
        };

        file.write_all(&chunk)
            .await
            .map_err(|e| HutchError::io("writing image data", e))?;

        downloaded += chunk.len() as u64;
        if downloaded - last_reported >= PROGRESS_STRIDE {
            last_reported = downloaded;
            let _ = req.progress_tx.send(Progress { downloaded, total }).await;
        }
    }

    file.flush()
        .await
        .map_err(|e| HutchError::io("flushing image file", e))?;

    let _ = req.progress_tx.send(Progress { downloaded, total }).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plumbing() -> (
        mpsc::Sender<DownloadRequest>,
        mpsc::Receiver<DownloadRequest>,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::channel(4);
        (tx, rx, CancellationToken::new())
    }

    #[tokio::test]
    async fn fetch_resolves_local_paths_directly() {
        let cache = tempfile::tempdir().unwrap();
        let img = tempfile::NamedTempFile::new().unwrap();
        let (tx, rx, cancel) = plumbing();
        tokio::spawn(run_downloader(cache.path().to_path_buf(), rx));

        let client = reqwest::Client::new();
        let path = fetch(
            &cancel,
            &tx,
            &client,
            img.path().to_str().unwrap(),
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(path, img.path());
    }

    #[tokio::test]
    async fn fetch_fails_on_missing_local_image() {
        let cache = tempfile::tempdir().unwrap();
        let (tx, rx, cancel) = plumbing();
        tokio::spawn(run_downloader(cache.path().to_path_buf(), rx));

        let client = reqwest::Client::new();
        let err = fetch(&cancel, &tx, &client, "/no/such/image.qcow2", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, HutchError::Io { .. }));
    }

    #[tokio::test]
    async fn fetch_serves_cache_hits_without_network() {
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(cache.path().join("img.qcow2"), b"cached").unwrap();
        let (tx, rx, cancel) = plumbing();
        tokio::spawn(run_downloader(cache.path().to_path_buf(), rx));

        let client = reqwest::Client::new();
        let path = fetch(
            &cancel,
            &tx,
            &client,
            "https://images.invalid/img.qcow2",
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(path, cache.path().join("img.qcow2"));
    }

    #[tokio::test]
    async fn fetch_observes_cancellation() {
        let (tx, _rx, cancel) = plumbing();
        cancel.cancel();

        // The coordinator never picks the request up; cancellation must
        // still unblock the caller.
        let client = reqwest::Client::new();
        let err = fetch(&cancel, &tx, &client, "https://images.invalid/img.qcow2", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, HutchError::Cancelled));
    }

    #[tokio::test]
    async fn fetch_errors_when_coordinator_is_gone() {
        let (tx, rx, cancel) = plumbing();
        drop(rx);

        let client = reqwest::Client::new();
        let err = fetch(&cancel, &tx, &client, "/tmp/whatever.img", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, HutchError::Transport { .. }));
    }
}
