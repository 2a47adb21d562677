//! Installation monitor.
//!
//! Owns the callback listener handed over by the creation pipeline and
//! serves the guest's first-boot protocol until cloud-init signals
//! completion: progress bodies are forwarded as Result lines, and
//! `GET /download` requests are proxied through the download coordinator so
//! the guest can fetch artifacts via the host's proxy configuration.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::CreateResult;
use crate::cloudinit::{FAILED_PREFIX, FINISHED_MARKER};
use crate::error::HutchError;
use crate::image::{self, DownloadRequest};

/// Open the local callback listener on an ephemeral port.
pub async fn create_local_listener() -> Result<(TcpListener, u16), HutchError> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| HutchError::io("binding installation listener", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| HutchError::io("reading installation listener port", e))?
        .port();
    Ok((listener, port))
}

/// Largest request body accepted from the guest. Phone-home bodies are
/// short progress lines; anything bigger is not ours.
const MAX_BODY_BYTES: usize = 64 * 1024;

enum GuestSignal {
    Continue,
    Finished,
    Failed(String),
}

/// Serve the first-boot protocol until the guest reports completion.
///
/// Takes ownership of the listener; it is closed when this returns, on
/// every path including cancellation.
pub async fn monitor_installation(
    cancel: &CancellationToken,
    result_tx: &mpsc::Sender<CreateResult>,
    download_tx: &mpsc::Sender<DownloadRequest>,
    client: &reqwest::Client,
    listener: TcpListener,
    instance_dir: &Path,
) -> Result<(), HutchError> {
    loop {
        let (stream, _addr) = tokio::select! {
            accepted = listener.accept() => accepted
                .map_err(|e| HutchError::io("accepting guest connection", e))?,
            _ = cancel.cancelled() => return Err(HutchError::Cancelled),
        };

        // The listener is an open local port; a misbehaving client must
        // not take down the wait for the guest.
        let signal = tokio::select! {
            signal = handle_connection(cancel, result_tx, download_tx, client, stream, instance_dir) => match signal {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!("dropping bad guest connection: {e}");
                    GuestSignal::Continue
                }
            },
            _ = cancel.cancelled() => return Err(HutchError::Cancelled),
        };

        match signal {
            GuestSignal::Continue => {}
            GuestSignal::Finished => return Ok(()),
            GuestSignal::Failed(message) => {
                return Err(HutchError::ExternalTool {
                    tool: "cloud-init".into(),
                    message,
                });
            }
        }
    }
}

async fn handle_connection(
    cancel: &CancellationToken,
    result_tx: &mpsc::Sender<CreateResult>,
    download_tx: &mpsc::Sender<DownloadRequest>,
    client: &reqwest::Client,
    stream: TcpStream,
    instance_dir: &Path,
) -> Result<GuestSignal, HutchError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (method, target, content_length) = read_request_head(&mut reader).await?;

    if content_length > MAX_BODY_BYTES {
        respond_empty(&mut write_half, "413 Payload Too Large").await;
        return Ok(GuestSignal::Continue);
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| HutchError::io("reading guest request body", e))?;
    }
    let body = String::from_utf8_lossy(&body).trim().to_string();

    match (method.as_str(), target.as_str()) {
        ("POST" | "PUT", "/") => {
            respond_empty(&mut write_half, "200 OK").await;
            log_guest_line(instance_dir, &body);

            if body == FINISHED_MARKER {
                return Ok(GuestSignal::Finished);
            }
            if body.starts_with(FAILED_PREFIX) {
                return Ok(GuestSignal::Failed(body));
            }
            if !body.is_empty() {
                let _ = result_tx.send(CreateResult::line(format!("{body}\n"))).await;
            }
            Ok(GuestSignal::Continue)
        }
        ("GET", t) if t.starts_with("/download?url=") => {
            let url = &t["/download?url=".len()..];
            match proxy_download(cancel, result_tx, download_tx, client, url).await {
                Ok(path) => {
                    respond_file(&mut write_half, &path).await;
                }
                Err(e) => {
                    tracing::warn!(url, "guest download failed: {e}");
                    respond_empty(&mut write_half, "502 Bad Gateway").await;
                }
            }
            Ok(GuestSignal::Continue)
        }
        _ => {
            respond_empty(&mut write_half, "404 Not Found").await;
            Ok(GuestSignal::Continue)
        }
    }
}

async fn proxy_download(
    cancel: &CancellationToken,
    result_tx: &mpsc::Sender<CreateResult>,
    download_tx: &mpsc::Sender<DownloadRequest>,
    client: &reqwest::Client,
    url: &str,
) -> Result<PathBuf, HutchError> {
    let result_tx = result_tx.clone();
    image::fetch(cancel, download_tx, client, url, move |p| {
        let _ = result_tx.try_send(CreateResult::download_progress(p));
    })
    .await
}

async fn read_request_head(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> Result<(String, String, usize), HutchError> {
    let mut request_line = String::new();
    read_line(reader, &mut request_line).await?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        read_line(reader, &mut header).await?;
        let header = header.trim();
        if header.is_empty() {
            break;
        }
        if let Some(v) = header
            .to_ascii_lowercase()
            .strip_prefix("content-length:")
            .map(str::trim)
        {
            content_length = v.parse().unwrap_or(0);
        }
    }

    Ok((method, target, content_length))
}

async fn read_line(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    buf: &mut String,
) -> Result<(), HutchError> {
    use tokio::io::AsyncBufReadExt;
    reader
        .read_line(buf)
        .await
        .map_err(|e| HutchError::io("reading guest request", e))?;
    Ok(())
}

async fn respond_empty(write_half: &mut tokio::net::tcp::OwnedWriteHalf, status: &str) {
    let _ = write_half
        .write_all(format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").as_bytes())
        .await;
}

async fn respond_file(write_half: &mut tokio::net::tcp::OwnedWriteHalf, path: &Path) {
    let Ok(data) = tokio::fs::read(path).await else {
        respond_empty(write_half, "502 Bad Gateway").await;
        return;
    };
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        data.len()
    );
    let _ = write_half.write_all(head.as_bytes()).await;
    let _ = write_half.write_all(&data).await;
}

/// Best-effort transcript of guest messages for later inspection.
fn log_guest_line(instance_dir: &Path, line: &str) {
    if line.is_empty() {
        return;
    }
    use std::io::Write;
    if let Ok(mut f) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(instance_dir.join("install.log"))
    {
        let _ = writeln!(f, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        port: u16,
        result_rx: mpsc::Receiver<CreateResult>,
        task: tokio::task::JoinHandle<Result<(), HutchError>>,
        cancel: CancellationToken,
        _dir: tempfile::TempDir,
    }

    async fn spawn_monitor() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (listener, port) = create_local_listener().await.unwrap();
        let (result_tx, result_rx) = mpsc::channel(16);
        let (download_tx, download_rx) = mpsc::channel(4);
        tokio::spawn(image::run_downloader(
            dir.path().join("cache"),
            download_rx,
        ));

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let instance_dir = dir.path().to_path_buf();
        let task = tokio::spawn(async move {
            let client = reqwest::Client::new();
            monitor_installation(
                &task_cancel,
                &result_tx,
                &download_tx,
                &client,
                listener,
                &instance_dir,
            )
            .await
        });

        Harness {
            port,
            result_rx,
            task,
            cancel,
            _dir: dir,
        }
    }

    async fn post(port: u16, body: &str) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let req = format!(
            "POST / HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf).await;
    }

    #[tokio::test]
    async fn progress_bodies_become_result_lines() {
        let mut h = spawn_monitor().await;
        post(h.port, "Configuring guest").await;
        let line = h.result_rx.recv().await.unwrap();
        assert_eq!(line.line, "Configuring guest\n");

        post(h.port, FINISHED_MARKER).await;
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn finished_marker_completes_successfully() {
        let h = spawn_monitor().await;
        post(h.port, FINISHED_MARKER).await;
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failure_marker_surfaces_as_error() {
        let h = spawn_monitor().await;
        post(h.port, "FAILED: cloud-init exploded").await;
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(err, HutchError::ExternalTool { .. }));
        assert!(err.to_string().contains("cloud-init"));
    }

    #[tokio::test]
    async fn truncated_request_does_not_abort_the_wait() {
        let h = spawn_monitor().await;

        // Claim a body, send only part of it, hang up.
        let mut stream = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        stream
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\nshort")
            .await
            .unwrap();
        drop(stream);

        post(h.port, FINISHED_MARKER).await;
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_up_front() {
        let h = spawn_monitor().await;

        let mut stream = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        stream
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 99999999999\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf).await;
        assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.1 413"));

        post(h.port, FINISHED_MARKER).await;
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_unblocks_the_wait() {
        let h = spawn_monitor().await;
        h.cancel.cancel();
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(err, HutchError::Cancelled));
    }

    #[tokio::test]
    async fn download_proxy_serves_local_files() {
        let h = spawn_monitor().await;
        let payload = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(payload.path(), b"artifact-bytes").unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        let req = format!(
            "GET /download?url={} HTTP/1.1\r\nHost: x\r\n\r\n",
            payload.path().display()
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf);
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("artifact-bytes"));

        post(h.port, FINISHED_MARKER).await;
        h.task.await.unwrap().unwrap();
    }
}
