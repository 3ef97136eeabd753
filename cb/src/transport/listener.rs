//! Host side of the socket transport
//!
//! Binds the socket (cleaning up a stale file from a previous run), accepts
//! worker connections, and registers each one with the [`HostRouter`] once
//! its hello line has identified it. Two pumps per worker: outbound frames
//! from the router's channel onto the socket, inbound lines into
//! [`HostRouter::on_worker_message`].

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::HELLO_EVENT;
use crate::codec;
use crate::config::BusConfig;
use crate::envelope::WorkerId;
use crate::router::HostRouter;

/// Bind the bus socket, removing a stale socket file if one exists.
pub fn bind(config: &BusConfig) -> Result<(UnixListener, PathBuf)> {
    let socket_path = config.socket_path();
    debug!(?socket_path, "binding bus socket");

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }
    if socket_path.exists() {
        debug!(?socket_path, "removing stale socket");
        std::fs::remove_file(&socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(&socket_path).context("Failed to bind bus socket")?;
    Ok((listener, socket_path))
}

/// Remove the socket file on shutdown.
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

/// Accept worker connections until the listener is closed.
pub async fn serve(listener: UnixListener, router: HostRouter, config: BusConfig) -> Result<()> {
    info!("bus listener started");
    loop {
        let (stream, _) = listener.accept().await.context("Failed to accept connection")?;
        let router = router.clone();
        let max_line = config.max_line_bytes;
        tokio::spawn(async move {
            if let Err(error) = handle_worker(stream, router, max_line).await {
                warn!(%error, "worker connection ended with error");
            }
        });
    }
}

async fn handle_worker(stream: UnixStream, router: HostRouter, max_line: usize) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // First line must be the hello that names the worker.
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await.context("Failed to read hello")?;
    if bytes_read == 0 {
        return Err(eyre::eyre!("Connection closed before hello"));
    }
    let worker_id = parse_hello(line.trim())?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    router.add_worker(worker_id, tx);

    // Outbound pump: router channel -> socket. Ends when the router drops
    // this worker's sender.
    let writer = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    // Inbound pump: socket lines -> router.
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(n) if n > max_line => {
                warn!(worker_id = %worker_id, bytes = n, "line too long, dropping connection");
                break;
            }
            Ok(_) => router.on_worker_message(worker_id, line.trim().as_bytes()),
            Err(error) => {
                warn!(worker_id = %worker_id, %error, "read failed, dropping connection");
                break;
            }
        }
    }

    router.remove_worker(worker_id);
    writer.await.ok();
    Ok(())
}

/// A hello is an envelope named [`HELLO_EVENT`] whose header carries the
/// connecting worker's id.
fn parse_hello(line: &str) -> Result<WorkerId> {
    let envelope = codec::decode(line.as_bytes()).context("Malformed hello")?;
    if envelope.name != HELLO_EVENT {
        return Err(eyre::eyre!("Expected {HELLO_EVENT}, got {}", envelope.name));
    }
    envelope
        .header
        .origin
        .ok_or_else(|| eyre::eyre!("Hello without a worker id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bind_creates_parent_dir() {
        let temp = TempDir::new().unwrap();
        let config = BusConfig::default().with_socket_path(temp.path().join("sub").join("bus.sock"));

        let (_, path) = bind(&config).unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_bind_removes_stale_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("bus.sock");
        std::fs::write(&socket_path, "stale").unwrap();

        let config = BusConfig::default().with_socket_path(&socket_path);
        assert!(bind(&config).is_ok());
    }

    #[test]
    fn test_cleanup_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("bus.sock");
        std::fs::write(&socket_path, "x").unwrap();

        cleanup_socket(&socket_path);
        assert!(!socket_path.exists());

        // Missing file is fine too
        cleanup_socket(&socket_path);
    }

    #[test]
    fn test_parse_hello() {
        let mut hello = Envelope::new(HELLO_EVENT);
        hello.header.origin = Some(WorkerId(7));
        let line = String::from_utf8(codec::encode(&hello).unwrap()).unwrap();
        assert_eq!(parse_hello(&line).unwrap(), WorkerId(7));
    }

    #[test]
    fn test_parse_hello_rejects_wrong_event() {
        let mut wrong = Envelope::new("not.hello");
        wrong.header.origin = Some(WorkerId(7));
        let line = String::from_utf8(codec::encode(&wrong).unwrap()).unwrap();
        assert!(parse_hello(&line).is_err());
    }

    #[test]
    fn test_parse_hello_rejects_missing_id() {
        let line = String::from_utf8(codec::encode(&Envelope::new(HELLO_EVENT)).unwrap()).unwrap();
        assert!(parse_hello(&line).is_err());
    }
}
