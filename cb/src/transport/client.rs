//! Worker side of the socket transport
//!
//! Connects to the host's socket, introduces itself with a hello envelope,
//! and returns a wired [`WorkerRouter`]. The pumps mirror the listener's:
//! outbound frames from the router's channel onto the socket, inbound lines
//! into [`WorkerRouter::on_primary_message`].

use std::sync::Arc;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::HELLO_EVENT;
use crate::bus::Bus;
use crate::codec;
use crate::config::BusConfig;
use crate::envelope::{Envelope, WorkerId};
use crate::router::WorkerRouter;

/// Connect to the host and return this worker's router.
pub async fn connect_worker(config: &BusConfig, id: WorkerId, bus: Arc<Bus>) -> Result<WorkerRouter> {
    let socket_path = config.socket_path();
    debug!(worker_id = %id, ?socket_path, "connecting to host");
    let stream = UnixStream::connect(&socket_path)
        .await
        .context("Failed to connect to bus socket")?;
    let (read_half, mut write_half) = stream.into_split();

    // Introduce ourselves before anything else flows.
    let mut hello = Envelope::new(HELLO_EVENT);
    hello.header.origin = Some(id);
    let bytes = codec::encode(&hello).context("Failed to encode hello")?;
    write_half.write_all(&bytes).await.context("Failed to send hello")?;
    write_half.write_all(b"\n").await.context("Failed to send hello")?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let router = WorkerRouter::new(id, bus, tx);

    // Outbound pump: router channel -> socket.
    tokio::spawn(async move {
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
    let reader_router = router.clone();
    let max_line = config.max_line_bytes;
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(n) if n > max_line => {
                    warn!(worker_id = %id, bytes = n, "line too long, dropping connection");
                    break;
                }
                Ok(_) => reader_router.on_primary_message(line.trim().as_bytes()),
                Err(error) => {
                    warn!(worker_id = %id, %error, "read failed, dropping connection");
                    break;
                }
            }
        }
        debug!(worker_id = %id, "host connection closed");
    });

    Ok(router)
}
