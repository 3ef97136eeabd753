//! Integration tests for ClusterBus
//!
//! These tests verify end-to-end behavior across a host router and several
//! worker routers, first over in-memory channels and then over the real
//! Unix-socket transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clusterbus::bus::create_bus;
use clusterbus::config::BusConfig;
use clusterbus::emitter::Handler;
use clusterbus::envelope::{Envelope, WorkerId};
use clusterbus::router::{HostRouter, WorkerRouter};
use clusterbus::transport;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Route bus tracing through the test writer; `RUST_LOG` controls the level.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wire a worker router to the host over in-memory channels, with a pump
/// task in each direction standing in for the socket.
fn attach_worker(host: &HostRouter, id: u32) -> WorkerRouter {
    init_tracing();
    let worker_id = WorkerId(id);

    let (to_host_tx, mut to_host_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let worker = WorkerRouter::new(worker_id, create_bus(), to_host_tx);

    let (to_worker_tx, mut to_worker_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    host.add_worker(worker_id, to_worker_tx);

    let host = host.clone();
    tokio::spawn(async move {
        while let Some(bytes) = to_host_rx.recv().await {
            host.on_worker_message(worker_id, &bytes);
        }
    });

    let inbound = worker.clone();
    tokio::spawn(async move {
        while let Some(bytes) = to_worker_rx.recv().await {
            inbound.on_primary_message(&bytes);
        }
    });

    worker
}

fn reply_with(worker: &WorkerRouter, name: &str, value: Value) {
    let bus = Arc::clone(worker.bus());
    let handler = Handler::new(move |env| {
        bus.reply(env, value.clone());
        Ok(())
    });
    worker.bus().on(name, &handler);
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// =============================================================================
// Host <-> Worker Query Tests
// =============================================================================

#[tokio::test]
async fn test_worker_queries_host() {
    let host = HostRouter::new(create_bus());
    let worker = attach_worker(&host, 1);

    let host_bus = Arc::clone(host.bus());
    let handler = {
        let bus = Arc::clone(&host_bus);
        Handler::new(move |env| {
            bus.reply(env, json!({"debug": true}));
            Ok(())
        })
    };
    host_bus.on("config.get", &handler);

    let trap = worker.query_primary(Envelope::new("config.get"));
    let value = tokio::time::timeout(Duration::from_secs(1), trap)
        .await
        .expect("Query should resolve");
    assert_eq!(value, json!({"debug": true}));
}

#[tokio::test]
async fn test_host_queries_one_worker() {
    let host = HostRouter::new(create_bus());
    let worker = attach_worker(&host, 1);
    reply_with(&worker, "stats.get", json!({"jobs": 3}));

    let trap = host.query_worker(WorkerId(1), Envelope::new("stats.get"));
    let value = tokio::time::timeout(Duration::from_secs(1), trap)
        .await
        .expect("Query should resolve");
    assert_eq!(value, json!({"jobs": 3}));
}

#[tokio::test]
async fn test_host_queries_all_workers() {
    let host = HostRouter::new(create_bus());
    for id in 1..=3u32 {
        let worker = attach_worker(&host, id);
        reply_with(&worker, "stats.get", json!(id));
    }

    let trap = host.query_all_workers(Envelope::new("stats.get"));
    let value = tokio::time::timeout(Duration::from_secs(1), trap)
        .await
        .expect("Query should resolve");

    // Arrival order is scheduling-dependent; the set of answers is not.
    let mut answers: Vec<u64> = value
        .as_array()
        .expect("Three workers produce an array")
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    answers.sort();
    assert_eq!(answers, vec![1, 2, 3]);
}

// =============================================================================
// Worker <-> Worker Routing Tests
// =============================================================================

#[tokio::test]
async fn test_worker_queries_peer_through_host() {
    let host = HostRouter::new(create_bus());
    let worker_1 = attach_worker(&host, 1);
    let worker_2 = attach_worker(&host, 2);
    reply_with(&worker_2, "peer.ask", json!("ready"));

    let trap = worker_1.query_worker(WorkerId(2), Envelope::new("peer.ask"));
    let value = tokio::time::timeout(Duration::from_secs(1), trap)
        .await
        .expect("Relayed query should resolve");
    assert_eq!(value, json!("ready"));
}

#[tokio::test]
async fn test_worker_broadcast_reaches_everyone_but_origin() {
    let host = HostRouter::new(create_bus());
    let workers: Vec<WorkerRouter> = (1..=3).map(|id| attach_worker(&host, id)).collect();

    let counts = Arc::new(Mutex::new([0usize; 3]));
    for (i, worker) in workers.iter().enumerate() {
        let counts = Arc::clone(&counts);
        let handler = Handler::new(move |_| {
            counts.lock().unwrap()[i] += 1;
            Ok(())
        });
        worker.bus().on("cache.flush", &handler);
    }

    workers[0].send_all_workers(Envelope::new("cache.flush"));
    settle().await;

    assert_eq!(*counts.lock().unwrap(), [0, 1, 1]);
}

#[tokio::test]
async fn test_worker_one_way_send_to_peer() {
    let host = HostRouter::new(create_bus());
    let worker_1 = attach_worker(&host, 1);
    let worker_2 = attach_worker(&host, 2);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        Handler::new(move |env| {
            seen.lock().unwrap().push(env.field("n").cloned());
            Ok(())
        })
    };
    worker_2.bus().on("nudge", &handler);

    worker_1.send_worker(WorkerId(2), Envelope::new("nudge").with_field("n", 7));
    settle().await;

    assert_eq!(seen.lock().unwrap().as_slice(), &[Some(json!(7))]);
}

// =============================================================================
// Socket Transport Tests
// =============================================================================

#[tokio::test]
async fn test_query_over_unix_socket() {
    init_tracing();
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = BusConfig::default().with_socket_path(temp_dir.path().join("bus.sock"));

    let host = HostRouter::new(create_bus());
    let (listener, socket_path) = transport::bind(&config).expect("Failed to bind socket");
    tokio::spawn(transport::serve(listener, host.clone(), config.clone()));

    // Worker registers its handler before connecting so the host can query
    // it as soon as the hello lands.
    let worker_bus = create_bus();
    {
        let bus = Arc::clone(&worker_bus);
        let handler = Handler::new(move |env| {
            bus.reply(env, json!("pong"));
            Ok(())
        });
        worker_bus.on("ping", &handler);
    }
    let worker = transport::connect_worker(&config, WorkerId(1), worker_bus)
        .await
        .expect("Failed to connect worker");
    assert_eq!(worker.id(), WorkerId(1));

    // Wait for the hello to register the worker.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while host.worker_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "Worker never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let trap = host.query_worker(WorkerId(1), Envelope::new("ping"));
    let value = tokio::time::timeout(Duration::from_secs(2), trap)
        .await
        .expect("Query should resolve over the socket");
    assert_eq!(value, json!("pong"));

    transport::cleanup_socket(&socket_path);
}

#[tokio::test]
async fn test_disconnect_unregisters_worker() {
    init_tracing();
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = BusConfig::default().with_socket_path(temp_dir.path().join("bus.sock"));

    let host = HostRouter::new(create_bus());
    let (listener, _) = transport::bind(&config).expect("Failed to bind socket");
    tokio::spawn(transport::serve(listener, host.clone(), config.clone()));

    // A bare connection with a hand-rolled hello, so we control its end.
    let mut stream = tokio::net::UnixStream::connect(config.socket_path())
        .await
        .expect("Failed to connect");
    let mut hello = Envelope::new(transport::HELLO_EVENT);
    hello.header.origin = Some(WorkerId(4));
    let mut bytes = clusterbus::codec::encode(&hello).expect("Failed to encode hello");
    bytes.push(b'\n');
    tokio::io::AsyncWriteExt::write_all(&mut stream, &bytes)
        .await
        .expect("Failed to send hello");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while host.worker_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "Worker never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(host.worker_ids(), vec![WorkerId(4)]);

    // Closing the connection is all it takes; the host sees EOF.
    drop(stream);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while host.worker_count() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "Worker never unregistered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
