use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use booboo_client::transport::HttpTransport;
use booboo_client::worker::SpawnWorker;
use booboo_client::{Client, WorkerState};
use httpmock::prelude::*;
use utils::{
    assert_or_retry, client_for, config_for, stalled, value_error, CountingSpawner,
    ExhaustedSpawner,
};

mod utils;

fn client_with_spawner(endpoint: String, spawner: Arc<dyn SpawnWorker>) -> Client {
    let config = config_for(endpoint);
    let transport = HttpTransport::new(&config).expect("failed to create transport");
    Client::with_spawner(config, Arc::new(transport), spawner)
}

#[test]
fn test_worker_starts_on_first_capture() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/ingest/");
        then.status(200);
    });
    let client = client_for(server.url("/ingest/"));
    assert_eq!(client.state(), WorkerState::Uninitialized);

    client.capture_exception(&value_error("first"));

    assert_eq!(client.state(), WorkerState::Running);
    assert_or_retry(|| mock.hits() == 1);
}

#[test]
fn test_concurrent_first_captures_start_one_worker() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/ingest/");
        then.status(200);
    });
    let spawner = Arc::new(CountingSpawner::default());
    let client = client_with_spawner(server.url("/ingest/"), spawner.clone());

    thread::scope(|scope| {
        for i in 0..16 {
            let client = &client;
            scope.spawn(move || client.capture_exception(&value_error(&format!("thread {}", i))));
        }
    });
    assert!(client.shutdown());

    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
    mock.assert_hits(16);
}

#[test]
fn test_delivers_synchronously_when_worker_cannot_start() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/ingest/");
        then.status(200);
    });
    let client = client_with_spawner(server.url("/ingest/"), Arc::new(ExhaustedSpawner));

    client.capture_exception(&value_error("no threads left"));

    // Sent before capture returned.
    mock.assert_hits(1);
    assert_eq!(client.state(), WorkerState::Uninitialized);
    assert_eq!(client.pending_events(), 0);
}

#[test]
fn test_stalled_worker_drops_newest_without_blocking() {
    let config = config_for("http://127.0.0.1:1/ingest/".to_owned())
        .with_shutdown_timeout(Duration::from_millis(100));
    let transport = HttpTransport::new(&config).unwrap();
    let client = Client::with_spawner(config, Arc::new(transport), stalled());

    let start = Instant::now();
    for i in 0..101 {
        client.capture_exception(&value_error(&format!("event {}", i)));
    }

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(client.pending_events(), 100);
    assert_eq!(client.dropped_events(), 1);
}

#[test]
fn test_shutdown_drains_pending_events() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/ingest/");
        then.status(200).delay(Duration::from_millis(20));
    });
    let client = client_for(server.url("/ingest/"));

    for i in 0..10 {
        client.capture_exception(&value_error(&format!("event {}", i)));
    }
    assert!(client.shutdown());

    mock.assert_hits(10);
    assert_eq!(client.pending_events(), 0);
    assert_eq!(client.state(), WorkerState::Stopped);
}

#[test]
fn test_shutdown_gives_up_on_hung_collector() {
    let server = MockServer::start();
    let _hung = server.mock(|when, then| {
        when.method(POST).path("/ingest/");
        then.status(200).delay(Duration::from_secs(3));
    });
    let config = config_for(server.url("/ingest/"))
        .with_shutdown_timeout(Duration::from_millis(200))
        .with_request_timeout(Duration::from_secs(10));
    let client = Client::new(config).unwrap();

    client.capture_exception(&value_error("stuck"));
    client.capture_exception(&value_error("behind stuck"));

    let start = Instant::now();
    assert!(!client.shutdown());
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(client.state(), WorkerState::Stopped);

    // Already stopped, returns right away.
    assert!(client.shutdown());
}

#[test]
fn test_drop_shuts_down() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/ingest/");
        then.status(200);
    });
    let client = client_for(server.url("/ingest/"));

    client.capture_exception(&value_error("flushed on drop"));
    drop(client);

    mock.assert_hits(1);
}

#[test]
fn test_captures_after_shutdown_are_dropped() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/ingest/");
        then.status(200);
    });
    let client = client_for(server.url("/ingest/"));

    client.capture_exception(&value_error("before"));
    assert!(client.shutdown());
    client.capture_exception(&value_error("after"));

    mock.assert_hits(1);
    assert_eq!(client.dropped_events(), 1);
}
