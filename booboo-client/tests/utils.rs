#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use booboo_client::worker::{SpawnWorker, ThreadSpawner};
use booboo_client::{Client, Config, FrameSnapshot, RaisedError, StackSnapshot};

pub fn client_for(endpoint: String) -> Client {
    Client::new(config_for(endpoint)).expect("failed to create client")
}

pub fn config_for(endpoint: String) -> Config {
    Config::new("proj_test_dsn", endpoint).with_environment("test")
}

pub fn value_error(message: &str) -> RaisedError {
    let stack = StackSnapshot::new()
        .with_frame(FrameSnapshot::new("src/main.rs", "main", 3))
        .with_frame(
            FrameSnapshot::new("src/checkout.rs", "checkout", 17).with_local("cart_size", 2),
        );
    RaisedError::new("ValueError", message).with_stack(stack)
}

/// Poll `check` until it holds, failing the test after five seconds.
pub fn assert_or_retry<F>(check: F)
where
    F: Fn() -> bool,
{
    assert_or_retry_for_duration(check, Duration::from_secs(5))
}

pub fn assert_or_retry_for_duration<F>(check: F, timeout: Duration)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !check() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(check())
}

/// Counts how many delivery threads were started.
#[derive(Default)]
pub struct CountingSpawner {
    pub spawned: AtomicUsize,
}

impl SpawnWorker for CountingSpawner {
    fn spawn(&self, name: &str, work: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        ThreadSpawner.spawn(name, work)
    }
}

/// Behaves as if the process is out of threads.
pub struct ExhaustedSpawner;

impl SpawnWorker for ExhaustedSpawner {
    fn spawn(&self, _: &str, _: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "Resource temporarily unavailable",
        ))
    }
}

/// Accepts the delivery loop but never runs it, as if the worker hung.
#[derive(Default)]
pub struct StalledSpawner {
    parked: Mutex<Vec<Box<dyn FnOnce() + Send + 'static>>>,
}

impl SpawnWorker for StalledSpawner {
    fn spawn(&self, _: &str, work: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()> {
        self.parked
            .lock()
            .expect("poisoned stalled spawner")
            .push(work);
        Ok(())
    }
}

pub fn stalled() -> Arc<StalledSpawner> {
    Arc::new(StalledSpawner::default())
}
