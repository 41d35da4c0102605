use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time;

use booboo_common::EventPayload;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task;
use tracing::{debug, error, warn};

use crate::error::{QueueError, TransportError, WorkerError};
use crate::queue::{DeliveryQueue, DeliveryReceiver};
use crate::transport::{deliver, Transport};

pub const WORKER_THREAD_NAME: &str = "booboo-worker";
const SHUTDOWN_POLL_INTERVAL: time::Duration = time::Duration::from_millis(5);

pub const EVENTS_SENT_COUNTER: &str = "booboo_events_sent_total";
pub const EVENTS_DROPPED_COUNTER: &str = "booboo_events_dropped_total";
pub const DELIVERY_FAILURES_COUNTER: &str = "booboo_delivery_failures_total";
pub const DELIVERY_DURATION_HISTOGRAM: &str = "booboo_delivery_duration_seconds";

/// Lifecycle of the background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Uninitialized = 0,
    Starting = 1,
    Running = 2,
    Draining = 3,
    Stopped = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Uninitialized,
            1 => WorkerState::Starting,
            2 => WorkerState::Running,
            3 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }

    fn load(state: &AtomicU8) -> Self {
        Self::from_u8(state.load(Ordering::SeqCst))
    }

    /// Move `state` from `from` to `to`, unless something else moved it first.
    fn transition(state: &AtomicU8, from: WorkerState, to: WorkerState) -> bool {
        state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Why an event was dropped before reaching the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    QueueFull,
    TooBig,
    Shutdown,
}

impl DropCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropCause::QueueFull => "queue_full",
            DropCause::TooBig => "too_big",
            DropCause::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for DropCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running totals of what happened to captured events.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    sent: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl DeliveryStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn record_sent(&self, elapsed: time::Duration) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(EVENTS_SENT_COUNTER).increment(1);
        metrics::histogram!(DELIVERY_DURATION_HISTOGRAM).record(elapsed.as_secs_f64());
    }

    pub fn record_dropped(&self, cause: DropCause) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(EVENTS_DROPPED_COUNTER, "cause" => cause.as_str()).increment(1);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(DELIVERY_FAILURES_COUNTER).increment(1);
    }
}

/// Starts the thread that runs the delivery loop.
pub trait SpawnWorker: Send + Sync {
    fn spawn(&self, name: &str, work: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()>;
}

/// Runs the delivery loop on a dedicated OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl SpawnWorker for ThreadSpawner {
    fn spawn(&self, name: &str, work: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()> {
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(work)
            .map(drop)
    }
}

/// What to do with a freshly captured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Hand it to the running worker.
    Enqueue,
    /// The worker couldn't be started: deliver it on the calling thread.
    Inline,
    /// Shutdown has begun.
    Discard,
}

/// Owns the delivery queue and the single worker draining it.
///
/// The worker is only started when the first event arrives. Starting is guarded by
/// the state (checked without locking on the hot path) and a mutex, so concurrent
/// first captures start exactly one thread. A worker that can't run hands the
/// queue back and resets the state, so the next capture starts it again.
pub struct Worker {
    state: Arc<AtomicU8>,
    // Held while starting and stopping. Resolves once the loop has drained the queue.
    done: Mutex<Option<oneshot::Receiver<()>>>,
    queue: Arc<DeliveryQueue>,
    transport: Arc<dyn Transport>,
    stats: Arc<DeliveryStats>,
    spawner: Arc<dyn SpawnWorker>,
    max_payload_bytes: usize,
}

impl Worker {
    pub fn new(
        queue: Arc<DeliveryQueue>,
        transport: Arc<dyn Transport>,
        spawner: Arc<dyn SpawnWorker>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(WorkerState::Uninitialized as u8)),
            done: Mutex::new(None),
            queue,
            transport,
            stats: Arc::new(DeliveryStats::default()),
            spawner,
            max_payload_bytes,
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::load(&self.state)
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    fn set_state(&self, state: WorkerState) {
        debug!(?state, "delivery worker state changed");
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Hand `payload` over for delivery. Never blocks on the network unless the
    /// worker can't be started.
    pub fn submit(&self, payload: EventPayload) {
        match self.dispatch() {
            Dispatch::Enqueue => match self.queue.try_push(payload) {
                Ok(()) => {}
                Err(e) => {
                    let cause = match e {
                        QueueError::Full => DropCause::QueueFull,
                        QueueError::Closed => DropCause::Shutdown,
                    };
                    debug!(%cause, "dropping event: {}", e);
                    self.stats.record_dropped(cause);
                }
            },
            Dispatch::Inline => self.deliver_inline(payload),
            Dispatch::Discard => {
                debug!("dropping event captured after shutdown");
                self.stats.record_dropped(DropCause::Shutdown);
            }
        }
    }

    /// Decide how to deliver, starting the worker if it isn't running yet.
    pub fn dispatch(&self) -> Dispatch {
        if let Some(dispatch) = self.dispatch_for_state() {
            return dispatch;
        }

        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(dispatch) = self.dispatch_for_state() {
            return dispatch;
        }

        self.set_state(WorkerState::Starting);

        let (done_tx, done_rx) = oneshot::channel();
        let delivery_loop = DeliveryLoop {
            state: self.state.clone(),
            queue: self.queue.clone(),
            transport: self.transport.clone(),
            stats: self.stats.clone(),
            max_payload_bytes: self.max_payload_bytes,
            done: done_tx,
        };

        match self
            .spawner
            .spawn(WORKER_THREAD_NAME, Box::new(move || delivery_loop.run()))
        {
            Ok(()) => {
                *done = Some(done_rx);
                if WorkerState::transition(&self.state, WorkerState::Starting, WorkerState::Running)
                {
                    debug!(state = ?WorkerState::Running, "delivery worker state changed");
                    Dispatch::Enqueue
                } else {
                    // The new thread already gave up.
                    Dispatch::Inline
                }
            }
            Err(e) => {
                let error = WorkerError::from(e);
                error!("{}, delivering on the calling thread", error);
                self.set_state(WorkerState::Uninitialized);
                Dispatch::Inline
            }
        }
    }

    fn dispatch_for_state(&self) -> Option<Dispatch> {
        match self.state() {
            WorkerState::Running => Some(Dispatch::Enqueue),
            WorkerState::Draining | WorkerState::Stopped => Some(Dispatch::Discard),
            WorkerState::Uninitialized | WorkerState::Starting => None,
        }
    }

    /// Deliver without the worker, before returning to the caller.
    ///
    /// On a multi-threaded tokio runtime the send runs in place of the current task.
    /// A current-thread runtime can't be blocked from one of its own tasks, so
    /// there the send is spawned on it instead.
    fn deliver_inline(&self, payload: EventPayload) {
        let transport = self.transport.clone();
        let stats = self.stats.clone();
        let max_payload_bytes = self.max_payload_bytes;

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                drop(handle.spawn(async move {
                    deliver_and_record(transport.as_ref(), &payload, max_payload_bytes, &stats)
                        .await;
                }));
                return;
            }
            Ok(handle) => Some(handle),
            Err(_) => None,
        };

        let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
            let delivery =
                deliver_and_record(transport.as_ref(), &payload, max_payload_bytes, &stats);
            match &handle {
                Some(handle) => task::block_in_place(|| handle.block_on(delivery)),
                None => match current_thread_runtime() {
                    Ok(runtime) => runtime.block_on(delivery),
                    Err(e) => {
                        error!("failed to build runtime for inline delivery: {}", e);
                        stats.record_failed();
                    }
                },
            }
        }));

        if delivered.is_err() {
            error!(
                exception_type = %payload.exception_type,
                "inline delivery panicked, dropping event"
            );
            stats.record_failed();
        }
    }

    /// Stop accepting events and wait up to `timeout` for the queued ones to be
    /// delivered. Returns whether the worker finished in time. Calling it again is
    /// a no-op that returns true.
    pub fn shutdown(&self, timeout: time::Duration) -> bool {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);

        match self.state() {
            WorkerState::Draining | WorkerState::Stopped => return true,
            WorkerState::Uninitialized | WorkerState::Starting => {
                self.queue.close();
                self.set_state(WorkerState::Stopped);
                return true;
            }
            WorkerState::Running => {}
        }

        self.set_state(WorkerState::Draining);
        self.queue.close();

        let finished = match done.take() {
            Some(done_rx) => match wait_until_done(done_rx, timeout) {
                Ok(()) => true,
                Err(TryRecvError::Empty) => {
                    warn!(
                        pending = self.queue.len(),
                        "delivery worker did not finish within {:?}, giving up", timeout
                    );
                    false
                }
                Err(TryRecvError::Closed) => {
                    warn!("delivery worker exited without draining the queue");
                    false
                }
            },
            None => true,
        };

        self.set_state(WorkerState::Stopped);
        finished
    }
}

/// Poll `done` until it resolves or `timeout` passes, in which case it is still `Empty`.
fn wait_until_done(
    mut done: oneshot::Receiver<()>,
    timeout: time::Duration,
) -> Result<(), TryRecvError> {
    let deadline = time::Instant::now() + timeout;
    loop {
        match done.try_recv() {
            Err(TryRecvError::Empty) if time::Instant::now() < deadline => {
                thread::sleep(SHUTDOWN_POLL_INTERVAL)
            }
            result => return result,
        }
    }
}

/// The loop run by the worker thread.
struct DeliveryLoop {
    state: Arc<AtomicU8>,
    queue: Arc<DeliveryQueue>,
    transport: Arc<dyn Transport>,
    stats: Arc<DeliveryStats>,
    max_payload_bytes: usize,
    done: oneshot::Sender<()>,
}

impl DeliveryLoop {
    fn run(self) {
        let Some(mut receiver) = self.queue.take_receiver() else {
            warn!("delivery queue is already being drained, exiting");
            return;
        };

        let runtime = match current_thread_runtime() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("failed to build delivery worker runtime: {}", e);
                self.give_up(receiver);
                return;
            }
        };

        debug!("delivery worker started");
        self.drain(&runtime, &mut receiver);
        debug!("delivery worker stopped");

        if self.done.send(()).is_err() {
            debug!("nobody waiting for the delivery worker to stop");
        }
    }

    /// Deliver events until the queue is closed and empty. A panicking delivery
    /// counts as a failure and the loop carries on.
    fn drain(&self, runtime: &tokio::runtime::Runtime, receiver: &mut DeliveryReceiver) {
        while let Some(payload) = runtime.block_on(receiver.recv()) {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                runtime.block_on(deliver_and_record(
                    self.transport.as_ref(),
                    &payload,
                    self.max_payload_bytes,
                    &self.stats,
                ))
            }));

            if delivered.is_err() {
                error!(
                    exception_type = %payload.exception_type,
                    "delivery panicked, dropping event"
                );
                self.stats.record_failed();
            }
        }
    }

    /// Hand the queue back and reset the state so the next capture restarts the
    /// worker. Dropping `done` tells a waiting shutdown the queue wasn't drained.
    fn give_up(self, receiver: DeliveryReceiver) {
        self.queue.restore_receiver(receiver);

        let reset = [WorkerState::Running, WorkerState::Starting]
            .into_iter()
            .any(|from| WorkerState::transition(&self.state, from, WorkerState::Uninitialized));
        if reset {
            warn!("delivery worker stopped early, it will be restarted on the next capture");
        }
    }
}

fn current_thread_runtime() -> io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

/// Deliver one event, recording the outcome. Failures end here.
pub async fn deliver_and_record(
    transport: &dyn Transport,
    payload: &EventPayload,
    max_payload_bytes: usize,
    stats: &DeliveryStats,
) {
    let now = time::Instant::now();

    match deliver(transport, payload, max_payload_bytes).await {
        Ok(()) => stats.record_sent(now.elapsed()),
        Err(TransportError::TooBig { size, limit }) => {
            debug!(size, limit, "dropping event too big to send");
            stats.record_dropped(DropCause::TooBig);
        }
        Err(e) => {
            warn!(
                exception_type = %payload.exception_type,
                "failed to deliver event: {}", e
            );
            stats.record_failed();
        }
    }
}
