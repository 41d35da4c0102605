use std::any::Any;
use std::error::Error;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use booboo_common::{
    build_payload, extract_exception_chain, FrameSnapshot, RaisedError, Request, StackSnapshot,
    User,
};
use envconfig::Envconfig;
use tracing::{debug, error};

use crate::config::Config;
use crate::error::ConfigError;
use crate::queue::DeliveryQueue;
use crate::transport::{HttpTransport, Transport};
use crate::worker::{
    DeliveryStats, SpawnWorker, ThreadSpawner, Worker, WorkerState, WORKER_THREAD_NAME,
};

pub const EVENTS_CAPTURED_COUNTER: &str = "booboo_events_captured_total";

/// Type name panics are reported under.
pub const PANIC_TYPE_NAME: &str = "Panic";

/// Reports errors to the collector.
///
/// Capturing builds the event on the calling thread and queues it; a single
/// background thread, started on first capture, sends queued events in order.
/// Nothing here ever returns an error to or panics in the caller. Dropping the
/// client shuts it down, waiting at most the configured shutdown timeout for
/// pending events.
pub struct Client {
    config: Config,
    worker: Worker,
    user: RwLock<Option<User>>,
}

impl Client {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let transport = HttpTransport::new(&config)?;

        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Configure from `BOOBOO_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(Config::init_from_env()?)
    }

    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self::with_spawner(config, transport, Arc::new(ThreadSpawner))
    }

    pub fn with_spawner(
        config: Config,
        transport: Arc<dyn Transport>,
        spawner: Arc<dyn SpawnWorker>,
    ) -> Self {
        let queue = Arc::new(DeliveryQueue::new(config.queue_capacity));
        let worker = Worker::new(queue, transport, spawner, config.max_payload_bytes);

        Self {
            config,
            worker,
            user: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn capture_exception(&self, error: &RaisedError) {
        self.capture_exception_with(error, None, None);
    }

    /// Report `error` along with the request being served and who made it. The
    /// user given here is laid over the one from [`Client::set_user`].
    pub fn capture_exception_with(
        &self,
        error: &RaisedError,
        request: Option<Request>,
        user: Option<User>,
    ) {
        metrics::counter!(EVENTS_CAPTURED_COUNTER).increment(1);

        let captured = panic::catch_unwind(AssertUnwindSafe(|| {
            let chain = extract_exception_chain(error);
            let persistent_user = self.user.read().unwrap_or_else(PoisonError::into_inner);

            build_payload(
                error,
                chain,
                request,
                user,
                &self.config.environment,
                persistent_user.as_ref(),
            )
        }));

        match captured {
            Ok(payload) => self.worker.submit(payload),
            Err(_) => error!(
                exception_type = error.type_name(),
                "failed to build event, dropping it"
            ),
        }
    }

    /// Report any `std::error::Error`, its sources becoming the chain of causes.
    pub fn capture_error<E: Error + 'static>(&self, error: &E) {
        self.capture_exception(&RaisedError::from_error(error));
    }

    /// Report every panic through this client, then pass it on to the hook that
    /// was installed before. Call it once, from the code that sets up the process.
    ///
    /// The hook only holds a weak reference, so it doesn't keep the client alive;
    /// once the client is gone panics go straight to the previous hook. Panics on
    /// the delivery thread are not reported, a panicking transport would otherwise
    /// feed itself.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let client = Arc::downgrade(self);
        let previous = panic::take_hook();

        panic::set_hook(Box::new(move |info| {
            let on_worker = thread::current().name() == Some(WORKER_THREAD_NAME);
            if let Some(client) = client.upgrade().filter(|_| !on_worker) {
                client.capture_exception(&panic_error(info.payload(), info.location()));
            }
            previous(info);
        }));
    }

    /// Set the user attached to every following event, or clear it with `None`.
    pub fn set_user(&self, user: Option<User>) {
        let mut current = self.user.write().unwrap_or_else(PoisonError::into_inner);
        *current = user;
    }

    pub fn user(&self) -> Option<User> {
        self.user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn stats(&self) -> &DeliveryStats {
        self.worker.stats()
    }

    pub fn dropped_events(&self) -> u64 {
        self.worker.stats().dropped()
    }

    /// Events queued but not yet handed to the transport.
    pub fn pending_events(&self) -> usize {
        self.worker.queue().len()
    }

    /// Deliver what is queued and stop. Returns false if the worker didn't finish
    /// within the shutdown timeout.
    pub fn shutdown(&self) -> bool {
        debug!("shutting down booboo client");
        self.worker.shutdown(self.config.shutdown_timeout.0)
    }
}

/// Turn a panic into an error with a single frame, where it was raised.
fn panic_error(payload: &(dyn Any + Send), location: Option<&Location<'_>>) -> RaisedError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Box<dyn Any>".to_owned());

    let error = RaisedError::new(PANIC_TYPE_NAME, message);
    match location {
        Some(location) => {
            let frame = FrameSnapshot::new(location.file(), "<unknown>", location.line());
            error.with_stack(StackSnapshot::new().with_frame(frame))
        }
        None => error,
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.shutdown() {
            debug!("booboo client dropped with events still pending");
        }
    }
}
