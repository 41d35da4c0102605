use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use booboo_common::EventPayload;
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};

use crate::error::QueueError;

/// Bounded FIFO between capturing threads and the delivery worker.
///
/// Producers never wait: when the channel is full the new event is refused.
/// Closing drops the only sender, so the worker still receives everything queued
/// before the close and then sees the end of the channel, however full it was.
///
/// The receiving end is parked here until a worker takes it, and handed back if
/// that worker can't run, so a restarted worker picks up the same events.
#[derive(Debug)]
pub struct DeliveryQueue {
    sender: RwLock<Option<Sender<EventPayload>>>,
    receiver: Mutex<Option<DeliveryReceiver>>,
    pending: Arc<AtomicUsize>,
    capacity: usize,
}

/// The worker's end of a [`DeliveryQueue`].
#[derive(Debug)]
pub struct DeliveryReceiver {
    receiver: Receiver<EventPayload>,
    pending: Arc<AtomicUsize>,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        // tokio refuses zero sized channels; Config::validate already rejects them.
        let (tx, rx) = channel(capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));

        Self {
            sender: RwLock::new(Some(tx)),
            receiver: Mutex::new(Some(DeliveryReceiver {
                receiver: rx,
                pending: pending.clone(),
            })),
            pending,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue `payload` for delivery without blocking.
    pub fn try_push(&self, payload: EventPayload) -> Result<(), QueueError> {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(QueueError::Closed);
        };

        // Counted before sending so the worker can never see it go below zero.
        self.pending.fetch_add(1, Ordering::Relaxed);
        match sender.try_send(payload) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.pending.fetch_sub(1, Ordering::Relaxed);
                match e {
                    TrySendError::Full(_) => Err(QueueError::Full),
                    TrySendError::Closed(_) => Err(QueueError::Closed),
                }
            }
        }
    }

    /// Refuse new events. Those already queued are still handed to the worker.
    /// Returns false if the queue was already closed.
    pub fn close(&self) -> bool {
        let mut sender = self.sender.write().unwrap_or_else(PoisonError::into_inner);
        sender.take().is_some()
    }

    /// Take the receiving end, if no worker holds it.
    pub fn take_receiver(&self) -> Option<DeliveryReceiver> {
        self.lock_receiver().take()
    }

    /// Hand back the receiving end of a worker that stopped early.
    pub fn restore_receiver(&self, receiver: DeliveryReceiver) {
        *self.lock_receiver() = Some(receiver);
    }

    /// Number of events waiting for delivery.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn lock_receiver(&self) -> MutexGuard<'_, Option<DeliveryReceiver>> {
        self.receiver.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeliveryReceiver {
    /// Wait for the next event. `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<EventPayload> {
        let payload = self.receiver.recv().await;
        if payload.is_some() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }
        payload
    }
}
