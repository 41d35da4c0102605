pub mod client;
pub mod config;
pub mod error;
pub mod queue;
pub mod transport;
pub mod worker;

pub use client::Client;
pub use config::Config;
pub use error::{ConfigError, QueueError, TransportError, WorkerError};
pub use transport::{HttpTransport, Transport};
pub use worker::{DeliveryStats, WorkerState};

// The data model, so callers only need this crate.
pub use booboo_common::{
    snapshot_frame, ChainType, ErrorRef, EventPayload, ExceptionRecord, Frame, FrameSnapshot,
    RaisedError, Request, StackSnapshot, User,
};
