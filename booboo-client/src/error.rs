use std::io;

use http::StatusCode;
use reqwest::header::InvalidHeaderValue;
use thiserror::Error;

/// Enumeration of errors that prevent a client from being configured.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration from the environment: {0}")]
    EnvError(#[from] envconfig::Error),
    #[error("dsn must not be empty")]
    EmptyDsn,
    #[error("dsn cannot be sent as a header value")]
    InvalidDsn(#[from] InvalidHeaderValue),
    #[error("error parsing endpoint url")]
    ParseUrlError(#[from] url::ParseError),
    #[error("{0} is not a supported endpoint scheme")]
    UnsupportedScheme(String),
    #[error("queue capacity must be at least 1")]
    ZeroQueueCapacity,
    #[error("failed to construct http client: {0}")]
    HttpClientError(reqwest::Error),
}

/// Enumeration of errors related to delivering a single event.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("event is {size} bytes, over the {limit} bytes limit")]
    TooBig { size: usize, limit: usize },
    #[error("failed to serialize event: {0}")]
    SerializeError(#[from] serde_json::Error),
    #[error("request to collector failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("collector responded with {0}")]
    StatusError(StatusCode),
}

/// Enumeration of errors related to the background delivery worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to spawn delivery worker: {0}")]
    SpawnError(#[from] io::Error),
}

/// Why an event couldn't be queued for delivery.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("delivery queue is full")]
    Full,
    #[error("delivery queue is closed")]
    Closed,
}
