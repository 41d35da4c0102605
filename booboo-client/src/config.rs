use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use reqwest::header::HeaderValue;

use crate::error::ConfigError;

pub const DEFAULT_ENDPOINT: &str = "https://api.booboo.dev/ingest/";

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    /// Credential identifying the project events are reported to.
    #[envconfig(from = "BOOBOO_DSN")]
    pub dsn: NonEmptyString,

    #[envconfig(from = "BOOBOO_ENDPOINT", default = "https://api.booboo.dev/ingest/")]
    pub endpoint: String,

    #[envconfig(from = "BOOBOO_ENVIRONMENT", default = "")]
    pub environment: String,

    #[envconfig(from = "BOOBOO_QUEUE_CAPACITY", default = "100")]
    pub queue_capacity: usize,

    #[envconfig(from = "BOOBOO_REQUEST_TIMEOUT_MS", default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "BOOBOO_SHUTDOWN_TIMEOUT_MS", default = "5000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(from = "BOOBOO_MAX_PAYLOAD_BYTES", default = "102400")]
    pub max_payload_bytes: usize,
}

impl Config {
    /// Configuration for reporting to `endpoint`, with defaults for everything else.
    pub fn new(dsn: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            dsn: NonEmptyString(dsn.into()),
            endpoint: endpoint.into(),
            environment: String::new(),
            queue_capacity: 100,
            request_timeout: EnvMsDuration(time::Duration::from_secs(5)),
            shutdown_timeout: EnvMsDuration(time::Duration::from_secs(5)),
            max_payload_bytes: 102_400,
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_request_timeout(mut self, timeout: time::Duration) -> Self {
        self.request_timeout = EnvMsDuration(timeout);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: time::Duration) -> Self {
        self.shutdown_timeout = EnvMsDuration(timeout);
        self
    }

    pub fn with_max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    /// Check that events could actually be sent with this configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dsn.as_str().is_empty() {
            return Err(ConfigError::EmptyDsn);
        }
        HeaderValue::from_str(self.dsn.as_str())?;

        let url = url::Url::parse(&self.endpoint)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_owned()));
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
