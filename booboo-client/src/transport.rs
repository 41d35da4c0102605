use async_trait::async_trait;
use booboo_common::EventPayload;
use reqwest::header;

use crate::config::Config;
use crate::error::{ConfigError, TransportError};

pub const DSN_HEADER: &str = "x-booboo-dsn";

/// Where serialized events go.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, body: &[u8]) -> Result<(), TransportError>;
}

/// Posts events to the collector, one request per event.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: reqwest::Url,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let endpoint: reqwest::Url = config.endpoint.parse()?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::HeaderName::from_static(DSN_HEADER),
            header::HeaderValue::from_str(config.dsn.as_str())?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(format!("booboo-sdk/{}", booboo_common::event::SDK_VERSION))
            .timeout(config.request_timeout.0)
            .build()
            .map_err(ConfigError::HttpClientError)?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, body: &[u8]) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::StatusError(status))
        }
    }
}

/// Serialize `payload` and hand it to `transport`, unless it is over `max_bytes`.
pub async fn deliver(
    transport: &dyn Transport,
    payload: &EventPayload,
    max_bytes: usize,
) -> Result<(), TransportError> {
    let body = serde_json::to_vec(payload)?;
    if body.len() > max_bytes {
        return Err(TransportError::TooBig {
            size: body.len(),
            limit: max_bytes,
        });
    }

    transport.send(&body).await
}
