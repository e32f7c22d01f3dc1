use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use tracing::{debug, error};

use chorus_core::{Error, ProviderRequest};

/// Response body as it arrives from the upstream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

pub struct TransportResponse {
    pub status: u16,
    /// `None` when the upstream sent no body.
    pub body: Option<ByteStream>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends a provider request and hands back the streamed body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ProviderRequest) -> Result<TransportResponse, Error>;
}

pub struct HttpTransport {
    client: Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        // Configure client for proper SSE streaming:
        // - Use HTTP/1.1 to avoid HTTP/2 framing issues
        // - Disable automatic decompression which can buffer entire response
        let client = Client::builder()
            .http1_only()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ProviderRequest) -> Result<TransportResponse, Error> {
        let mut builder = self
            .client
            .post(&request.url)
            .header("Accept-Encoding", "identity");
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .json(&request.body)
            .send()
            .await
            .map_err(|e| Error::network(e.to_string()))?;

        let status = response.status();
        debug!(
            status = status.as_u16(),
            content_type = ?response.headers().get("content-type"),
            "Upstream responded"
        );

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %error_text, "Upstream request failed");
            return Ok(TransportResponse {
                status: status.as_u16(),
                body: None,
            });
        }

        if response.content_length() == Some(0) {
            return Ok(TransportResponse {
                status: status.as_u16(),
                body: None,
            });
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::network(e.to_string())));

        Ok(TransportResponse {
            status: status.as_u16(),
            body: Some(Box::pin(body)),
        })
    }
}
