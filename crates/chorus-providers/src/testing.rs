//! Scripted transport for driving streaming queries without a network.
//! Only compiled when running tests or with the `testing` feature.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};

use chorus_core::{Error, ProviderRequest};

use crate::transport::{ByteStream, Transport, TransportResponse};

#[derive(Clone)]
enum Script {
    Body {
        status: u16,
        chunks: Vec<Result<Vec<u8>, String>>,
        delay: Option<Duration>,
    },
    NoBody {
        status: u16,
    },
    /// Headers arrive, then the body never yields.
    Hang,
    SendError(String),
}

/// A transport that replays a scripted response for every request.
pub struct ScriptedTransport {
    script: Script,
    /// Captured requests (for assertion).
    pub captured_requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedTransport {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            captured_requests: Mutex::new(Vec::new()),
        }
    }

    /// 200 response whose body arrives as `chunks`.
    pub fn chunks<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        Self::with_script(Script::Body {
            status: 200,
            chunks: chunks.into_iter().map(|c| Ok(c.as_ref().to_vec())).collect(),
            delay: None,
        })
    }

    /// 200 response carrying `text`, split every `size` bytes.
    pub fn split(text: &str, size: usize) -> Self {
        Self::chunks(text.as_bytes().chunks(size.max(1)).map(<[u8]>::to_vec))
    }

    pub fn status(status: u16) -> Self {
        Self::with_script(Script::NoBody { status })
    }

    pub fn hang() -> Self {
        Self::with_script(Script::Hang)
    }

    pub fn send_error(message: impl Into<String>) -> Self {
        Self::with_script(Script::SendError(message.into()))
    }

    /// 200 response that yields `chunks` and then a read error.
    pub fn broken<I, C>(chunks: I, error: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let mut items: Vec<Result<Vec<u8>, String>> =
            chunks.into_iter().map(|c| Ok(c.as_ref().to_vec())).collect();
        items.push(Err(error.into()));
        Self::with_script(Script::Body {
            status: 200,
            chunks: items,
            delay: None,
        })
    }

    /// Wait `delay` between body chunks.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        if let Script::Body { delay: d, .. } = &mut self.script {
            *d = Some(delay);
        }
        self
    }

    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<ProviderRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ProviderRequest) -> Result<TransportResponse, Error> {
        self.captured_requests.lock().unwrap().push(request.clone());

        match self.script.clone() {
            Script::SendError(message) => Err(Error::network(message)),
            Script::NoBody { status } => Ok(TransportResponse { status, body: None }),
            Script::Hang => Ok(TransportResponse {
                status: 200,
                body: Some(Box::pin(stream::pending()) as ByteStream),
            }),
            Script::Body {
                status,
                chunks,
                delay,
            } => {
                let body = stream::iter(chunks.into_iter().enumerate()).then(move |(i, chunk)| async move {
                    if let Some(delay) = delay.filter(|_| i > 0) {
                        tokio::time::sleep(delay).await;
                    }
                    chunk.map(Bytes::from).map_err(Error::network)
                });
                Ok(TransportResponse {
                    status,
                    body: Some(Box::pin(body)),
                })
            }
        }
    }
}
