use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::types::{ChatRequest, ChatResponse, ProviderSpec, StreamChunk};
use crate::error::ProviderError;

/// SSE frames larger than this are treated as a protocol error.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

const COMPLETE_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub type ChunkResult = std::result::Result<(), String>;

/// An LLM endpoint. Multiple implementations share this interface and the
/// scorer treats them uniformly; tests use the dry-run implementation.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn spec(&self) -> &ProviderSpec;

    async fn complete(&self, request: &ChatRequest)
        -> std::result::Result<ChatResponse, ProviderError>;

    /// Streams a chat completion, invoking `handler` per parsed chunk.
    /// Returns the number of chunks delivered. A handler error terminates
    /// the stream; cancellation is observed between chunks.
    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        handler: &mut (dyn for<'r> FnMut(&'r StreamChunk) -> ChunkResult + Send),
    ) -> std::result::Result<usize, ProviderError>;
}

/// OpenAI-compatible chat client. The streaming client carries no request
/// timeout; cancellation comes from the token so long generations are not cut
/// mid-stream.
pub struct OpenAiClient {
    spec: ProviderSpec,
    client: reqwest::Client,
    streaming_client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(spec: ProviderSpec) -> Self {
        let client = reqwest::Client::builder()
            .timeout(COMPLETE_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        let streaming_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            spec,
            client,
            streaming_client,
        }
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.spec.endpoint.trim_end_matches('/')
        )
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.spec.api_key {
            Some(key) if !key.is_empty() => builder.bearer_auth(key),
            _ => builder,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    async fn complete(
        &self,
        request: &ChatRequest,
    ) -> std::result::Result<ChatResponse, ProviderError> {
        let mut request = request.clone();
        request.stream = false;

        let response = self
            .apply_auth(self.client.post(self.chat_url()))
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        handler: &mut (dyn for<'r> FnMut(&'r StreamChunk) -> ChunkResult + Send),
    ) -> std::result::Result<usize, ProviderError> {
        let mut request = request.clone();
        request.stream = true;

        let response = self
            .apply_auth(self.streaming_client.post(self.chat_url()))
            .header("Accept", "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        let byte_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let mut reader = BufReader::with_capacity(64 * 1024, StreamReader::new(byte_stream));

        let mut chunks_received = 0usize;
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(interrupt_error(chunks_received));
                }
                read = reader.read_line(&mut line) => read,
            };

            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    if chunks_received > 0 {
                        return Err(ProviderError::StreamError(format!(
                            "stream connection lost after {} chunks: {}",
                            chunks_received, e
                        )));
                    }
                    return Err(ProviderError::StreamError(e.to_string()));
                }
            };

            if n == 0 {
                // Connection closed without the [DONE] sentinel
                if chunks_received == 0 {
                    return Err(ProviderError::EmptyStream);
                }
                return Ok(chunks_received);
            }

            if line.len() > MAX_FRAME_BYTES {
                return Err(ProviderError::StreamError(format!(
                    "frame exceeds {} bytes",
                    MAX_FRAME_BYTES
                )));
            }

            let trimmed = line.trim_end();
            if trimmed.is_empty() || trimmed.starts_with(':') {
                continue;
            }

            let Some(data) = trimmed.strip_prefix("data: ") else {
                continue;
            };

            if data == "[DONE]" {
                return Ok(chunks_received);
            }

            let chunk: StreamChunk = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    // Malformed frames are skipped; the stream may recover
                    trace!(error = %e, "Skipping unparseable stream frame");
                    continue;
                }
            };

            chunks_received += 1;
            if let Err(msg) = handler(&chunk) {
                return Err(ProviderError::StreamError(format!(
                    "handler error after {} chunks: {}",
                    chunks_received, msg
                )));
            }
        }
    }
}

fn interrupt_error(chunks_received: usize) -> ProviderError {
    if chunks_received > 0 {
        ProviderError::StreamInterrupted { chunks_received }
    } else {
        ProviderError::StreamError("request cancelled".to_string())
    }
}
