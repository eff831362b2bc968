use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::client::{ChatProvider, ChunkResult};
use super::types::{
    ChatChoice, ChatMessage, ChatRequest, ChatResponse, ProviderSpec, StreamChoice, StreamChunk,
    StreamDelta, Usage,
};
use crate::error::ProviderError;

enum Scripted {
    Response(String),
    Error(ProviderError),
}

/// Provider that replays scripted responses instead of calling a network
/// endpoint. Streamed responses are delivered word by word so subscriber
/// plumbing sees multiple chunks.
pub struct DryRunProvider {
    spec: ProviderSpec,
    script: Mutex<VecDeque<Scripted>>,
}

impl DryRunProvider {
    pub fn new(id: impl Into<String>, params_b: f64) -> Self {
        let id = id.into();
        Self {
            spec: ProviderSpec {
                endpoint: format!("dry-run://{}", id),
                api_key: None,
                model: format!("{}-model", id),
                id,
                params_b,
                cost_per_mtoken: 0.0,
            },
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_response(&self, content: impl Into<String>) {
        self.script
            .lock()
            .push_back(Scripted::Response(content.into()));
    }

    pub fn push_error(&self, error: ProviderError) {
        self.script.lock().push_back(Scripted::Error(error));
    }

    fn next_content(&self) -> std::result::Result<String, ProviderError> {
        match self.script.lock().pop_front() {
            Some(Scripted::Response(content)) => Ok(content),
            Some(Scripted::Error(e)) => Err(e),
            None => Ok(String::new()),
        }
    }
}

#[async_trait]
impl ChatProvider for DryRunProvider {
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    async fn complete(
        &self,
        _request: &ChatRequest,
    ) -> std::result::Result<ChatResponse, ProviderError> {
        let content = self.next_content()?;
        let total_tokens = (content.len() / 4) as u64;
        Ok(ChatResponse {
            id: format!("dry-{}", uuid::Uuid::new_v4()),
            model: self.spec.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage {
                prompt_tokens: 0,
                completion_tokens: total_tokens,
                total_tokens,
            },
        })
    }

    async fn stream(
        &self,
        _request: &ChatRequest,
        cancel: &CancellationToken,
        handler: &mut (dyn for<'r> FnMut(&'r StreamChunk) -> ChunkResult + Send),
    ) -> std::result::Result<usize, ProviderError> {
        let content = self.next_content()?;
        let words: Vec<&str> = content.split_inclusive(' ').collect();
        let mut chunks_received = 0usize;

        for word in words {
            if cancel.is_cancelled() {
                return Err(ProviderError::StreamInterrupted { chunks_received });
            }
            let chunk = StreamChunk {
                id: "dry-chunk".to_string(),
                object: "chat.completion.chunk".to_string(),
                created: 0,
                model: self.spec.model.clone(),
                choices: vec![StreamChoice {
                    index: 0,
                    delta: StreamDelta {
                        role: None,
                        content: Some(word.to_string()),
                    },
                    finish_reason: None,
                }],
            };
            chunks_received += 1;
            if let Err(msg) = handler(&chunk) {
                return Err(ProviderError::StreamError(format!(
                    "handler error after {} chunks: {}",
                    chunks_received, msg
                )));
            }
        }

        Ok(chunks_received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let provider = DryRunProvider::new("dry", 70.0);
        provider.push_response("first");
        provider.push_response("second");

        let req = ChatRequest::new("m", vec![]);
        assert_eq!(provider.complete(&req).await.unwrap().content(), Some("first"));
        assert_eq!(provider.complete(&req).await.unwrap().content(), Some("second"));
    }

    #[tokio::test]
    async fn test_scripted_error_surfaces() {
        let provider = DryRunProvider::new("dry", 70.0);
        provider.push_error(ProviderError::RateLimited {
            retry_after_secs: Some(5),
        });

        let req = ChatRequest::new("m", vec![]);
        let err = provider.complete(&req).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_stream_delivers_word_chunks() {
        let provider = DryRunProvider::new("dry", 70.0);
        provider.push_response("alpha beta gamma");

        let req = ChatRequest::new("m", vec![]);
        let cancel = CancellationToken::new();
        let mut collected = String::new();
        let mut handler = |chunk: &StreamChunk| -> ChunkResult {
            collected.push_str(chunk.content().unwrap_or_default());
            Ok(())
        };

        let chunks = provider.stream(&req, &cancel, &mut handler).await.unwrap();
        assert_eq!(chunks, 3);
        assert_eq!(collected, "alpha beta gamma");
    }
}
