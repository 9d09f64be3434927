//! Mock LLM client for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, LlmUsage};

const MOCK_MODEL: &str = "mock-llm";

#[derive(Debug)]
enum Reply {
    Text(String),
    Error(LlmError),
}

/// Mock implementation of [`LlmClient`].
///
/// Replies are queued with [`push_response`](Self::push_response) and
/// [`push_error`](Self::push_error) and handed out in order. An empty queue
/// answers with an empty JSON object.
#[derive(Debug, Clone, Default)]
pub struct MockLlmClient {
    replies: Arc<RwLock<VecDeque<Reply>>>,
    requests: Arc<RwLock<Vec<CompletionRequest>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, text: &str) {
        self.replies
            .write()
            .unwrap()
            .push_back(Reply::Text(text.to_string()));
    }

    pub fn push_error(&self, error: LlmError) {
        self.replies.write().unwrap().push_back(Reply::Error(error));
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.read().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn provider(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        MOCK_MODEL
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let input_tokens = (request.prompt.len() / 4) as u32;
        self.requests.write().unwrap().push(request);

        let reply = self.replies.write().unwrap().pop_front();
        let text = match reply {
            Some(Reply::Text(text)) => text,
            Some(Reply::Error(e)) => return Err(e),
            None => "{}".to_string(),
        };

        Ok(CompletionResponse {
            usage: LlmUsage {
                input_tokens,
                output_tokens: (text.len() / 4) as u32,
            },
            text,
            model: MOCK_MODEL.to_string(),
        })
    }
}
