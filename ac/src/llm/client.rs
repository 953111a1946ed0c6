//! ModelClient trait definition

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ChatRequest, ChatResponse, ModelError, StreamChunk};

/// Request/response model collaborator
///
/// Each call is independent: the full message list is sent every time.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send a chat request and wait for the aggregated response
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ModelError>;

    /// Streaming variant for progress display
    ///
    /// Sends chunks to the channel as they arrive and returns the same aggregate
    /// as [`ModelClient::chat`]. The default forwards the finished response as
    /// one chunk per field.
    async fn chat_stream(
        &self,
        request: ChatRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<ChatResponse, ModelError> {
        debug!("ModelClient::chat_stream: default implementation");
        let response = self.chat(request).await?;
        if let Some(reasoning) = &response.reasoning {
            let _ = chunk_tx.send(StreamChunk::ReasoningDelta(reasoning.clone())).await;
        }
        if let Some(content) = &response.content {
            let _ = chunk_tx.send(StreamChunk::ContentDelta(content.clone())).await;
        }
        let _ = chunk_tx.send(StreamChunk::Done).await;
        Ok(response)
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    enum Script {
        Sequence(Vec<ChatResponse>),
        Repeat(ChatResponse),
        Fail { status: u16 },
    }

    /// Scripted model client for unit tests
    pub struct MockModelClient {
        script: Script,
        call_count: AtomicUsize,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl MockModelClient {
        /// Return the given responses in order, then error
        pub fn new(responses: Vec<ChatResponse>) -> Self {
            debug!(response_count = %responses.len(), "MockModelClient::new: called");
            Self::with_script(Script::Sequence(responses))
        }

        /// Return the same response forever
        pub fn repeating(response: ChatResponse) -> Self {
            debug!("MockModelClient::repeating: called");
            Self::with_script(Script::Repeat(response))
        }

        /// Fail every call with an API error
        pub fn failing(status: u16) -> Self {
            Self::with_script(Script::Fail { status })
        }

        fn with_script(script: Script) -> Self {
            Self {
                script,
                call_count: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// Requests received so far
        pub fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().map(|r| r.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl ModelClient for MockModelClient {
        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ModelError> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            debug!(%idx, "MockModelClient::chat: called");
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request);
            }
            match &self.script {
                Script::Sequence(responses) => responses
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| ModelError::InvalidResponse("No more mock responses".to_string())),
                Script::Repeat(response) => Ok(response.clone()),
                Script::Fail { status } if *status == 429 => Err(ModelError::RateLimited {
                    retry_after: Duration::from_millis(1),
                }),
                Script::Fail { status } => Err(ModelError::Api {
                    status: *status,
                    message: "mock failure".to_string(),
                }),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn request() -> ChatRequest {
            ChatRequest {
                messages: vec![],
                tools: vec![],
            }
        }

        #[tokio::test]
        async fn test_mock_client_returns_responses() {
            let client = MockModelClient::new(vec![ChatResponse::text("one"), ChatResponse::text("two")]);

            assert_eq!(client.chat(request()).await.unwrap().content.as_deref(), Some("one"));
            assert_eq!(client.chat(request()).await.unwrap().content.as_deref(), Some("two"));
            assert!(client.chat(request()).await.is_err());
            assert_eq!(client.call_count(), 3);
            assert_eq!(client.requests().len(), 3);
        }

        #[tokio::test]
        async fn test_default_stream_forwards_chunks() {
            let client = MockModelClient::repeating(ChatResponse::text("hello"));
            let (tx, mut rx) = mpsc::channel(8);

            let response = client.chat_stream(request(), tx).await.unwrap();
            assert_eq!(response.content.as_deref(), Some("hello"));
            assert_eq!(rx.recv().await, Some(StreamChunk::ContentDelta("hello".to_string())));
            assert_eq!(rx.recv().await, Some(StreamChunk::Done));
        }
    }
}
