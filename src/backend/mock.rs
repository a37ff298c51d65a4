use super::{Backend, BoxStream, Message, Tool};
use async_trait::async_trait;
use std::collections::VecDeque;

/// Deterministic in-memory backend for tests: returns canned messages fed from a queue.
pub struct MockBackend {
    history: Vec<Message>,
    responses: VecDeque<Message>,
}

impl MockBackend {
    pub fn new(responses: VecDeque<Message>) -> Self {
        Self {
            history: Vec::new(),
            responses,
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn is_available(&self) -> bool {
        true
    }

    fn list_models(&self) -> Vec<String> {
        vec!["mock-model".into()]
    }

    async fn chat(&mut self, message: &str, _tools: &[Tool], _temperature: f32, _max_tokens: u32) -> Message {
        if !message.is_empty() {
            self.history.push(Message::user(message));
        }
        let response = self
            .responses
            .pop_front()
            .unwrap_or_else(|| Message::assistant(Some(String::new()), vec![]));
        self.history.push(response.clone());
        response
    }

    async fn chat_stream(&mut self, message: &str, temperature: f32, max_tokens: u32) -> BoxStream {
        let response = self.chat(message, &[], temperature, max_tokens).await;
        let text = response.content.unwrap_or_default();
        Box::pin(futures_util::stream::iter(vec![text]))
    }

    fn history_mut(&mut self) -> &mut Vec<Message> {
        &mut self.history
    }

    fn history(&self) -> &[Message] {
        &self.history
    }
}
