use super::{Backend, BoxStream, Message, OpenAiCompatBackend, Tool};
use async_trait::async_trait;

/// Apple Silicon MLX runtime. MLX itself has no stable Rust binding, so this wraps
/// `mlx_lm.server`'s local OpenAI-compatible endpoint (default `http://localhost:8080`) the
/// way the teacher's `auto.py` treats it: a distinct provider identity with the same wire
/// protocol as `OpenAiCompatBackend`.
pub struct MlxBackend {
    inner: OpenAiCompatBackend,
}

impl MlxBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            inner: OpenAiCompatBackend::new(base_url, model, None),
        }
    }
}

#[async_trait]
impl Backend for MlxBackend {
    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    fn list_models(&self) -> Vec<String> {
        self.inner.list_models()
    }

    async fn chat(&mut self, message: &str, tools: &[Tool], temperature: f32, max_tokens: u32) -> Message {
        self.inner.chat(message, tools, temperature, max_tokens).await
    }

    async fn chat_stream(&mut self, message: &str, temperature: f32, max_tokens: u32) -> BoxStream {
        self.inner.chat_stream(message, temperature, max_tokens).await
    }

    fn history_mut(&mut self) -> &mut Vec<Message> {
        self.inner.history_mut()
    }

    fn history(&self) -> &[Message] {
        self.inner.history()
    }

    fn record_stream_result(&mut self, content: String) {
        self.inner.record_stream_result(content);
    }
}
