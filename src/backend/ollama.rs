use super::{Backend, BoxStream, Message, Tool};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Grounded on the teacher's `ollama.rs` HTTP client and streaming pattern.
pub struct OllamaBackend {
    http: Client,
    base_url: String,
    model: String,
    history: Vec<Message>,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            history: Vec::new(),
        }
    }

    async fn chat_json(&self, messages: &[Message], tools: &[Tool]) -> anyhow::Result<OllamaMessage> {
        let url = format!("{}/api/chat", self.base_url);
        let req = OllamaChatRequest {
            model: self.model.clone(),
            messages: messages.iter().map(OllamaMessage::from_message).collect(),
            stream: false,
            tools: (!tools.is_empty()).then(|| tools.iter().map(Tool::to_json).collect()),
        };
        let resp = self.http.post(url).json(&req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("ollama error ({}): {}", status, text);
        }
        let payload: OllamaChatResponse = resp.json().await?;
        Ok(payload.message)
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        matches!(self.http.get(url).send().await, Ok(resp) if resp.status().is_success())
    }

    fn list_models(&self) -> Vec<String> {
        vec![self.model.clone()]
    }

    async fn chat(&mut self, message: &str, tools: &[Tool], _temperature: f32, _max_tokens: u32) -> Message {
        if !message.is_empty() {
            self.history.push(Message::user(message));
        }
        match self.chat_json(&self.history.clone(), tools).await {
            Ok(reply) => {
                let msg = reply.into_message();
                self.history.push(msg.clone());
                msg
            }
            Err(e) => {
                let msg = Message::assistant(Some(format!("Error: {e}")), vec![]);
                self.history.push(msg.clone());
                msg
            }
        }
    }

    async fn chat_stream(&mut self, message: &str, _temperature: f32, _max_tokens: u32) -> BoxStream {
        if !message.is_empty() {
            self.history.push(Message::user(message));
        }
        let url = format!("{}/api/chat", self.base_url);
        let req = OllamaChatRequest {
            model: self.model.clone(),
            messages: self.history.iter().map(OllamaMessage::from_message).collect(),
            stream: true,
            tools: None,
        };

        let resp = match self.http.post(url).json(&req).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                let status = r.status();
                let text = r.text().await.unwrap_or_default();
                return Box::pin(futures_util::stream::iter(vec![format!(
                    "Error: ollama error ({status}): {text}"
                )]));
            }
            Err(e) => {
                return Box::pin(futures_util::stream::iter(vec![format!("Error: {e}")]));
            }
        };

        let byte_stream = resp
            .bytes_stream()
            .map(|item| item.map_err(std::io::Error::other));
        let reader = tokio_util::io::StreamReader::new(byte_stream);
        let lines = tokio_util::codec::FramedRead::new(reader, tokio_util::codec::LinesCodec::new());

        let token_stream = lines.filter_map(move |line_result| async move {
            let line = line_result.ok()?;
            if line.trim().is_empty() {
                return None;
            }
            let chunk: OllamaChatResponse = serde_json::from_str(&line).ok()?;
            let content = chunk.message.content.unwrap_or_default();
            if content.is_empty() {
                None
            } else {
                Some(content)
            }
        });

        Box::pin(token_stream)
    }

    fn history_mut(&mut self) -> &mut Vec<Message> {
        &mut self.history
    }

    fn history(&self) -> &[Message] {
        &self.history
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaToolCall {
    function: OllamaToolCallFn,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaToolCallFn {
    name: String,
    arguments: std::collections::HashMap<String, serde_json::Value>,
}

impl OllamaMessage {
    fn from_message(msg: &Message) -> Self {
        Self {
            role: msg.role.clone(),
            content: msg.content.clone().unwrap_or_default(),
            tool_calls: None,
        }
    }

    fn into_message(self) -> Message {
        let tool_calls = self
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, tc)| super::ToolCall {
                id: format!("call_{i}"),
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect::<Vec<_>>();
        let content = if self.content.is_empty() { None } else { Some(self.content) };
        Message::assistant(content, tool_calls)
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}
