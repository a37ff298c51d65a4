use super::{Backend, BoxStream, Message, Tool};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Grounded on the teacher's `openai.rs` OpenAI-compatible client (LM Studio, vLLM, etc.).
pub struct OpenAiCompatBackend {
    http: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    history: Vec<Message>,
}

impl OpenAiCompatBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            history: Vec::new(),
        }
    }

    fn request_builder(&self, body: &OaiRequest) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut rb = self.http.post(url).json(body);
        if let Some(key) = &self.api_key {
            rb = rb.header("Authorization", format!("Bearer {key}"));
        }
        rb
    }
}

#[async_trait]
impl Backend for OpenAiCompatBackend {
    async fn is_available(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        matches!(self.http.get(url).send().await, Ok(resp) if resp.status().is_success())
    }

    fn list_models(&self) -> Vec<String> {
        vec![self.model.clone()]
    }

    async fn chat(&mut self, message: &str, tools: &[Tool], temperature: f32, max_tokens: u32) -> Message {
        if !message.is_empty() {
            self.history.push(Message::user(message));
        }
        let req = OaiRequest {
            model: self.model.clone(),
            messages: self.history.iter().map(OaiMessage::from_message).collect(),
            stream: false,
            temperature,
            max_tokens,
            tools: (!tools.is_empty()).then(|| tools.iter().map(Tool::to_json).collect()),
        };
        match self.request_builder(&req).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<OaiChatResponse>().await {
                Ok(payload) => {
                    let msg = payload
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.into_message())
                        .unwrap_or_else(|| Message::assistant(Some(String::new()), vec![]));
                    self.history.push(msg.clone());
                    msg
                }
                Err(e) => {
                    let msg = Message::assistant(Some(format!("Error: {e}")), vec![]);
                    self.history.push(msg.clone());
                    msg
                }
            },
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                let msg = Message::assistant(Some(format!("Error: openai error ({status}): {text}")), vec![]);
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

    async fn chat_stream(&mut self, message: &str, temperature: f32, max_tokens: u32) -> BoxStream {
        if !message.is_empty() {
            self.history.push(Message::user(message));
        }
        let req = OaiRequest {
            model: self.model.clone(),
            messages: self.history.iter().map(OaiMessage::from_message).collect(),
            stream: true,
            temperature,
            max_tokens,
            tools: None,
        };

        let resp = match self.request_builder(&req).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                let status = r.status();
                let text = r.text().await.unwrap_or_default();
                return Box::pin(futures_util::stream::iter(vec![format!(
                    "Error: openai error ({status}): {text}"
                )]));
            }
            Err(e) => return Box::pin(futures_util::stream::iter(vec![format!("Error: {e}")])),
        };

        let byte_stream = resp.bytes_stream().map(|item| item.map_err(std::io::Error::other));
        let reader = tokio_util::io::StreamReader::new(byte_stream);
        let lines = tokio_util::codec::FramedRead::new(reader, tokio_util::codec::LinesCodec::new());

        let token_stream = lines.filter_map(|line_result| async move {
            let line = line_result.ok()?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            let data = trimmed.strip_prefix("data: ")?.trim();
            if data == "[DONE]" {
                return None;
            }
            let chunk: OaiStreamChunk = serde_json::from_str(data).ok()?;
            let content = chunk.choices.into_iter().next().and_then(|c| c.delta.content)?;
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
struct OaiRequest {
    model: String,
    messages: Vec<OaiMessage>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OaiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OaiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OaiToolCall {
    id: String,
    function: OaiToolCallFn,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OaiToolCallFn {
    name: String,
    arguments: String,
}

impl OaiMessage {
    fn from_message(msg: &Message) -> Self {
        Self {
            role: msg.role.clone(),
            content: msg.content.clone(),
            tool_calls: None,
            tool_call_id: msg.tool_call_id.clone(),
        }
    }

    fn into_message(self) -> Message {
        let tool_calls = self
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| super::ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments).unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        Message::assistant(self.content, tool_calls)
    }
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    choices: Vec<OaiChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiMessage,
}

#[derive(Debug, Deserialize)]
struct OaiStreamChunk {
    choices: Vec<OaiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiStreamChoice {
    delta: OaiStreamDelta,
}

#[derive(Debug, Deserialize)]
struct OaiStreamDelta {
    content: Option<String>,
}
