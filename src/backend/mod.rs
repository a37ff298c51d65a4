//! Backend Port (§4.1): a uniform chat/tool/stream API over heterogeneous LLM providers.

mod auto;
mod mlx;
mod mock;
mod ollama;
mod openai;

pub use auto::{auto_detect, get_backend};
pub use mlx::MlxBackend;
pub use mock::MockBackend;
pub use ollama::OllamaBackend;
pub use openai::OpenAiCompatBackend;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

/// A turn in a conversation (§3 Message).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".into(),
            content,
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }
}

/// A structured request from the model to invoke a named tool (§3 ToolCall).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: HashMap<String, serde_json::Value>,
}

/// Registered capability (§3 Tool). The handler is an opaque, shared, thread-safe function
/// value — no subclass reflection, per §9's redesign flag.
pub type ToolHandler = std::sync::Arc<
    dyn Fn(HashMap<String, serde_json::Value>) -> anyhow::Result<String> + Send + Sync,
>;

#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub handler: ToolHandler,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

impl Tool {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

pub type BoxStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Uniform polymorphic abstraction over {OpenAICompat, Ollama, MLX, Mock}.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn is_available(&self) -> bool;
    fn list_models(&self) -> Vec<String>;

    /// Appends `message` to history if non-empty, sends the full history plus tool
    /// definitions, and parses the response. On network/decode failure returns an assistant
    /// message whose content begins with "Error:" rather than propagating.
    async fn chat(
        &mut self,
        message: &str,
        tools: &[Tool],
        temperature: f32,
        max_tokens: u32,
    ) -> Message;

    /// Yields partial text chunks until the model signals completion; concatenation equals
    /// the content `chat` would have produced. Appends the full assistant message to history
    /// exactly once, after completion.
    async fn chat_stream(
        &mut self,
        message: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> BoxStream;

    /// For each call, in order: look up by name, invoke, capture errors as the result string,
    /// append a tool-role message to history.
    async fn execute_tools(&mut self, tool_calls: &[ToolCall], tools: &[Tool]) -> Vec<Message> {
        let tool_map: HashMap<&str, &Tool> = tools.iter().map(|t| (t.name.as_str(), t)).collect();
        let mut results = Vec::with_capacity(tool_calls.len());
        for call in tool_calls {
            let content = match tool_map.get(call.name.as_str()) {
                Some(tool) => match (tool.handler)(call.arguments.clone()) {
                    Ok(result) => result,
                    Err(e) => format!("Error executing {}: {}", call.name, e),
                },
                None => format!("Tool not found: {}", call.name),
            };
            let msg = Message::tool(content, call.id.clone(), call.name.clone());
            self.history_mut().push(msg.clone());
            results.push(msg);
        }
        results
    }

    /// The iterative tool-call loop that is the core of the agent (§4.1).
    async fn chat_with_tools(&mut self, message: &str, tools: &[Tool], max_iterations: u32) -> String {
        let mut iteration = 0u32;
        let mut pending = message.to_string();
        loop {
            iteration += 1;
            if iteration > max_iterations {
                return "iteration limit reached".to_string();
            }
            let input = if iteration == 1 { pending.as_str() } else { "" };
            let response = self.chat(input, tools, 0.7, 4096).await;
            if !response.tool_calls.is_empty() {
                let calls = response.tool_calls.clone();
                self.execute_tools(&calls, tools).await;
                pending.clear();
            } else {
                return response.content.unwrap_or_default();
            }
        }
    }

    /// Exposed so the default `execute_tools`/`chat_with_tools` impls can mutate shared
    /// conversation history without every implementor re-deriving the loop.
    fn history_mut(&mut self) -> &mut Vec<Message>;
    fn history(&self) -> &[Message];

    fn set_system_prompt(&mut self, prompt: &str) {
        let history = self.history_mut();
        history.retain(|m| m.role != "system");
        history.insert(0, Message::system(prompt));
    }

    fn clear_history(&mut self) {
        let history = self.history_mut();
        history.retain(|m| m.role == "system");
    }

    /// Called by the stream consumer once it has drained `chat_stream` to completion, so the
    /// full assistant message lands in history exactly once (§4.1). `chat_stream` itself
    /// returns an owned, unborrowed stream, so the append happens here rather than inside the
    /// stream's drop glue.
    fn record_stream_result(&mut self, content: String) {
        self.history_mut().push(Message::assistant(Some(content), vec![]));
    }
}

/// Lets a boxed trait object stand in for a concrete backend (e.g. the provider the server
/// resolved at request time via `auto_detect`/`get_backend`), so `Agent<Box<dyn Backend>>`
/// works the same as `Agent<OllamaBackend>`.
#[async_trait]
impl Backend for Box<dyn Backend> {
    async fn is_available(&self) -> bool {
        (**self).is_available().await
    }

    fn list_models(&self) -> Vec<String> {
        (**self).list_models()
    }

    async fn chat(&mut self, message: &str, tools: &[Tool], temperature: f32, max_tokens: u32) -> Message {
        (**self).chat(message, tools, temperature, max_tokens).await
    }

    async fn chat_stream(&mut self, message: &str, temperature: f32, max_tokens: u32) -> BoxStream {
        (**self).chat_stream(message, temperature, max_tokens).await
    }

    fn history_mut(&mut self) -> &mut Vec<Message> {
        (**self).history_mut()
    }

    fn history(&self) -> &[Message] {
        (**self).history()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[tokio::test]
    async fn chat_with_tools_terminates_on_final_content() {
        // S3: model emits two tool_calls, then a plain content response.
        let mut backend = MockBackend::new(VecDeque::from(vec![
            Message::assistant(
                None,
                vec![
                    ToolCall {
                        id: "t1".into(),
                        name: "add".into(),
                        arguments: HashMap::new(),
                    },
                    ToolCall {
                        id: "t2".into(),
                        name: "neg".into(),
                        arguments: HashMap::new(),
                    },
                ],
            ),
            Message::assistant(Some("5 and -5".into()), vec![]),
        ]));

        let add_handler: ToolHandler = std::sync::Arc::new(|_| Ok("5".to_string()));
        let neg_handler: ToolHandler = std::sync::Arc::new(|_| Ok("-5".to_string()));
        let tools = vec![
            Tool {
                name: "add".into(),
                description: "add".into(),
                parameters: serde_json::json!({}),
                handler: add_handler,
            },
            Tool {
                name: "neg".into(),
                description: "neg".into(),
                parameters: serde_json::json!({}),
                handler: neg_handler,
            },
        ];

        let result = backend.chat_with_tools("hi", &tools, 10).await;
        assert_eq!(result, "5 and -5");

        let tool_msgs: Vec<&Message> = backend.history().iter().filter(|m| m.role == "tool").collect();
        assert_eq!(tool_msgs.len(), 2);
        assert_eq!(tool_msgs[0].tool_call_id.as_deref(), Some("t1"));
        assert_eq!(tool_msgs[1].tool_call_id.as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn chat_with_tools_respects_iteration_limit() {
        let responses: VecDeque<Message> = (0..20)
            .map(|i| {
                Message::assistant(
                    None,
                    vec![ToolCall {
                        id: format!("t{i}"),
                        name: "noop".into(),
                        arguments: HashMap::new(),
                    }],
                )
            })
            .collect();
        let mut backend = MockBackend::new(responses);
        let handler: ToolHandler = std::sync::Arc::new(|_| Ok("ok".to_string()));
        let tools = vec![Tool {
            name: "noop".into(),
            description: "noop".into(),
            parameters: serde_json::json!({}),
            handler,
        }];
        let result = backend.chat_with_tools("hi", &tools, 3).await;
        assert_eq!(result, "iteration limit reached");
    }
}
