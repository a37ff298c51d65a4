//! The agent loop (§4.2): wires a `Backend`, a `ChatHistory`, a skill/tool registry, and a
//! `Memory` port together behind tool-relevance filtering. Grounded on `core/agent.py`.

use crate::backend::{Backend, Message, Tool};
use std::collections::HashSet;

/// Verbatim 26-entry keyword table from `core/agent.py::SKILL_KEYWORDS`, used to shortlist
/// which registered tools are relevant to a given user query.
const SKILL_KEYWORDS: &[(&str, &[&str])] = &[
    ("datetime", &["time", "date", "today", "now", "calendar", "schedule", "when", "hour", "minute"]),
    ("math", &["calculate", "math", "sum", "multiply", "divide", "equation", "number", "factorial", "sqrt", "2+2", "2 + 2"]),
    ("text", &["text", "string", "word", "count", "uppercase", "lowercase", "slug", "reverse", "trim"]),
    ("json", &["json", "parse json", "format json", "validate json"]),
    ("yaml", &["yaml", "yml", "config file"]),
    ("csv", &["csv", "spreadsheet", "comma separated"]),
    ("crypto", &["hash", "md5", "sha256", "sha", "encrypt", "decrypt", "base64", "encode", "decode", "hmac"]),
    ("pdf", &["pdf", "document", "report"]),
    ("code", &["code", "program", "script", "function", "class", "python", "javascript", "generate code"]),
    ("sql", &["sql", "query", "database", "select from", "insert into"]),
    ("git", &["git", "commit", "branch", "merge", "repository", "repo", "diff", "status"]),
    ("http", &["http", "api", "request", "fetch", "endpoint", "rest"]),
    ("fs", &["file", "folder", "directory", "read file", "write file", "list files", "delete file", "copy file"]),
    ("archive", &["zip", "tar", "compress", "extract", "archive", "unzip"]),
    ("regex", &["regex", "pattern", "regular expression", "match pattern"]),
    ("translate", &["translate", "translation", "spanish", "english", "french", "german", "idioma"]),
    ("image", &["image", "picture", "photo", "resize image", "crop", "png", "jpg", "jpeg"]),
    ("video", &["video", "movie", "clip", "ffmpeg", "mp4"]),
    ("audio", &["audio", "sound", "music", "mp3", "wav", "recording"]),
    ("weather", &["weather", "temperature", "forecast", "rain", "sunny", "clima"]),
    ("email", &["email", "mail", "send email", "smtp"]),
    ("docker", &["docker", "container", "compose", "dockerfile"]),
    ("ssh", &["ssh", "remote server", "connect to server"]),
    ("qr", &["qr", "qrcode", "qr code"]),
    ("barcode", &["barcode", "ean", "upc"]),
    ("ocr", &["ocr", "text from image", "extract text", "recognize text"]),
    ("voice", &["voice", "speech", "tts", "speak", "transcribe", "whisper", "audio to text"]),
];

/// Fallback skill set unioned in when fewer than 3 tools match by keyword (spec's literal
/// "union up to the cap" wording, not the original's append-without-dedup behavior).
const CORE_SKILLS: &[&str] = &["datetime", "math", "text", "fs", "json"];
const RELEVANCE_FLOOR: usize = 3;

fn matched_skills(user_input: &str) -> HashSet<&'static str> {
    let lower = user_input.to_lowercase();
    let mut matched: HashSet<&'static str> = HashSet::new();
    matched.insert("datetime");
    for (skill, keywords) in SKILL_KEYWORDS {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            matched.insert(skill);
        }
    }
    matched
}

/// A registered tool's skill grouping, needed to map keyword matches onto concrete tools.
/// `skill_of(tool_name)` mirrors the teacher's `skill_tools` reverse index.
pub fn get_relevant_tools<'a>(
    user_input: &str,
    tools: &'a [Tool],
    skill_of: impl Fn(&str) -> Option<&'static str>,
    max_tools: usize,
) -> Vec<&'a Tool> {
    let matched = matched_skills(user_input);
    let mut relevant: Vec<&Tool> = tools
        .iter()
        .filter(|t| skill_of(&t.name).is_some_and(|skill| matched.contains(skill)))
        .collect();

    if relevant.len() < RELEVANCE_FLOOR {
        let mut seen: HashSet<&str> = relevant.iter().map(|t| t.name.as_str()).collect();
        for tool in tools {
            if let Some(skill) = skill_of(&tool.name) {
                if CORE_SKILLS.contains(&skill) && seen.insert(tool.name.as_str()) {
                    relevant.push(tool);
                }
            }
            if relevant.len() >= max_tools {
                break;
            }
        }
    }

    relevant.truncate(max_tools);
    relevant
}

/// Memory port (§3.2, §4.2): context augmentation and session persistence, opaque to the
/// agent's own logic. A non-goal boundary per spec.md §1 — no concrete backend ships beyond
/// the no-op `NullMemory`.
#[async_trait::async_trait]
pub trait Memory: Send + Sync {
    async fn add(&self, entry_type: &str, text: &str) -> anyhow::Result<()>;
    async fn get_relevant_context(&self, query: &str) -> anyhow::Result<Option<String>>;
    async fn save_session(&self) -> anyhow::Result<()>;
}

/// No-op `Memory`, the default when no real backend is injected (§3.2).
#[derive(Default)]
pub struct NullMemory;

#[async_trait::async_trait]
impl Memory for NullMemory {
    async fn add(&self, _entry_type: &str, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_relevant_context(&self, _query: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn save_session(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ties a `Backend`, a fixed tool registry, a relevance filter, and a `Memory` port together
/// (§4.2 Agent). Owns its `Backend` exclusively, per §3's ownership rules.
pub struct Agent<B: Backend> {
    backend: B,
    tools: Vec<Tool>,
    skill_of: std::sync::Arc<dyn Fn(&str) -> Option<&'static str> + Send + Sync>,
    memory: Box<dyn Memory>,
    max_tools: usize,
}

impl<B: Backend> Agent<B> {
    pub fn new(backend: B, tools: Vec<Tool>, skill_of: impl Fn(&str) -> Option<&'static str> + Send + Sync + 'static) -> Self {
        Self::with_memory(backend, tools, skill_of, Box::new(NullMemory))
    }

    pub fn with_memory(
        backend: B,
        tools: Vec<Tool>,
        skill_of: impl Fn(&str) -> Option<&'static str> + Send + Sync + 'static,
        memory: Box<dyn Memory>,
    ) -> Self {
        Self {
            backend,
            tools,
            skill_of: std::sync::Arc::new(skill_of),
            memory,
            max_tools: 30,
        }
    }

    pub fn set_system_prompt(&mut self, prompt: &str) {
        self.backend.set_system_prompt(prompt);
    }

    pub fn history(&self) -> &[Message] {
        self.backend.history()
    }

    /// Mirrors `Agent.run`: records the turn in memory, augments the prompt with any relevant
    /// context memory returns, narrows the tool set by keyword relevance when `smart_tools` is
    /// set, runs the tool-call loop, then persists the session.
    pub async fn run(&mut self, user_input: &str, smart_tools: bool, max_iterations: u32) -> String {
        let _ = self.memory.add("user_message", user_input).await;

        let augmented = match self.memory.get_relevant_context(user_input).await {
            Ok(Some(context)) if !context.is_empty() => format!("{context}\n\n{user_input}"),
            _ => user_input.to_string(),
        };

        let tools = if smart_tools {
            get_relevant_tools(user_input, &self.tools, |name| (self.skill_of)(name), self.max_tools)
                .into_iter()
                .cloned()
                .collect::<Vec<_>>()
        } else {
            self.tools.clone()
        };
        let result = self.backend.chat_with_tools(&augmented, &tools, max_iterations).await;

        let _ = self.memory.add("assistant_message", &result).await;
        let _ = self.memory.save_session().await;
        result
    }

    pub async fn run_stream(&mut self, user_input: &str, temperature: f32, max_tokens: u32) -> crate::backend::BoxStream {
        let _ = self.memory.add("user_message", user_input).await;
        let augmented = match self.memory.get_relevant_context(user_input).await {
            Ok(Some(context)) if !context.is_empty() => format!("{context}\n\n{user_input}"),
            _ => user_input.to_string(),
        };
        self.backend.chat_stream(&augmented, temperature, max_tokens).await
    }

    /// Called once by the stream consumer after draining `run_stream`'s `BoxStream` to record
    /// the accumulated reply in both the backend's own history and memory, then persist.
    pub async fn record_stream_result(&mut self, content: String) {
        self.backend.record_stream_result(content.clone());
        let _ = self.memory.add("assistant_message", &content).await;
        let _ = self.memory.save_session().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ToolHandler;

    fn tool(name: &str) -> Tool {
        let handler: ToolHandler = std::sync::Arc::new(|_| Ok(String::new()));
        Tool {
            name: name.to_string(),
            description: String::new(),
            parameters: serde_json::json!({}),
            handler,
        }
    }

    fn skill_of(name: &str) -> Option<&'static str> {
        match name {
            "now" => Some("datetime"),
            "add" => Some("math"),
            "read_file" => Some("fs"),
            "to_json" => Some("json"),
            "uppercase" => Some("text"),
            "git_status" => Some("git"),
            _ => None,
        }
    }

    #[test]
    fn matches_tools_by_keyword() {
        let tools = vec![tool("now"), tool("add"), tool("git_status")];
        let relevant = get_relevant_tools("what time is it", &tools, skill_of, 30);
        // Below the floor of 3, so core skills are unioned in alongside the keyword match.
        let names: Vec<&str> = relevant.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"now"));
    }

    #[test]
    fn falls_back_to_core_skills_when_too_few_match() {
        let tools = vec![tool("now"), tool("add"), tool("read_file"), tool("to_json"), tool("git_status")];
        let relevant = get_relevant_tools("tell me a joke", &tools, skill_of, 30);
        assert!(relevant.len() >= RELEVANCE_FLOOR);
        let names: Vec<&str> = relevant.iter().map(|t| t.name.as_str()).collect();
        assert!(!names.contains(&"git_status"));
    }

    #[test]
    fn respects_max_tools_cap() {
        let tools: Vec<Tool> = (0..10).map(|i| tool(&format!("add{i}"))).collect();
        let skill_of_math = |name: &str| if name.starts_with("add") { Some("math") } else { None };
        let relevant = get_relevant_tools("calculate something", &tools, skill_of_math, 4);
        assert_eq!(relevant.len(), 4);
    }
}
