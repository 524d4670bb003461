pub mod anthropic;
pub mod client;
pub mod minimax;
pub mod normalize;
pub mod ollama;
pub mod openai;
pub mod prompt;
pub mod registry;
pub mod stream;

use crate::config::ProviderSettings;
use crate::error::ProviderError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use stream::{PendingStream, StreamCallback, StreamChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            name: None,
            tool_call_id: None,
            tool_calls: vec![],
            session_id: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: &str) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: &str, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    pub fn tool_result(tool_call_id: &str, name: &str, content: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            tool_call_id: Some(tool_call_id.to_string()),
            ..Self::with_role(Role::Tool, content)
        }
    }
}

/// Gives every tool message a `tool_call_id`, using `tool_<index>` for any that
/// lack one. Vendors reject tool results without a correlation id.
pub fn validate_tool_messages(messages: &mut [Message]) {
    for (i, msg) in messages.iter_mut().enumerate() {
        if msg.role != Role::Tool {
            continue;
        }
        let missing = msg
            .tool_call_id
            .as_deref()
            .map_or(true, |id| id.trim().is_empty());
        if missing {
            msg.tool_call_id = Some(format!("tool_{}", i));
        }
    }
}

/// Tool-call arguments as a model emitted them: either a raw (possibly
/// malformed) JSON string or an already structured record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolArguments {
    Structured(Map<String, Value>),
    Raw(String),
}

impl ToolArguments {
    pub fn empty() -> Self {
        ToolArguments::Structured(Map::new())
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => ToolArguments::Structured(map),
            Value::String(s) => ToolArguments::Raw(s),
            Value::Null => ToolArguments::empty(),
            other => ToolArguments::Raw(other.to_string()),
        }
    }

    /// Wire form used by vendors that carry arguments as a JSON string.
    pub fn to_json_string(&self) -> String {
        match self {
            ToolArguments::Raw(s) => s.clone(),
            ToolArguments::Structured(map) => Value::Object(map.clone()).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<ToolArguments>,
}

fn default_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCall>,
}

impl ToolCall {
    pub fn new(id: &str, name: &str, arguments: ToolArguments) -> Self {
        Self {
            id: Some(id.to_string()),
            call_type: default_call_type(),
            function: Some(FunctionCall {
                name: name.to_string(),
                arguments: Some(arguments),
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.function.as_ref().map_or("", |f| f.name.as_str())
    }

    pub fn arguments(&self) -> Option<&ToolArguments> {
        self.function.as_ref().and_then(|f| f.arguments.as_ref())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Provider-independent tool schema: `{type: "function", function: {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    None,
    Auto,
    Any,
    Function(String),
}

impl ToolChoice {
    /// Accepts `none`, `auto`, `any`, `function:<name>` or a bare tool name.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "auto" => ToolChoice::Auto,
            "none" => ToolChoice::None,
            "any" | "required" => ToolChoice::Any,
            _ => {
                let name = trimmed.strip_prefix("function:").unwrap_or(trimmed);
                ToolChoice::Function(name.trim().to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatCompletionOptions {
    pub model: Option<String>,
    /// Resolved provider name, filled in by model selection.
    pub provider: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub system_prompt: Option<String>,
    pub preserve_system_prompt: bool,
    pub bypass_formatter: bool,
    pub expects_json_response: bool,
    pub stream: Option<bool>,
    pub stream_callback: Option<StreamCallback>,
    pub enable_tools: Option<bool>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub max_tool_iterations: Option<usize>,
    pub current_tool_iteration: Option<usize>,
    pub session_id: Option<String>,
    pub show_thinking: bool,
    pub use_advanced_context: bool,
}

impl ChatCompletionOptions {
    pub fn tools_enabled(&self) -> bool {
        self.enable_tools != Some(false)
    }

    pub fn wants_stream(&self) -> bool {
        self.stream == Some(true)
    }
}

/// A provider round-trip as the adapter produced it.
#[derive(Debug, Default)]
pub struct ChatResponse {
    pub text: Option<String>,
    pub model: String,
    pub provider: String,
    pub usage: Option<Usage>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub stream: Option<PendingStream>,
}

/// A [`ChatResponse`] with text always present and tool calls always a list of
/// valid calls. Build one with [`normalize::normalize_chat_response`].
#[derive(Debug, Default)]
pub struct NormalizedChatResponse {
    pub text: String,
    pub model: String,
    pub provider: String,
    pub usage: Option<Usage>,
    pub tool_calls: Vec<ToolCall>,
    pub stream: Option<PendingStream>,
}

impl PartialEq for NormalizedChatResponse {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
            && self.model == other.model
            && self.provider == other.provider
            && self.usage == other.usage
            && self.tool_calls == other.tool_calls
            && self.stream.is_some() == other.stream.is_some()
    }
}

impl NormalizedChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Drives the pending stream, if any. On success `text`, `tool_calls` and
    /// `usage` hold the fully accumulated values.
    pub fn consume_stream(
        &mut self,
        on_chunk: &mut dyn FnMut(&StreamChunk),
    ) -> Result<(), ProviderError> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        let outcome = stream.drive(on_chunk)?;
        self.text = outcome.text;
        self.tool_calls = normalize::normalize_tool_calls(outcome.tool_calls);
        if outcome.usage.is_some() {
            self.usage = outcome.usage;
        }
        Ok(())
    }
}

/// One vendor integration. Implementations translate canonical messages into
/// the vendor wire format and back.
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// True only when the AI feature is enabled and the required credentials
    /// are present and non-blank.
    fn is_available(&self) -> bool;

    /// The model used when a request names none.
    fn default_model(&self) -> Option<String> {
        None
    }

    fn generate_chat_completion(
        &self,
        messages: &[Message],
        options: &ChatCompletionOptions,
    ) -> Result<ChatResponse, ProviderError>;

    /// Drops the cached HTTP client so the next call rebuilds it.
    fn clear_cache(&self) {}

    /// Replaces credentials and endpoint; implies [`LlmProvider::clear_cache`].
    fn update_settings(&self, _settings: ProviderSettings) {
        self.clear_cache();
    }

    fn to_normalized_response(&self, response: ChatResponse) -> NormalizedChatResponse {
        normalize::normalize_chat_response(response)
    }
}
