//! Anthropic Messages API. The request/response translation is shared with
//! other vendors that speak the same dialect (see [`super::minimax`]).

use super::client::{AdapterCore, AdapterOptions};
use super::stream::{LineDecoder, PendingStream, StreamEvent};
use super::{
    prompt, ChatCompletionOptions, ChatResponse, LlmProvider, Message, Role, ToolArguments,
    ToolCall, ToolChoice, ToolDefinition, Usage,
};
use crate::config::ProviderSettings;
use crate::error::ProviderError;
use crate::tools::args::parse_tool_arguments;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::io::BufReader;
use tracing::{debug, warn};

pub const PROVIDER: &str = "anthropic";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
pub const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// What differs between vendors speaking the Messages dialect.
#[derive(Debug, Clone)]
pub(crate) struct Dialect {
    pub provider: &'static str,
    pub default_base_url: &'static str,
    pub default_model: &'static str,
    /// Tool choice sent when tools are present and the request names none.
    pub default_tool_choice: Option<ToolChoice>,
}

pub(crate) const ANTHROPIC: Dialect = Dialect {
    provider: PROVIDER,
    default_base_url: DEFAULT_BASE_URL,
    default_model: DEFAULT_MODEL,
    default_tool_choice: None,
};

pub struct AnthropicClient {
    core: AdapterCore,
}

// --- Messages API request/response types ---

#[derive(Serialize)]
pub(crate) struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: String },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Debug, PartialEq)]
struct WireTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Deserialize, Debug)]
pub(crate) struct MessagesBody {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize, Debug, Default, Clone, Copy)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

// --- Translation ---

fn tool_input(arguments: Option<&ToolArguments>) -> Value {
    match arguments {
        Some(ToolArguments::Structured(map)) => Value::Object(map.clone()),
        Some(raw @ ToolArguments::Raw(_)) => Value::Object(parse_tool_arguments(raw).args),
        None => Value::Object(Map::new()),
    }
}

/// System messages are dropped; the system prompt travels top-level.
pub(crate) fn convert_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .filter_map(|msg| match msg.role {
            Role::System => None,
            Role::User => Some(WireMessage {
                role: "user".to_string(),
                content: WireContent::Text(msg.content.clone()),
            }),
            Role::Assistant if msg.tool_calls.is_empty() => Some(WireMessage {
                role: "assistant".to_string(),
                content: WireContent::Text(msg.content.clone()),
            }),
            Role::Assistant => {
                let mut blocks = Vec::with_capacity(msg.tool_calls.len() + 1);
                if !msg.content.is_empty() {
                    blocks.push(ContentBlock::Text {
                        text: msg.content.clone(),
                    });
                }
                blocks.extend(msg.tool_calls.iter().map(|tc| ContentBlock::ToolUse {
                    id: tc.id().to_string(),
                    name: tc.name().to_string(),
                    input: tool_input(tc.arguments()),
                }));
                Some(WireMessage {
                    role: "assistant".to_string(),
                    content: WireContent::Blocks(blocks),
                })
            }
            Role::Tool => Some(WireMessage {
                role: "user".to_string(),
                content: WireContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content.clone(),
                }]),
            }),
        })
        .collect()
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<WireTool> {
    tools
        .iter()
        .map(|t| WireTool {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            input_schema: t.function.parameters.clone(),
        })
        .collect()
}

pub(crate) fn tool_choice_value(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::None => json!({"type": "none"}),
        ToolChoice::Auto => json!({"type": "auto"}),
        ToolChoice::Any => json!({"type": "any"}),
        ToolChoice::Function(name) => json!({"type": "tool", "name": name}),
    }
}

pub(crate) fn build_request(
    dialect: &Dialect,
    core: &AdapterCore,
    messages: &[Message],
    options: &ChatCompletionOptions,
    model: &str,
    stream: bool,
) -> MessagesRequest {
    let tools = if options.tools_enabled() {
        convert_tools(&options.tools)
    } else {
        vec![]
    };
    let tool_choice = if tools.is_empty() {
        None
    } else {
        options
            .tool_choice
            .as_ref()
            .or(dialect.default_tool_choice.as_ref())
            .map(tool_choice_value)
    };

    MessagesRequest {
        model: model.to_string(),
        max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: Some(prompt::system_prompt_for(messages, options, dialect.provider)),
        messages: convert_messages(messages),
        tools,
        tool_choice,
        temperature: core.temperature(options),
        top_p: options.top_p,
        stream,
    }
}

pub(crate) fn parse_response(body: MessagesBody, provider: &str, model: &str) -> ChatResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in body.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::new(&id, &name, ToolArguments::from_value(input)));
            }
            _ => {}
        }
    }

    ChatResponse {
        text: Some(text),
        model: body.model.unwrap_or_else(|| model.to_string()),
        provider: provider.to_string(),
        usage: body
            .usage
            .map(|u| Usage::new(u.input_tokens, u.output_tokens)),
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        stream: None,
    }
}

/// Full request cycle for a Messages-dialect vendor.
pub(crate) fn complete(
    dialect: &Dialect,
    core: &AdapterCore,
    messages: &[Message],
    options: &ChatCompletionOptions,
) -> Result<ChatResponse, ProviderError> {
    let api_key = core.require_api_key()?;
    let base_url = core.base_url(dialect.default_base_url);
    let model = core.model(options, dialect.default_model);
    let stream = options.wants_stream();
    let request = build_request(dialect, core, messages, options, &model, stream);

    debug!(
        provider = dialect.provider,
        %model,
        stream,
        tools = request.tools.len(),
        messages = request.messages.len(),
        "sending messages request"
    );

    let client = core.client()?;
    let builder = client
        .post(format!("{}/v1/messages", base_url))
        .header("x-api-key", api_key)
        .header("anthropic-version", API_VERSION)
        .json(&request);
    let response = core.send(builder, &base_url, &model)?;

    if stream {
        return Ok(ChatResponse {
            text: None,
            model,
            provider: dialect.provider.to_string(),
            usage: None,
            tool_calls: None,
            stream: Some(PendingStream::from_lines(
                BufReader::new(response),
                MessagesSseDecoder::new(dialect.provider),
            )),
        });
    }

    let body: MessagesBody = core.read_json(response, &model)?;
    Ok(parse_response(body, dialect.provider, &model))
}

/// Decodes the Messages event stream. Blocks are addressed by index; a
/// `tool_use` block's id becomes the key for its later fragments.
#[derive(Debug)]
pub(crate) struct MessagesSseDecoder {
    provider: &'static str,
    tool_blocks: HashMap<u64, String>,
    input_tokens: u64,
    done: bool,
}

impl MessagesSseDecoder {
    pub(crate) fn new(provider: &'static str) -> Self {
        Self {
            provider,
            tool_blocks: HashMap::new(),
            input_tokens: 0,
            done: false,
        }
    }
}

impl LineDecoder for MessagesSseDecoder {
    fn decode(&mut self, line: &str) -> Vec<StreamEvent> {
        let Some(data) = line.trim().strip_prefix("data:").map(str::trim_start) else {
            return vec![];
        };

        let event: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                debug!(provider = self.provider, error = %e, "skipping malformed stream line");
                return vec![];
            }
        };

        let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);

        match event.get("type").and_then(Value::as_str).unwrap_or("") {
            "message_start" => {
                if let Some(tokens) = event
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                {
                    self.input_tokens = tokens;
                }
                vec![]
            }
            "content_block_start" => {
                let Some(block) = event.get("content_block") else {
                    return vec![];
                };
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        let id = block.get("id").and_then(Value::as_str).map(str::to_string);
                        let key = id.clone().unwrap_or_else(|| format!("block_{}", index));
                        self.tool_blocks.insert(index, key.clone());
                        let mut events = vec![StreamEvent::ToolCallStart {
                            key: key.clone(),
                            id,
                            name: block.get("name").and_then(Value::as_str).map(str::to_string),
                        }];
                        // Some compatible servers send the whole input up front.
                        if let Some(input) = block
                            .get("input")
                            .and_then(Value::as_object)
                            .filter(|m| !m.is_empty())
                        {
                            events.push(StreamEvent::ToolCallDelta {
                                key,
                                arguments: Value::Object(input.clone()).to_string(),
                            });
                        }
                        events
                    }
                    Some("text") => block
                        .get("text")
                        .and_then(Value::as_str)
                        .filter(|t| !t.is_empty())
                        .map(|t| vec![StreamEvent::TextDelta(t.to_string())])
                        .unwrap_or_default(),
                    _ => vec![],
                }
            }
            "content_block_delta" => {
                let Some(delta) = event.get("delta") else {
                    return vec![];
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => delta
                        .get("text")
                        .and_then(Value::as_str)
                        .filter(|t| !t.is_empty())
                        .map(|t| vec![StreamEvent::TextDelta(t.to_string())])
                        .unwrap_or_default(),
                    Some("thinking_delta") => delta
                        .get("thinking")
                        .and_then(Value::as_str)
                        .map(|t| vec![StreamEvent::ThinkingDelta(t.to_string())])
                        .unwrap_or_default(),
                    Some("input_json_delta") => {
                        let partial = delta
                            .get("partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        match self.tool_blocks.get(&index) {
                            Some(key) if !partial.is_empty() => vec![StreamEvent::ToolCallDelta {
                                key: key.clone(),
                                arguments: partial.to_string(),
                            }],
                            _ => vec![],
                        }
                    }
                    _ => vec![],
                }
            }
            "content_block_stop" => self
                .tool_blocks
                .get(&index)
                .map(|key| vec![StreamEvent::ToolCallEnd { key: key.clone() }])
                .unwrap_or_default(),
            "message_delta" => event
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
                .map(|output| vec![StreamEvent::Usage(Usage::new(self.input_tokens, output))])
                .unwrap_or_default(),
            "message_stop" => {
                self.done = true;
                vec![StreamEvent::Done]
            }
            "error" => {
                let message = event
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown stream error");
                vec![StreamEvent::Error(message.to_string())]
            }
            _ => vec![],
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return vec![];
        }
        warn!(provider = self.provider, "stream closed before message_stop");
        vec![StreamEvent::Done]
    }
}

// --- Implementation ---

impl AnthropicClient {
    pub fn new(settings: ProviderSettings, options: AdapterOptions) -> Self {
        Self {
            core: AdapterCore::new(PROVIDER, settings, options),
        }
    }
}

impl LlmProvider for AnthropicClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn is_available(&self) -> bool {
        self.core.ai_enabled() && self.core.has_api_key()
    }

    fn default_model(&self) -> Option<String> {
        Some(self.core.model(&ChatCompletionOptions::default(), DEFAULT_MODEL))
    }

    fn generate_chat_completion(
        &self,
        messages: &[Message],
        options: &ChatCompletionOptions,
    ) -> Result<ChatResponse, ProviderError> {
        complete(&ANTHROPIC, &self.core, messages, options)
    }

    fn clear_cache(&self) {
        self.core.clear_cache();
    }

    fn update_settings(&self, settings: ProviderSettings) {
        self.core.update_settings(settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::stream::StreamChunk;
    use std::io::Cursor;

    fn core() -> AdapterCore {
        AdapterCore::new(PROVIDER, ProviderSettings::default(), AdapterOptions::default())
    }

    fn decode_all(lines: &[&str]) -> Vec<StreamEvent> {
        let mut decoder = MessagesSseDecoder::new(PROVIDER);
        let mut events: Vec<StreamEvent> = lines.iter().flat_map(|l| decoder.decode(l)).collect();
        events.extend(decoder.finish());
        events
    }

    #[test]
    fn test_convert_messages_drops_system() {
        let converted = convert_messages(&[Message::system("sys"), Message::user("Hello")]);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].role, "user");
        assert_eq!(converted[0].content, WireContent::Text("Hello".to_string()));
    }

    #[test]
    fn test_convert_messages_assistant_with_tool_calls() {
        let call = ToolCall::new("toolu_1", "read_note", ToolArguments::Raw("{noteId: 'n1'}".to_string()));
        let converted = convert_messages(&[Message::assistant_with_tool_calls("Checking.", vec![call])]);
        let WireContent::Blocks(blocks) = &converted[0].content else {
            panic!("expected blocks");
        };
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            blocks[1],
            ContentBlock::ToolUse {
                id: "toolu_1".to_string(),
                name: "read_note".to_string(),
                input: json!({"noteId": "n1"}),
            }
        );
    }

    #[test]
    fn test_convert_messages_tool_result() {
        let converted = convert_messages(&[Message::tool_result("toolu_1", "read_note", "body")]);
        assert_eq!(converted[0].role, "user");
        let value = serde_json::to_value(&converted[0]).unwrap();
        assert_eq!(value["content"][0]["type"], "tool_result");
        assert_eq!(value["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(value["content"][0]["content"], "body");
    }

    #[test]
    fn test_convert_tools() {
        let tools = convert_tools(&[ToolDefinition::new(
            "search_notes",
            "Search",
            json!({"type": "object", "properties": {}}),
        )]);
        assert_eq!(tools[0].name, "search_notes");
        assert_eq!(tools[0].input_schema["type"], "object");
    }

    #[test]
    fn test_tool_choice_values() {
        assert_eq!(tool_choice_value(&ToolChoice::Any), json!({"type": "any"}));
        assert_eq!(
            tool_choice_value(&ToolChoice::Function("list_notes".to_string())),
            json!({"type": "tool", "name": "list_notes"})
        );
    }

    #[test]
    fn test_request_serialization() {
        let options = ChatCompletionOptions {
            system_prompt: Some("Be brief.".to_string()),
            tools: vec![ToolDefinition::new("list_notes", "List", json!({"type": "object"}))],
            ..Default::default()
        };
        let request = build_request(&ANTHROPIC, &core(), &[Message::user("hi")], &options, DEFAULT_MODEL, false);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], DEFAULT_MODEL);
        assert_eq!(value["max_tokens"], 4096);
        assert!(value["system"].as_str().unwrap().starts_with("Be brief.\n\n<instructions>"));
        assert_eq!(value["tools"][0]["name"], "list_notes");
        assert!(value.get("tool_choice").is_none());
        assert_eq!(value["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_response_text_and_tool_use() {
        let body: MessagesBody = serde_json::from_value(json!({
            "model": "claude-3-5-sonnet-20241022",
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Let me "},
                {"type": "text", "text": "look."},
                {"type": "tool_use", "id": "toolu_9", "name": "list_notes", "input": {"limit": 5}}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 8}
        }))
        .unwrap();
        let resp = parse_response(body, PROVIDER, "fallback");
        assert_eq!(resp.text.as_deref(), Some("Let me look."));
        assert_eq!(resp.model, "claude-3-5-sonnet-20241022");
        assert_eq!(resp.usage, Some(Usage::new(12, 8)));
        let calls = resp.tool_calls.unwrap();
        assert_eq!(calls[0].id(), "toolu_9");
        assert_eq!(
            calls[0].arguments(),
            Some(&ToolArguments::from_value(json!({"limit": 5})))
        );
    }

    #[test]
    fn test_parse_response_unknown_blocks_ignored() {
        let body: MessagesBody = serde_json::from_value(json!({
            "content": [{"type": "server_tool_use", "id": "x"}, {"type": "text", "text": "ok"}]
        }))
        .unwrap();
        let resp = parse_response(body, PROVIDER, "m");
        assert_eq!(resp.text.as_deref(), Some("ok"));
        assert!(resp.tool_calls.is_none());
    }

    #[test]
    fn test_sse_text_and_usage() {
        let events = decode_all(&[
            "event: message_start",
            r#"data: {"type":"message_start","message":{"usage":{"input_tokens":20,"output_tokens":1}}}"#,
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            r#"data: {"type":"content_block_stop","index":0}"#,
            r#"data: {"type":"ping"}"#,
            r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":3}}"#,
            r#"data: {"type":"message_stop"}"#,
        ]);
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Hi".to_string()),
                StreamEvent::Usage(Usage::new(20, 3)),
                StreamEvent::Done,
            ]
        );
    }

    #[test]
    fn test_sse_tool_use_block() {
        let events = decode_all(&[
            r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"search_notes","input":{}}}"#,
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"query\":"}}"#,
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
            r#"data: {"type":"content_block_stop","index":1}"#,
            r#"data: {"type":"message_stop"}"#,
        ]);
        assert_eq!(events.len(), 5);
        assert_eq!(
            events[0],
            StreamEvent::ToolCallStart {
                key: "toolu_1".to_string(),
                id: Some("toolu_1".to_string()),
                name: Some("search_notes".to_string()),
            }
        );
        assert_eq!(
            events[3],
            StreamEvent::ToolCallEnd {
                key: "toolu_1".to_string()
            }
        );
    }

    #[test]
    fn test_sse_thinking_delta() {
        let events = decode_all(&[
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"step one"}}"#,
        ]);
        assert_eq!(events[0], StreamEvent::ThinkingDelta("step one".to_string()));
        assert_eq!(events[1], StreamEvent::Done);
    }

    #[test]
    fn test_sse_error_event() {
        let events = decode_all(&[
            r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ]);
        assert_eq!(events[0], StreamEvent::Error("Overloaded".to_string()));
    }

    #[test]
    fn test_stream_emits_single_complete_event() {
        let body = [
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"list_notes","input":{}}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{}"}}"#,
            r#"data: {"type":"content_block_stop","index":0}"#,
            r#"data: {"type":"message_stop"}"#,
        ]
        .join("\n");
        let stream = PendingStream::from_lines(Cursor::new(body), MessagesSseDecoder::new(PROVIDER));
        let mut chunks: Vec<StreamChunk> = Vec::new();
        let outcome = stream.drive(&mut |c| chunks.push(c.clone())).unwrap();

        let completes = chunks
            .iter()
            .filter(|c| {
                c.tool_execution
                    .as_ref()
                    .is_some_and(|t| t.phase == crate::llm::stream::ToolPhase::Complete)
            })
            .count();
        assert_eq!(completes, 1);
        assert_eq!(outcome.tool_calls[0].name(), "list_notes");
    }

    #[test]
    fn test_unavailable_without_key() {
        let client = AnthropicClient::new(ProviderSettings::default(), AdapterOptions::default());
        assert!(!client.is_available());
        let err = client
            .generate_chat_completion(&[Message::user("hi")], &ChatCompletionOptions::default())
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }
}
