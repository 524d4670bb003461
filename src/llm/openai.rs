use super::client::{AdapterCore, AdapterOptions};
use super::stream::{LineDecoder, PendingStream, StreamEvent};
use super::{
    prompt, ChatCompletionOptions, ChatResponse, FunctionCall, LlmProvider, Message, Role,
    ToolArguments, ToolCall, ToolChoice, ToolDefinition, Usage,
};
use crate::config::ProviderSettings;
use crate::error::ProviderError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::BufReader;
use tracing::{debug, warn};

pub const PROVIDER: &str = "openai";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

pub struct OpenAiClient {
    core: AdapterCore,
}

// --- OpenAI API request/response types ---

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct WireMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct WireToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: WireFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String, // OpenAI sends arguments as a JSON string
}

#[derive(Deserialize, Debug)]
struct CompletionBody {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: WireMessage,
}

#[derive(Deserialize, Debug, Clone, Copy)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u
                .total_tokens
                .unwrap_or(u.prompt_tokens + u.completion_tokens),
        }
    }
}

// --- Implementation ---

impl OpenAiClient {
    pub fn new(settings: ProviderSettings, options: AdapterOptions) -> Self {
        Self {
            core: AdapterCore::new(PROVIDER, settings, options),
        }
    }

    /// Canonical messages in wire form, with every system message replaced by
    /// a single leading `system_prompt`.
    fn convert_messages(messages: &[Message], system_prompt: &str) -> Vec<WireMessage> {
        let mut converted = vec![WireMessage {
            role: Role::System.to_string(),
            content: Some(system_prompt.to_string()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }];

        converted.extend(messages.iter().filter(|m| m.role != Role::System).map(|m| {
            let tool_calls = if m.tool_calls.is_empty() {
                None
            } else {
                Some(
                    m.tool_calls
                        .iter()
                        .map(|tc| WireToolCall {
                            id: tc.id.clone(),
                            call_type: function_type(),
                            function: WireFunctionCall {
                                name: tc.name().to_string(),
                                arguments: tc
                                    .arguments()
                                    .map_or_else(|| "{}".to_string(), ToolArguments::to_json_string),
                            },
                        })
                        .collect(),
                )
            };

            WireMessage {
                role: m.role.to_string(),
                content: if m.content.is_empty() && tool_calls.is_some() {
                    None
                } else {
                    Some(m.content.clone())
                },
                tool_calls,
                tool_call_id: m.tool_call_id.clone(),
                name: if m.role == Role::Tool { m.name.clone() } else { None },
            }
        }));

        converted
    }

    fn convert_tool_choice(choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::None => json!("none"),
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Any => json!("required"),
            ToolChoice::Function(name) => json!({"type": "function", "function": {"name": name}}),
        }
    }

    fn build_request(
        &self,
        messages: &[Message],
        options: &ChatCompletionOptions,
        model: &str,
        stream: bool,
    ) -> ChatRequest {
        let system_prompt = prompt::system_prompt_for(messages, options, PROVIDER);
        let tools = if options.tools_enabled() {
            options.tools.clone()
        } else {
            vec![]
        };
        let tool_choice = options
            .tool_choice
            .as_ref()
            .filter(|_| !tools.is_empty())
            .map(Self::convert_tool_choice);

        ChatRequest {
            model: model.to_string(),
            messages: Self::convert_messages(messages, &system_prompt),
            tools,
            tool_choice,
            temperature: self.core.temperature(options),
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            frequency_penalty: options.frequency_penalty,
            presence_penalty: options.presence_penalty,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    fn parse_response(body: CompletionBody, model: &str) -> Result<ChatResponse, ProviderError> {
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Parse("No choices in response".to_string()))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                call_type: tc.call_type,
                function: Some(FunctionCall {
                    name: tc.function.name,
                    arguments: Some(ToolArguments::Raw(tc.function.arguments)),
                }),
            })
            .collect();

        Ok(ChatResponse {
            text: choice.message.content,
            model: body.model.unwrap_or_else(|| model.to_string()),
            provider: PROVIDER.to_string(),
            usage: body.usage.map(Usage::from),
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            stream: None,
        })
    }
}

impl LlmProvider for OpenAiClient {
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
        let api_key = self.core.require_api_key()?;
        let base_url = self.core.base_url(DEFAULT_BASE_URL);
        let model = self.core.model(options, DEFAULT_MODEL);
        let stream = options.wants_stream();
        let request = self.build_request(messages, options, &model, stream);

        debug!(
            provider = PROVIDER,
            %model,
            stream,
            tools = request.tools.len(),
            messages = request.messages.len(),
            "sending chat completion"
        );

        let client = self.core.client()?;
        let builder = client
            .post(format!("{}/chat/completions", base_url))
            .bearer_auth(api_key)
            .json(&request);
        let response = self.core.send(builder, &base_url, &model)?;

        if stream {
            return Ok(ChatResponse {
                text: None,
                model,
                provider: PROVIDER.to_string(),
                usage: None,
                tool_calls: None,
                stream: Some(PendingStream::from_lines(
                    BufReader::new(response),
                    SseDecoder::default(),
                )),
            });
        }

        let body: CompletionBody = self.core.read_json(response, &model)?;
        Self::parse_response(body, &model).map_err(|e| self.core.log_failure(&model, e))
    }

    fn clear_cache(&self) {
        self.core.clear_cache();
    }

    fn update_settings(&self, settings: ProviderSettings) {
        self.core.update_settings(settings);
    }
}

/// Decodes `data:` lines of the chat completions event stream.
///
/// Tool-call deltas repeat only their `index` after the first fragment, so the
/// first id seen for an index becomes the key for every later fragment.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    keys: HashMap<u64, String>,
    order: Vec<String>,
    done: bool,
}

impl SseDecoder {
    fn key_for(&mut self, index: u64, id: Option<&str>) -> String {
        if let Some(key) = self.keys.get(&index) {
            return key.clone();
        }
        let key = id
            .map(str::to_string)
            .unwrap_or_else(|| format!("index_{}", index));
        self.keys.insert(index, key.clone());
        self.order.push(key.clone());
        key
    }

    fn end_calls(&mut self) -> Vec<StreamEvent> {
        self.order
            .drain(..)
            .map(|key| StreamEvent::ToolCallEnd { key })
            .collect()
    }
}

impl LineDecoder for SseDecoder {
    fn decode(&mut self, line: &str) -> Vec<StreamEvent> {
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
            return vec![];
        };

        if data == "[DONE]" {
            self.done = true;
            let mut events = self.end_calls();
            events.push(StreamEvent::Done);
            return events;
        }

        let chunk: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                debug!(provider = PROVIDER, error = %e, "skipping malformed stream line");
                return vec![];
            }
        };

        if let Some(err) = chunk.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| err.to_string(), str::to_string);
            return vec![StreamEvent::Error(message)];
        }

        let mut events = Vec::new();

        if let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        {
            let delta = &choice["delta"];

            if let Some(content) = delta.get("content").and_then(Value::as_str) {
                if !content.is_empty() {
                    events.push(StreamEvent::TextDelta(content.to_string()));
                }
            }

            if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for tc in tool_calls {
                    let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0);
                    let id = tc.get("id").and_then(Value::as_str);
                    let key = self.key_for(index, id);
                    let func = tc.get("function");
                    let name = func
                        .and_then(|f| f.get("name"))
                        .and_then(Value::as_str)
                        .filter(|n| !n.is_empty());

                    if id.is_some() || name.is_some() {
                        events.push(StreamEvent::ToolCallStart {
                            key: key.clone(),
                            id: id.map(str::to_string),
                            name: name.map(str::to_string),
                        });
                    }
                    if let Some(args) = func
                        .and_then(|f| f.get("arguments"))
                        .and_then(Value::as_str)
                        .filter(|a| !a.is_empty())
                    {
                        events.push(StreamEvent::ToolCallDelta {
                            key,
                            arguments: args.to_string(),
                        });
                    }
                }
            }

            if choice.get("finish_reason").and_then(Value::as_str) == Some("tool_calls") {
                events.extend(self.end_calls());
            }
        }

        if let Some(usage) = chunk
            .get("usage")
            .filter(|u| !u.is_null())
            .and_then(|u| serde_json::from_value::<WireUsage>(u.clone()).ok())
        {
            events.push(StreamEvent::Usage(usage.into()));
        }

        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return vec![];
        }
        warn!(provider = PROVIDER, "stream closed before [DONE]");
        let mut events = self.end_calls();
        events.push(StreamEvent::Done);
        events
    }
}
