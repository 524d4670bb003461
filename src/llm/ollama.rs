use super::client::{AdapterCore, AdapterOptions};
use super::stream::{LineDecoder, PendingStream, StreamEvent};
use super::{
    prompt, ChatCompletionOptions, ChatResponse, LlmProvider, Message, Role, ToolArguments,
    ToolCall, ToolDefinition, Usage,
};
use crate::config::ProviderSettings;
use crate::error::ProviderError;
use crate::tools::args::parse_tool_arguments;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::BufReader;
use tracing::{debug, warn};

pub const PROVIDER: &str = "ollama";
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama2";

pub struct OllamaClient {
    core: AdapterCore,
}

// --- Ollama API request/response types ---

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinition>,
    options: OllamaOptions,
}

#[derive(Serialize, Default)]
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct OllamaMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Serialize, Deserialize, Debug)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize, Debug)]
struct OllamaChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: OllamaMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaChatResponse {
    fn usage(&self) -> Option<Usage> {
        if self.prompt_eval_count.is_none() && self.eval_count.is_none() {
            return None;
        }
        Some(Usage::new(
            self.prompt_eval_count.unwrap_or(0),
            self.eval_count.unwrap_or(0),
        ))
    }
}

// --- Implementation ---

impl OllamaClient {
    pub fn new(settings: ProviderSettings, options: AdapterOptions) -> Self {
        Self {
            core: AdapterCore::new(PROVIDER, settings, options),
        }
    }

    fn has_base_url(&self) -> bool {
        self.core
            .settings()
            .base_url
            .as_deref()
            .is_some_and(|u| !u.trim().is_empty())
    }

    fn convert_messages(messages: &[Message], system_prompt: &str) -> Vec<OllamaMessage> {
        let mut converted = vec![OllamaMessage {
            role: Role::System.to_string(),
            content: system_prompt.to_string(),
            ..Default::default()
        }];

        converted.extend(messages.iter().filter(|m| m.role != Role::System).map(|m| {
            let tool_calls = (!m.tool_calls.is_empty()).then(|| {
                m.tool_calls
                    .iter()
                    .map(|tc| OllamaToolCall {
                        function: OllamaFunctionCall {
                            name: tc.name().to_string(),
                            arguments: match tc.arguments() {
                                Some(ToolArguments::Structured(map)) => Value::Object(map.clone()),
                                Some(raw) => Value::Object(parse_tool_arguments(raw).args),
                                None => Value::Object(Map::new()),
                            },
                        },
                    })
                    .collect()
            });

            OllamaMessage {
                role: m.role.to_string(),
                content: m.content.clone(),
                thinking: None,
                tool_calls,
                tool_name: if m.role == Role::Tool { m.name.clone() } else { None },
            }
        }));

        converted
    }

    fn build_request(
        &self,
        messages: &[Message],
        options: &ChatCompletionOptions,
        model: &str,
        stream: bool,
    ) -> OllamaChatRequest {
        let system_prompt = prompt::system_prompt_for(messages, options, PROVIDER);
        OllamaChatRequest {
            model: model.to_string(),
            messages: Self::convert_messages(messages, &system_prompt),
            stream,
            tools: if options.tools_enabled() {
                options.tools.clone()
            } else {
                vec![]
            },
            options: OllamaOptions {
                temperature: self.core.temperature(options),
                top_p: options.top_p,
                num_predict: options.max_tokens,
                frequency_penalty: options.frequency_penalty,
                presence_penalty: options.presence_penalty,
            },
        }
    }

    fn parse_response(body: OllamaChatResponse, model: &str) -> ChatResponse {
        let usage = body.usage();
        // Ollama does not assign ids; the normalizer fills them in.
        let tool_calls: Vec<ToolCall> = body
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: None,
                call_type: "function".to_string(),
                function: Some(super::FunctionCall {
                    name: tc.function.name,
                    arguments: Some(ToolArguments::from_value(tc.function.arguments)),
                }),
            })
            .collect();

        ChatResponse {
            text: Some(body.message.content),
            model: body.model.unwrap_or_else(|| model.to_string()),
            provider: PROVIDER.to_string(),
            usage,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            stream: None,
        }
    }
}

impl LlmProvider for OllamaClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn is_available(&self) -> bool {
        self.core.ai_enabled() && self.has_base_url()
    }

    fn default_model(&self) -> Option<String> {
        Some(self.core.model(&ChatCompletionOptions::default(), DEFAULT_MODEL))
    }

    fn generate_chat_completion(
        &self,
        messages: &[Message],
        options: &ChatCompletionOptions,
    ) -> Result<ChatResponse, ProviderError> {
        self.core.ensure_enabled()?;
        if !self.has_base_url() {
            return Err(ProviderError::unavailable(PROVIDER, "base URL is not configured"));
        }
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
            "sending chat request"
        );

        let client = self.core.client()?;
        let builder = client.post(format!("{}/api/chat", base_url)).json(&request);
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
                    NdjsonDecoder::default(),
                )),
            });
        }

        let body: OllamaChatResponse = self.core.read_json(response, &model)?;
        if let Some(err) = body.error {
            return Err(self.core.log_failure(&model, ProviderError::Request(err)));
        }
        Ok(Self::parse_response(body, &model))
    }

    fn clear_cache(&self) {
        self.core.clear_cache();
    }

    fn update_settings(&self, settings: ProviderSettings) {
        self.core.update_settings(settings);
    }
}

/// Decodes newline-delimited JSON chunks. Ollama sends each tool call whole,
/// so every call opens and closes within one line.
#[derive(Debug, Default)]
struct NdjsonDecoder {
    calls_seen: usize,
    done: bool,
}

impl LineDecoder for NdjsonDecoder {
    fn decode(&mut self, line: &str) -> Vec<StreamEvent> {
        let line = line.trim();
        if line.is_empty() {
            return vec![];
        }
        let chunk: OllamaChatResponse = match serde_json::from_str(line) {
            Ok(c) => c,
            Err(e) => {
                debug!(provider = PROVIDER, error = %e, "skipping malformed stream line");
                return vec![];
            }
        };
        if let Some(err) = chunk.error {
            return vec![StreamEvent::Error(err)];
        }

        let mut events = Vec::new();
        if let Some(thinking) = chunk.message.thinking.as_deref().filter(|t| !t.is_empty()) {
            events.push(StreamEvent::ThinkingDelta(thinking.to_string()));
        }
        if !chunk.message.content.is_empty() {
            events.push(StreamEvent::TextDelta(chunk.message.content.clone()));
        }
        for tc in chunk.message.tool_calls.iter().flatten() {
            let key = format!("call_{}", self.calls_seen);
            self.calls_seen += 1;
            events.push(StreamEvent::ToolCallStart {
                key: key.clone(),
                id: None,
                name: Some(tc.function.name.clone()),
            });
            let arguments = match &tc.function.arguments {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            if !arguments.is_empty() {
                events.push(StreamEvent::ToolCallDelta {
                    key: key.clone(),
                    arguments,
                });
            }
            events.push(StreamEvent::ToolCallEnd { key });
        }
        if chunk.done {
            if let Some(usage) = chunk.usage() {
                events.push(StreamEvent::Usage(usage));
            }
            self.done = true;
            events.push(StreamEvent::Done);
        }
        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return vec![];
        }
        warn!(provider = PROVIDER, "stream closed before done flag");
        vec![StreamEvent::Done]
    }
}
