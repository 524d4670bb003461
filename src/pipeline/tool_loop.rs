//! The bounded tool-calling loop: completion, tool execution, follow-up,
//! repeated until the model stops asking for tools or the iteration ceiling
//! is hit.
//!
//! With a ceiling of `N` the loop makes at most `N + 1` provider calls for the
//! tool conversation itself. A response that still asks for tools at the
//! ceiling is returned prefixed with a ceiling notice, and a note is appended
//! to the conversation.

use super::metrics::MetricsRecorder;
use super::stages::{
    LlmCompletionInput, LlmCompletionStage, PipelineStage, ResponseProcessingInput,
    ResponseProcessingStage, ToolCallingInput, ToolCallingStage,
};
use super::streaming::{FollowUpKind, StreamingContext, StreamingStrategy};
use crate::error::PipelineError;
use crate::llm::stream::{StreamCallback, StreamChunk, ToolExecutionInfo};
use crate::llm::{
    validate_tool_messages, ChatCompletionOptions, Message, NormalizedChatResponse, Role,
    ToolArguments, ToolCall, ToolChoice,
};
use crate::tools::ToolRegistry;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

const PREVIEW_CHARS: usize = 500;
const FALLBACK_RESULTS: usize = 3;

const LIST_HINTS: &[&str] = &["list", "show", "what notes", "all notes", "catalog", "index"];
const KEYWORD_HINTS: &[&str] = &["#", "attribute", "label", "relation", "="];

/// The note tool most likely to help with `query`, for providers that must be
/// pushed into calling one. `None` for a blank query.
pub fn fallback_tool_for_query(query: &str) -> Option<&'static str> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return None;
    }
    if LIST_HINTS.iter().any(|h| query.contains(h)) {
        Some("list_notes")
    } else if KEYWORD_HINTS.iter().any(|h| query.contains(h)) {
        Some("keyword_search_notes")
    } else {
        Some("search_notes")
    }
}

fn forced_tool_instruction(tool: &str, query: &str) -> String {
    format!(
        "You must call the {} tool now to gather note data for: \"{}\". Respond only with a tool call.",
        tool,
        query.trim()
    )
}

fn synthetic_tool_call(tool: &str, query: &str) -> ToolCall {
    let mut args = Map::new();
    if tool != "list_notes" && !query.trim().is_empty() {
        args.insert("query".to_string(), Value::String(query.trim().to_string()));
    }
    let arguments = ToolArguments::Raw(Value::Object(args).to_string());
    ToolCall::new(&format!("forced-{}", Uuid::new_v4()), tool, arguments)
}

/// Used when the model produced no text at all after running tools.
pub fn fallback_response(messages: &[Message]) -> String {
    let tool_messages: Vec<&Message> = messages.iter().filter(|m| m.role == Role::Tool).collect();
    if tool_messages.is_empty() {
        return "Tool execution completed, but no final response was generated. Please retry or adjust the request."
            .to_string();
    }

    let mut lines = vec![
        "Tool execution completed, but the model returned no final text.".to_string(),
        "Latest tool results:".to_string(),
    ];
    let start = tool_messages.len().saturating_sub(FALLBACK_RESULTS);
    for msg in &tool_messages[start..] {
        let name = msg.name.as_deref().unwrap_or("tool");
        let preview = if msg.content.chars().count() > PREVIEW_CHARS {
            let cut: String = msg.content.chars().take(PREVIEW_CHARS).collect();
            format!("{}...", cut)
        } else {
            msg.content.clone()
        };
        lines.push(format!("- {}: {}", name, preview));
    }
    lines.join("\n")
}

/// Opens the answer returned when the iteration ceiling stops the loop.
pub fn ceiling_notice(max: usize) -> String {
    format!(
        "[Reached maximum of {} tool calls. Finalizing response...]\n\n",
        max
    )
}

fn ceiling_note(max: usize) -> String {
    format!(
        "Maximum tool call iterations ({}) reached. Please provide your best response with the information gathered so far.",
        max
    )
}

pub struct ToolLoopInput {
    pub messages: Vec<Message>,
    pub query: Option<String>,
    /// Options after model selection. `stream` is overwritten per call.
    pub options: ChatCompletionOptions,
    pub provider_name: Option<String>,
    pub stream_callback: Option<StreamCallback>,
    pub client_stream: bool,
    pub provider_stream: bool,
    pub max_iterations: usize,
    /// Tool iterations already spent on this conversation by the caller.
    pub iterations_spent: usize,
    pub streaming_context: StreamingContext,
}

#[derive(Debug)]
pub struct ToolLoopOutcome {
    pub response: NormalizedChatResponse,
    pub messages: Vec<Message>,
    /// The returned response carries tool calls nobody ran, because tools
    /// were disabled for the request.
    pub needs_follow_up: bool,
    /// Tool iterations counted against the ceiling, including those spent
    /// before this run.
    pub iterations: usize,
    pub ceiling_reached: bool,
    /// Set when the ceiling stopped the loop; the final text must start with it.
    pub ceiling_notice: Option<String>,
    pub tools_ran: bool,
    /// Processed text already forwarded to the client callback.
    pub streamed_text: String,
}

impl ToolLoopOutcome {
    pub fn has_streamed(&self) -> bool {
        !self.streamed_text.is_empty()
    }
}

pub struct ToolLoop<'a> {
    pub llm_completion: &'a LlmCompletionStage,
    pub tool_calling: &'a ToolCallingStage,
    pub response_processing: &'a ResponseProcessingStage,
    pub tools: &'a ToolRegistry,
    pub strategy: &'a dyn StreamingStrategy,
    pub metrics: &'a MetricsRecorder,
}

impl ToolLoop<'_> {
    fn complete(
        &self,
        messages: &[Message],
        options: ChatCompletionOptions,
    ) -> Result<NormalizedChatResponse, PipelineError> {
        self.llm_completion.execute(
            LlmCompletionInput {
                messages: messages.to_vec(),
                options,
            },
            self.metrics,
        )
    }

    fn follow_up(
        &self,
        messages: &[Message],
        base: &ChatCompletionOptions,
        ctx: &StreamingContext,
        kind: FollowUpKind,
        tools_enabled: bool,
    ) -> Result<NormalizedChatResponse, PipelineError> {
        let stream = self.strategy.resolve_follow_up_streaming(ctx, kind);
        let options = ChatCompletionOptions {
            stream: Some(stream),
            enable_tools: Some(tools_enabled),
            tools: if tools_enabled { base.tools.clone() } else { vec![] },
            tool_choice: if tools_enabled { base.tool_choice.clone() } else { None },
            ..base.clone()
        };
        let mut response = self.complete(messages, options)?;
        response
            .consume_stream(&mut |_: &StreamChunk| {})
            .map_err(|e| PipelineError::new(self.llm_completion.name(), e))?;
        Ok(response)
    }

    fn process_chunk_text(&self, text: String, show_thinking: bool) -> String {
        let input = ResponseProcessingInput {
            text: text.clone(),
            show_thinking,
            usage: None,
        };
        // Per-chunk cleanup is not a stage run, so it bypasses the metrics.
        match self.response_processing.process(input) {
            Ok(processed) => processed,
            Err(e) => {
                warn!(error = %e, "failed to process stream chunk, forwarding it unchanged");
                text
            }
        }
    }

    /// Reads a streamed initial response to the end. When `forward` is set,
    /// chunks go to the client as they arrive; the terminal chunk is held back
    /// because the pipeline decides when the client's stream ends.
    fn drive_stream(
        &self,
        response: &mut NormalizedChatResponse,
        forward: Option<&StreamCallback>,
        show_thinking: bool,
        streamed: &mut String,
    ) -> Result<(), PipelineError> {
        let result = match forward {
            Some(callback) => response.consume_stream(&mut |chunk: &StreamChunk| {
                if chunk.done {
                    return;
                }
                let mut chunk = chunk.clone();
                if !chunk.text.is_empty() {
                    chunk.text = self.process_chunk_text(chunk.text, show_thinking);
                    streamed.push_str(&chunk.text);
                }
                callback.call(&chunk);
            }),
            None => response.consume_stream(&mut |_: &StreamChunk| {}),
        };
        result.map_err(|e| PipelineError::new(self.llm_completion.name(), e))
    }

    /// Nudges a provider that answered without tools into calling one.
    fn force_tool_call(
        &self,
        input: &ToolLoopInput,
        response: NormalizedChatResponse,
    ) -> Result<NormalizedChatResponse, PipelineError> {
        let query = input.query.as_deref().unwrap_or("");
        let Some(tool) = fallback_tool_for_query(query) else {
            return Ok(response);
        };
        if self.tools.get_tool(tool).is_none() {
            debug!(tool, "fallback tool not registered, not forcing a call");
            return Ok(response);
        }

        info!(tool, provider = ?input.provider_name, "no tool calls returned, forcing one");
        let mut messages = input.messages.clone();
        messages.push(Message::system(&forced_tool_instruction(tool, query)));
        let options = ChatCompletionOptions {
            tool_choice: Some(ToolChoice::Function(tool.to_string())),
            ..input.options.clone()
        };
        let mut forced = self.follow_up(
            &messages,
            &options,
            &input.streaming_context,
            FollowUpKind::Tool,
            true,
        )?;

        if forced.has_tool_calls() {
            info!(calls = forced.tool_calls.len(), "forced completion produced tool calls");
        } else {
            info!(tool, "forced completion returned no tool calls, injecting one");
            forced.tool_calls = vec![synthetic_tool_call(tool, query)];
        }
        Ok(forced)
    }

    pub fn run(&self, input: ToolLoopInput) -> Result<ToolLoopOutcome, PipelineError> {
        let tools_enabled = input.options.tools_enabled();
        let show_thinking = input.options.show_thinking;
        let client_callback = input
            .stream_callback
            .as_ref()
            .filter(|_| input.client_stream);
        let ctx = &input.streaming_context;

        let mut streamed_text = String::new();
        let initial_options = ChatCompletionOptions {
            stream: Some(input.provider_stream),
            stream_callback: None,
            ..input.options.clone()
        };
        let mut response = self.complete(&input.messages, initial_options)?;
        self.drive_stream(&mut response, client_callback, show_thinking, &mut streamed_text)?;

        let is_minimax = input
            .provider_name
            .as_deref()
            .unwrap_or(&response.provider)
            .eq_ignore_ascii_case(crate::llm::minimax::PROVIDER);
        if tools_enabled && !response.has_tool_calls() && is_minimax {
            response = self.force_tool_call(&input, response)?;
        }

        let mut messages = input.messages;
        let mut iterations = input.iterations_spent;
        let mut ceiling_reached = false;
        let mut ceiling_notice_text = None;
        let mut tools_ran = false;

        if tools_enabled && response.has_tool_calls() {
            if let Some(cb) = client_callback {
                cb.call(&StreamChunk::status(ToolExecutionInfo::start(
                    "tool_execution",
                    json!({}),
                )));
            }

            while response.has_tool_calls() {
                if iterations >= input.max_iterations {
                    warn!(
                        max = input.max_iterations,
                        "tool iteration ceiling reached, returning latest response"
                    );
                    ceiling_reached = true;
                    messages.push(Message::system(&ceiling_note(input.max_iterations)));
                    let notice = ceiling_notice(input.max_iterations);
                    if let Some(cb) = client_callback {
                        cb.call(&StreamChunk::text(&notice));
                        // The client now holds the start of the final answer.
                        streamed_text = notice.clone();
                    }
                    ceiling_notice_text = Some(notice);
                    break;
                }

                let stage_input = ToolCallingInput {
                    text: response.text.clone(),
                    tool_calls: response.tool_calls.clone(),
                    messages: messages.clone(),
                    stream_callback: client_callback.cloned(),
                    session_id: input.options.session_id.clone(),
                };
                let output = match self.tool_calling.execute(stage_input, self.metrics) {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(error = %e, "tool calling stage failed, asking the model to recover");
                        messages.push(Message::system(&format!(
                            "Error executing tool: {}. Please try a different approach.",
                            e.source
                        )));
                        if let Some(cb) = client_callback {
                            cb.call(&StreamChunk::status(ToolExecutionInfo::error(
                                "tool_execution",
                                &e.source.to_string(),
                            )));
                        }
                        iterations += 1;
                        response = self.follow_up(
                            &messages,
                            &input.options,
                            ctx,
                            FollowUpKind::Error,
                            false,
                        )?;
                        break;
                    }
                };

                messages = output.messages;
                tools_ran |= !output.results.is_empty();
                if !output.needs_follow_up {
                    break;
                }

                validate_tool_messages(&mut messages);
                if let Some(cb) = client_callback {
                    cb.call(&StreamChunk::status(ToolExecutionInfo::update(
                        "tool_processing",
                        json!({}),
                    )));
                }
                iterations += 1;
                info!(iteration = iterations, "requesting follow-up completion");
                response =
                    self.follow_up(&messages, &input.options, ctx, FollowUpKind::Tool, true)?;
            }
        }

        if tools_ran && response.text.trim().is_empty() {
            if !ceiling_reached {
                info!("empty response after tool execution, requesting final text");
                match self.follow_up(&messages, &input.options, ctx, FollowUpKind::FinalText, false)
                {
                    Ok(final_response) if !final_response.text.trim().is_empty() => {
                        response.text = final_response.text;
                        if final_response.usage.is_some() {
                            response.usage = final_response.usage;
                        }
                    }
                    Ok(_) => debug!("final text follow-up was empty as well"),
                    Err(e) => warn!(error = %e, "final text follow-up failed"),
                }
            }
            if response.text.trim().is_empty() {
                response.text = fallback_response(&messages);
            }
        }

        let needs_follow_up = !tools_enabled && response.has_tool_calls();
        debug!(
            iterations,
            ceiling_reached,
            tools_ran,
            needs_follow_up,
            "tool loop finished"
        );
        Ok(ToolLoopOutcome {
            response,
            messages,
            needs_follow_up,
            iterations,
            ceiling_reached,
            ceiling_notice: ceiling_notice_text,
            tools_ran,
            streamed_text,
        })
    }
}

/// Closes the client's stream: the part of `final_text` not yet forwarded,
/// with `done = true`.
pub fn finish_client_stream(callback: &StreamCallback, outcome: &ToolLoopOutcome, final_text: &str) {
    let remainder = if outcome.tools_ran || outcome.ceiling_reached {
        final_text
            .strip_prefix(outcome.streamed_text.as_str())
            .unwrap_or(final_text)
    } else if outcome.has_streamed() {
        ""
    } else {
        final_text
    };
    callback.call(&StreamChunk {
        usage: outcome.response.usage,
        ..StreamChunk::final_text(remainder)
    });
}
