//! Runs the tool calls of one model response and appends their results to the
//! conversation. Tool failures never abort the request: they become
//! `Error: ...` results the model can react to.

use super::PipelineStage;
use crate::error::StageError;
use crate::llm::stream::{StreamCallback, StreamChunk, ToolExecutionInfo};
use crate::llm::{Message, ToolArguments, ToolCall};
use crate::tools::args::parse_tool_arguments;
use crate::tools::{ToolOutput, ToolRegistry};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const EMPTY_RESULT_MARKERS: &[&str] = &[
    "no results",
    "not found",
    "empty",
    "no notes found",
    "0 results",
];

const EMPTY_RESULT_NOTE: &str = "NOTE: This tool returned no useful results with the provided parameters. \
Consider trying again with different parameters such as broader search terms, different filters, or alternative approaches.";

const SEARCH_TOOLS: &[&str] = &["search_notes", "keyword_search_notes"];

/// Whether a tool result carries nothing useful.
pub fn is_empty_tool_result(result: &Value, tool_name: &str) -> bool {
    match result {
        Value::Null => true,
        Value::String(s) => {
            let trimmed = s.trim().to_lowercase();
            trimmed.is_empty() || EMPTY_RESULT_MARKERS.iter().any(|m| trimmed.contains(m))
        }
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => {
            if let Some(Value::Array(results)) = map.get("results") {
                return results.is_empty();
            }
            if let Some(count) = map.get("count").filter(|c| c.is_number()) {
                return count.as_f64() == Some(0.0);
            }
            SEARCH_TOOLS.contains(&tool_name)
                && map
                    .get("message")
                    .and_then(Value::as_str)
                    .is_some_and(|m| m.to_lowercase().contains("no notes found"))
        }
        _ => false,
    }
}

/// Text handed back to the model when a tool is missing or fails.
pub fn tool_guidance(registry: &ToolRegistry, tool_name: &str, error: &str) -> String {
    let available = registry.tool_names();
    let mut guidance = format!(
        "Tool execution failed: {}\nAvailable tools are: {}.\nPlease choose a valid tool and ensure parameters match the required schema.",
        error,
        available.join(", ")
    );
    if !available.iter().any(|n| n == tool_name) {
        guidance.push_str(&format!("\nNote: \"{}\" is not a valid tool name.", tool_name));
    }
    guidance
}

fn empty_result_directive(empty_tools: &[String]) -> String {
    let has = |name: &str| empty_tools.iter().any(|t| t == name);
    let mut directive = String::from("YOU MUST NOT GIVE UP AFTER A SINGLE EMPTY SEARCH RESULT. ");
    if has("search_notes") || has("keyword_search_notes") {
        directive.push_str(
            "IMMEDIATELY RUN ANOTHER SEARCH TOOL with broader search terms, alternative keywords, or related concepts. ",
        );
        directive.push_str("Try synonyms, more general terms, or related topics. ");
    }
    if has("keyword_search_notes") {
        directive.push_str(
            "IMMEDIATELY TRY SEARCH_NOTES INSTEAD as it might find matches where keyword search failed. ",
        );
    }
    directive.push_str(
        "DO NOT ask the user what to do next or if they want general information. CONTINUE SEARCHING with different parameters.",
    );
    directive
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolResultStatus {
    Success,
    Empty,
    Error,
}

/// One tool result appended to the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedTool {
    pub call_id: String,
    pub name: String,
    pub content: String,
    pub status: ToolResultStatus,
}

pub struct ToolCallingInput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub messages: Vec<Message>,
    pub stream_callback: Option<StreamCallback>,
    pub session_id: Option<String>,
}

#[derive(Debug)]
pub struct ToolCallingOutput {
    pub messages: Vec<Message>,
    pub needs_follow_up: bool,
    pub results: Vec<ExecutedTool>,
}

pub struct ToolCallingStage {
    tools: Arc<ToolRegistry>,
}

impl ToolCallingStage {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }

    fn emit(callback: Option<&StreamCallback>, info: ToolExecutionInfo) {
        if let Some(cb) = callback {
            cb.call(&StreamChunk::status(info));
        }
    }

    /// Runs one call. `Err` holds the error text with guidance appended.
    fn run_call(
        &self,
        call: &ToolCall,
        callback: Option<&StreamCallback>,
    ) -> Result<ToolOutput, String> {
        let name = call.name();
        let Some(tool) = self.tools.get_tool(name) else {
            let error = format!("Tool not found: {}", name);
            warn!(tool = %name, "tool not found in registry");
            let message = format!("{}\n{}", error, tool_guidance(&self.tools, name, &error));
            Self::emit(callback, ToolExecutionInfo::error(name, &message));
            return Err(message);
        };

        let raw = call
            .arguments()
            .cloned()
            .unwrap_or_else(ToolArguments::empty);
        let parser = self
            .tools
            .get_tool_metadata(name)
            .and_then(|m| m.parse_arguments)
            .unwrap_or(parse_tool_arguments);
        let parsed = parser(&raw);
        for warning in &parsed.warnings {
            info!(tool = %name, %warning, "tool argument parse warning");
        }
        let args_value = Value::Object(parsed.args.clone());

        Self::emit(callback, ToolExecutionInfo::start(name, args_value.clone()));
        let started = Instant::now();
        match tool.execute(&parsed.args) {
            Ok(output) => {
                debug!(
                    tool = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool executed"
                );
                Self::emit(
                    callback,
                    ToolExecutionInfo::complete(name, args_value, Some(output.to_value())),
                );
                Ok(output)
            }
            Err(e) => {
                let error = e.to_string();
                warn!(tool = %name, error = %error, "tool execution failed");
                let message = format!("{}\n{}", error, tool_guidance(&self.tools, name, &error));
                Self::emit(callback, ToolExecutionInfo::error(name, &message));
                Err(message)
            }
        }
    }
}

impl PipelineStage for ToolCallingStage {
    type Input = ToolCallingInput;
    type Output = ToolCallingOutput;

    fn name(&self) -> &'static str {
        "tool_calling"
    }

    fn process(&self, input: ToolCallingInput) -> Result<ToolCallingOutput, StageError> {
        let ToolCallingInput {
            text,
            tool_calls,
            mut messages,
            stream_callback,
            session_id,
        } = input;

        if tool_calls.is_empty() {
            return Ok(ToolCallingOutput {
                messages,
                needs_follow_up: false,
                results: vec![],
            });
        }

        info!(
            calls = tool_calls.len(),
            session = session_id.as_deref().unwrap_or("-"),
            "executing tool calls"
        );
        messages.push(Message::assistant_with_tool_calls(&text, tool_calls.clone()));

        let mut results = Vec::with_capacity(tool_calls.len());
        for call in &tool_calls {
            let name = call.name().to_string();
            let (content, status) = match self.run_call(call, stream_callback.as_ref()) {
                Ok(output) => {
                    let text = output.to_text();
                    if is_empty_tool_result(&output.to_value(), &name) {
                        debug!(tool = %name, "tool returned an empty result");
                        (format!("{}\n\n{}", text, EMPTY_RESULT_NOTE), ToolResultStatus::Empty)
                    } else {
                        (text, ToolResultStatus::Success)
                    }
                }
                Err(message) => (format!("Error: {}", message), ToolResultStatus::Error),
            };
            messages.push(Message::tool_result(call.id(), &name, &content));
            results.push(ExecutedTool {
                call_id: call.id().to_string(),
                name,
                content,
                status,
            });
        }

        // The directive is triggered by empty results but names every result
        // whose text reads as empty, failed lookups included.
        if results.iter().any(|r| r.status == ToolResultStatus::Empty) {
            let empty_tools: Vec<String> = results
                .iter()
                .filter(|r| is_empty_tool_result(&Value::String(r.content.clone()), &r.name))
                .map(|r| r.name.clone())
                .collect();
            messages.push(Message::system(&empty_result_directive(&empty_tools)));
        }

        let needs_follow_up = !results.is_empty();
        debug!(
            results = results.len(),
            errors = results.iter().filter(|r| r.status == ToolResultStatus::Error).count(),
            empty = results.iter().filter(|r| r.status == ToolResultStatus::Empty).count(),
            needs_follow_up,
            "tool calls finished"
        );
        Ok(ToolCallingOutput {
            messages,
            needs_follow_up,
            results,
        })
    }
}
