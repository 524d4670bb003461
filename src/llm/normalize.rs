use super::{ChatResponse, FunctionCall, NormalizedChatResponse, ToolArguments, ToolCall};

fn normalize_tool_call(call: ToolCall, index: usize) -> Option<ToolCall> {
    let function = call.function?;
    let name = function.name.trim();
    if name.is_empty() {
        return None;
    }

    let id = match call.id {
        Some(id) if !id.is_empty() => id,
        _ => format!("call_{}", index),
    };

    Some(ToolCall {
        id: Some(id),
        call_type: call.call_type,
        function: Some(FunctionCall {
            name: name.to_string(),
            arguments: Some(function.arguments.unwrap_or_else(ToolArguments::empty)),
        }),
    })
}

/// Drops calls without a usable function name, fills missing ids with
/// `call_<index>` (index into the input list) and missing arguments with `{}`.
pub fn normalize_tool_calls(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .enumerate()
        .filter_map(|(i, call)| normalize_tool_call(call, i))
        .collect()
}

pub fn normalize_chat_response(response: ChatResponse) -> NormalizedChatResponse {
    NormalizedChatResponse {
        text: response.text.unwrap_or_default(),
        model: response.model,
        provider: response.provider,
        usage: response.usage,
        tool_calls: normalize_tool_calls(response.tool_calls.unwrap_or_default()),
        stream: response.stream,
    }
}

/// Normalizing an already normalized response changes nothing.
pub fn renormalize(response: NormalizedChatResponse) -> NormalizedChatResponse {
    normalize_chat_response(response.into())
}

impl From<NormalizedChatResponse> for ChatResponse {
    fn from(r: NormalizedChatResponse) -> Self {
        ChatResponse {
            text: Some(r.text),
            model: r.model,
            provider: r.provider,
            usage: r.usage,
            tool_calls: Some(r.tool_calls),
            stream: r.stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Usage;
    use serde_json::json;

    fn raw_call(id: Option<&str>, name: Option<&str>, args: Option<ToolArguments>) -> ToolCall {
        ToolCall {
            id: id.map(str::to_string),
            call_type: "function".to_string(),
            function: name.map(|n| FunctionCall {
                name: n.to_string(),
                arguments: args,
            }),
        }
    }

    fn sample() -> ChatResponse {
        ChatResponse {
            text: None,
            model: "m".to_string(),
            provider: "openai".to_string(),
            usage: Some(Usage::new(1, 2)),
            tool_calls: Some(vec![
                raw_call(None, Some("list_notes"), None),
                raw_call(Some("x"), Some("   "), None),
                raw_call(Some("y"), None, None),
                raw_call(
                    None,
                    Some(" read_note "),
                    Some(ToolArguments::Raw("{\"id\":\"1\"}".to_string())),
                ),
            ]),
            stream: None,
        }
    }

    #[test]
    fn test_text_defaults_to_empty() {
        let normalized = normalize_chat_response(ChatResponse::default());
        assert_eq!(normalized.text, "");
        assert!(normalized.tool_calls.is_empty());
    }

    #[test]
    fn test_invalid_calls_dropped_and_ids_positional() {
        let normalized = normalize_chat_response(sample());
        assert_eq!(normalized.tool_calls.len(), 2);
        assert_eq!(normalized.tool_calls[0].id(), "call_0");
        assert_eq!(normalized.tool_calls[0].name(), "list_notes");
        assert_eq!(
            normalized.tool_calls[0].arguments(),
            Some(&ToolArguments::empty())
        );
        assert_eq!(normalized.tool_calls[1].id(), "call_3");
        assert_eq!(normalized.tool_calls[1].name(), "read_note");
    }

    #[test]
    fn test_ids_assigned_in_input_order() {
        let response = ChatResponse {
            tool_calls: Some(vec![
                raw_call(None, Some("a"), None),
                raw_call(None, Some("b"), None),
                raw_call(None, Some("c"), None),
            ]),
            ..Default::default()
        };
        let ids: Vec<String> = normalize_chat_response(response)
            .tool_calls
            .iter()
            .map(|c| c.id().to_string())
            .collect();
        assert_eq!(ids, vec!["call_0", "call_1", "call_2"]);
    }

    #[test]
    fn test_existing_ids_and_structured_args_kept() {
        let args = ToolArguments::from_value(json!({"query": "rust"}));
        let response = ChatResponse {
            tool_calls: Some(vec![raw_call(Some("t1"), Some("search_notes"), Some(args.clone()))]),
            ..Default::default()
        };
        let normalized = normalize_chat_response(response);
        assert_eq!(normalized.tool_calls[0].id(), "t1");
        assert_eq!(normalized.tool_calls[0].arguments(), Some(&args));
    }

    #[test]
    fn test_idempotent() {
        let once = normalize_chat_response(sample());
        let twice = renormalize(normalize_chat_response(sample()));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_every_normalized_call_has_name() {
        let normalized = normalize_chat_response(sample());
        assert!(normalized
            .tool_calls
            .iter()
            .all(|c| !c.name().trim().is_empty() && c.id.is_some()));
    }
}
