use super::{ChatCompletionOptions, Message, Role};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant embedded in a note-taking application. \
Help the user with their notes, knowledge management and questions. \
When you refer to a note, say which note it is. \
Keep answers concise but complete.";

const SEARCH_PERSISTENCE: &str = "\
1. Try several search approaches before concluding the information is not available.
2. Run at least three searches with different parameters before giving up.
3. When a search returns nothing:
   - use broader terms (\"Kubernetes\" instead of \"Kubernetes deployment\")
   - use synonyms (\"meeting\" instead of \"conference\")
   - drop qualifiers (\"report\" instead of \"Q3 financial report\")
   - switch tools (search_notes for related content, keyword_search_notes for exact matches)
4. Never tell the user there are no notes about something until several variations failed.
5. Briefly explain how you are adjusting the search.
6. When searches fail, try another approach instead of asking the user what to do.";

/// Tool-usage addendum for a provider, appended when tools are enabled.
pub fn tool_instructions(provider: &str) -> Option<String> {
    match provider.to_ascii_lowercase().as_str() {
        "anthropic" => Some(format!(
            "<instructions>\nWhen using tools to search for information:\n\n{}\n</instructions>",
            SEARCH_PERSISTENCE
        )),
        "openai" => Some(format!(
            "When using tools to search for information, follow these rules:\n\n{}",
            SEARCH_PERSISTENCE
        )),
        "ollama" => Some(format!("TOOL USAGE RULES:\n{}", SEARCH_PERSISTENCE)),
        "minimax" => Some(format!(
            "You have tools for reading and searching the user's notes. \
When the question concerns the user's notes, call a tool before answering; do not guess.\n\n{}",
            SEARCH_PERSISTENCE
        )),
        _ => None,
    }
}

/// The system prompt an adapter sends: `custom` if given, else the default,
/// with the provider's tool addendum when tools are in play.
pub fn build_system_prompt(custom: Option<&str>, provider: &str, with_tools: bool) -> String {
    let base = custom
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);

    match tool_instructions(provider).filter(|_| with_tools) {
        Some(addendum) => format!("{}\n\n{}", base, addendum),
        None => base.to_string(),
    }
}

/// Resolves the prompt an adapter sends for a request. The conversation's own
/// system message wins over `options.system_prompt`; tools add the addendum.
pub fn system_prompt_for(
    messages: &[Message],
    options: &ChatCompletionOptions,
    provider: &str,
) -> String {
    let existing = messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .filter(|c| !c.trim().is_empty());
    let custom = existing.or(options.system_prompt.as_deref());
    let with_tools = options.tools_enabled() && !options.tools.is_empty();
    build_system_prompt(custom, provider, with_tools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolDefinition;
    use serde_json::json;

    #[test]
    fn test_default_prompt_used_without_custom() {
        let prompt = build_system_prompt(None, "openai", false);
        assert_eq!(prompt, DEFAULT_SYSTEM_PROMPT);

        let prompt = build_system_prompt(Some("   "), "openai", false);
        assert_eq!(prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_custom_prompt_wins() {
        let prompt = build_system_prompt(Some("Be terse."), "anthropic", false);
        assert_eq!(prompt, "Be terse.");
    }

    #[test]
    fn test_tool_addendum_appended_only_with_tools() {
        let with = build_system_prompt(Some("Base."), "minimax", true);
        assert!(with.starts_with("Base.\n\n"));
        assert!(with.contains("call a tool before answering"));

        let without = build_system_prompt(Some("Base."), "minimax", false);
        assert_eq!(without, "Base.");
    }

    #[test]
    fn test_unknown_provider_has_no_addendum() {
        assert!(tool_instructions("somevendor").is_none());
        assert_eq!(build_system_prompt(Some("x"), "somevendor", true), "x");
    }

    #[test]
    fn test_anthropic_addendum_is_tagged() {
        let addendum = tool_instructions("Anthropic").unwrap();
        assert!(addendum.starts_with("<instructions>"));
        assert!(addendum.ends_with("</instructions>"));
    }

    #[test]
    fn test_system_message_wins_over_option() {
        let messages = vec![Message::system("From conversation."), Message::user("hi")];
        let options = ChatCompletionOptions {
            system_prompt: Some("From options.".to_string()),
            ..Default::default()
        };
        assert_eq!(
            system_prompt_for(&messages, &options, "openai"),
            "From conversation."
        );
        assert_eq!(
            system_prompt_for(&[Message::user("hi")], &options, "openai"),
            "From options."
        );
    }

    #[test]
    fn test_addendum_requires_tool_definitions() {
        let mut options = ChatCompletionOptions::default();
        let plain = system_prompt_for(&[], &options, "ollama");
        assert_eq!(plain, DEFAULT_SYSTEM_PROMPT);

        options.tools = vec![ToolDefinition::new("t", "d", json!({"type": "object"}))];
        assert!(system_prompt_for(&[], &options, "ollama").contains("TOOL USAGE RULES"));

        options.enable_tools = Some(false);
        assert_eq!(system_prompt_for(&[], &options, "ollama"), DEFAULT_SYSTEM_PROMPT);
    }
}
