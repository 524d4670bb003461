use super::PipelineStage;
use crate::error::StageError;
use crate::llm::prompt::DEFAULT_SYSTEM_PROMPT;
use crate::llm::{Message, Role};
use tracing::debug;

pub struct MessagePreparationInput {
    pub messages: Vec<Message>,
    pub context: Option<String>,
    pub system_prompt: Option<String>,
    pub preserve_system_prompt: bool,
}

/// Leaves exactly one system message, at the front.
pub struct MessagePreparationStage;

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

impl PipelineStage for MessagePreparationStage {
    type Input = MessagePreparationInput;
    type Output = Vec<Message>;

    fn name(&self) -> &'static str {
        "message_preparation"
    }

    fn process(&self, input: MessagePreparationInput) -> Result<Vec<Message>, StageError> {
        let existing = input
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone());
        let custom = non_blank(input.system_prompt.as_deref());
        let existing = non_blank(existing.as_deref());

        let base = if input.preserve_system_prompt {
            existing.or(custom)
        } else {
            custom.or(existing)
        }
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);

        let system = match non_blank(input.context.as_deref()) {
            Some(context) => format!(
                "{}\n\nUse the following context from the user's notes when it is relevant:\n\n{}",
                base, context
            ),
            None => base.to_string(),
        };

        let mut prepared = Vec::with_capacity(input.messages.len() + 1);
        prepared.push(Message::system(&system));
        prepared.extend(input.messages.into_iter().filter(|m| m.role != Role::System));

        debug!(messages = prepared.len(), "prepared messages");
        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare(
        messages: Vec<Message>,
        system_prompt: Option<&str>,
        preserve: bool,
        context: Option<&str>,
    ) -> Vec<Message> {
        MessagePreparationStage
            .process(MessagePreparationInput {
                messages,
                context: context.map(str::to_string),
                system_prompt: system_prompt.map(str::to_string),
                preserve_system_prompt: preserve,
            })
            .unwrap()
    }

    #[test]
    fn test_default_prompt_added() {
        let out = prepare(vec![Message::user("hi")], None, false, None);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::System);
        assert_eq!(out[0].content, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(out[1].content, "hi");
    }

    #[test]
    fn test_custom_prompt_replaces_existing() {
        let messages = vec![Message::system("old"), Message::user("hi"), Message::system("late")];
        let out = prepare(messages, Some("custom"), false, None);
        assert_eq!(out.iter().filter(|m| m.role == Role::System).count(), 1);
        assert_eq!(out[0].content, "custom");
    }

    #[test]
    fn test_preserve_keeps_existing() {
        let messages = vec![Message::user("hi"), Message::system("existing")];
        let out = prepare(messages, Some("custom"), true, None);
        assert_eq!(out[0].content, "existing");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_context_appended_to_system_message() {
        let out = prepare(vec![Message::user("q")], None, false, Some("Note A: ..."));
        assert!(out[0].content.starts_with(DEFAULT_SYSTEM_PROMPT));
        assert!(out[0].content.ends_with("Note A: ..."));
    }
}
