use super::PipelineStage;
use crate::error::StageError;
use crate::llm::Usage;
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

type CachedRegex = OnceLock<Result<Regex, regex::Error>>;

static THINKING: CachedRegex = OnceLock::new();
static ASSISTANT_LABEL: CachedRegex = OnceLock::new();

fn cached(cell: &'static CachedRegex, pattern: &str) -> Result<&'static Regex, StageError> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| StageError::Processing(e.to_string()))
}

pub struct ResponseProcessingInput {
    pub text: String,
    pub show_thinking: bool,
    pub usage: Option<Usage>,
}

/// Cleans model text before it reaches the user. Also applied per stream chunk.
pub struct ResponseProcessingStage;

impl ResponseProcessingStage {
    /// Rewrites a `thinking:` section (up to `answer:` or the end) as a fenced
    /// block, keeping the answer that follows.
    fn format_thinking(text: &str) -> Result<String, StageError> {
        let re = cached(&THINKING, r"(?s)thinking:(.*?)(answer:|\z)")?;
        let Some(caps) = re.captures(text) else {
            return Ok(text.to_string());
        };
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            return Ok(text.to_string());
        };
        let end = caps.get(2).map_or(whole.end(), |answer| answer.start());
        Ok(format!(
            "{}**Thinking:** \n\n```\n{}\n```\n\n{}",
            &text[..whole.start()],
            body.as_str().trim(),
            &text[end..]
        ))
    }

    fn strip_assistant_label(text: &str) -> Result<String, StageError> {
        let re = cached(&ASSISTANT_LABEL, r"(?i)\A\s*assistant:\s*")?;
        Ok(re.replace(text, "").into_owned())
    }
}

impl PipelineStage for ResponseProcessingStage {
    type Input = ResponseProcessingInput;
    type Output = String;

    fn name(&self) -> &'static str {
        "response_processing"
    }

    fn process(&self, input: ResponseProcessingInput) -> Result<String, StageError> {
        let mut text = input.text;
        if input.show_thinking && text.contains("thinking:") {
            text = Self::format_thinking(&text)?;
        }
        let text = Self::strip_assistant_label(&text)?;

        if let Some(usage) = input.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "token usage"
            );
        }
        Ok(text)
    }
}
