use super::PipelineStage;
use crate::error::StageError;
use crate::llm::Message;
use std::sync::Arc;
use tracing::debug;

/// Source of background context for a query, such as a note index.
pub trait ContextExtractor: Send + Sync {
    fn extract(&self, query: &str, messages: &[Message]) -> Result<Option<String>, StageError>;
}

pub struct ContextExtractionInput {
    pub query: String,
    pub messages: Vec<Message>,
}

pub struct ContextExtractionStage {
    extractor: Arc<dyn ContextExtractor>,
}

impl ContextExtractionStage {
    pub fn new(extractor: Arc<dyn ContextExtractor>) -> Self {
        Self { extractor }
    }
}

impl PipelineStage for ContextExtractionStage {
    type Input = ContextExtractionInput;
    type Output = Option<String>;

    fn name(&self) -> &'static str {
        "context_extraction"
    }

    fn process(&self, input: ContextExtractionInput) -> Result<Option<String>, StageError> {
        let context = self
            .extractor
            .extract(&input.query, &input.messages)?
            .filter(|c| !c.trim().is_empty());
        debug!(
            chars = context.as_ref().map_or(0, String::len),
            "extracted context"
        );
        Ok(context)
    }
}
