//! The individual steps of a chat request. Each stage is a plain value with
//! its dependencies injected; [`PipelineStage::execute`] adds logging, timing
//! and error tagging around the stage's own `process`.

pub mod context_extraction;
pub mod llm_completion;
pub mod message_preparation;
pub mod model_selection;
pub mod response_processing;
pub mod tool_calling;

use super::metrics::MetricsRecorder;
use crate::error::{PipelineError, StageError};
use std::time::Instant;
use tracing::debug;

pub use context_extraction::{ContextExtractionInput, ContextExtractionStage, ContextExtractor};
pub use llm_completion::{LlmCompletionInput, LlmCompletionStage};
pub use message_preparation::{MessagePreparationInput, MessagePreparationStage};
pub use model_selection::{ModelSelectionInput, ModelSelectionStage, QueryComplexity};
pub use response_processing::{ResponseProcessingInput, ResponseProcessingStage};
pub use tool_calling::{ToolCallingInput, ToolCallingOutput, ToolCallingStage};

pub trait PipelineStage {
    type Input;
    type Output;

    fn name(&self) -> &'static str;

    fn process(&self, input: Self::Input) -> Result<Self::Output, StageError>;

    fn execute(
        &self,
        input: Self::Input,
        metrics: &MetricsRecorder,
    ) -> Result<Self::Output, PipelineError> {
        let stage = self.name();
        debug!(stage, "stage started");
        let started = Instant::now();
        let result = self.process(input);
        let elapsed = started.elapsed();
        metrics.record_stage(stage, elapsed);

        match result {
            Ok(output) => {
                debug!(stage, elapsed_ms = elapsed.as_millis() as u64, "stage finished");
                Ok(output)
            }
            Err(e) => {
                debug!(stage, error = %e, "stage failed");
                Err(PipelineError::new(stage, e))
            }
        }
    }
}
