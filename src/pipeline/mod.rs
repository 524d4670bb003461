//! The chat pipeline: model selection, optional context extraction, message
//! preparation, completion, the tool loop and response processing.

pub mod metrics;
pub mod stages;
pub mod streaming;
pub mod tool_loop;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::llm::registry::ProviderSet;
use crate::llm::stream::StreamCallback;
use crate::llm::{ChatCompletionOptions, Message, NormalizedChatResponse};
use crate::tools::ToolRegistry;
use metrics::{MetricsRecorder, PipelineMetrics};
use stages::{
    ContextExtractionInput, ContextExtractionStage, ContextExtractor, LlmCompletionStage,
    MessagePreparationInput, MessagePreparationStage, ModelSelectionInput, ModelSelectionStage,
    PipelineStage, ResponseProcessingInput, ResponseProcessingStage, ToolCallingStage,
};
use std::sync::Arc;
use std::time::Instant;
use streaming::{DefaultStreamingStrategy, StreamingContext, StreamingStrategy};
use tool_loop::{ToolLoop, ToolLoopInput};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct ChatPipelineInput {
    pub messages: Vec<Message>,
    /// The user's question, used for context lookup and tool fallbacks.
    pub query: Option<String>,
    pub options: ChatCompletionOptions,
    /// Request format hint; `"stream"` asks for a streamed reply.
    pub format: Option<String>,
    pub stream_callback: Option<StreamCallback>,
}

#[derive(Debug)]
pub struct PipelineOutput {
    pub response: NormalizedChatResponse,
    /// The conversation as the model last saw it, including tool results.
    pub messages: Vec<Message>,
    pub needs_follow_up: bool,
    pub iterations: usize,
    pub ceiling_reached: bool,
}

pub struct ChatPipeline {
    config: PipelineConfig,
    providers: Arc<ProviderSet>,
    tools: Arc<ToolRegistry>,
    strategy: Box<dyn StreamingStrategy>,
    model_selection: ModelSelectionStage,
    context_extraction: Option<ContextExtractionStage>,
    message_preparation: MessagePreparationStage,
    llm_completion: LlmCompletionStage,
    response_processing: ResponseProcessingStage,
    tool_calling: ToolCallingStage,
    metrics: MetricsRecorder,
}

impl ChatPipeline {
    pub fn new(config: PipelineConfig, providers: Arc<ProviderSet>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            model_selection: ModelSelectionStage::new(Arc::clone(&providers), Arc::clone(&tools)),
            context_extraction: None,
            message_preparation: MessagePreparationStage,
            llm_completion: LlmCompletionStage::new(Arc::clone(&providers), Arc::clone(&tools)),
            response_processing: ResponseProcessingStage,
            tool_calling: ToolCallingStage::new(Arc::clone(&tools)),
            metrics: MetricsRecorder::new(config.enable_metrics),
            strategy: Box::new(DefaultStreamingStrategy),
            config,
            providers,
            tools,
        }
    }

    pub fn with_streaming_strategy(mut self, strategy: Box<dyn StreamingStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_context_extractor(mut self, extractor: Arc<dyn ContextExtractor>) -> Self {
        self.context_extraction = Some(ContextExtractionStage::new(extractor));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn providers(&self) -> &Arc<ProviderSet> {
        &self.providers
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn execute(&self, input: ChatPipelineInput) -> Result<PipelineOutput, PipelineError> {
        let started = Instant::now();
        let ChatPipelineInput {
            messages,
            query,
            options,
            format,
            stream_callback,
        } = input;
        let stream_callback = stream_callback.or_else(|| options.stream_callback.clone());
        let content_length = messages.iter().map(|m| m.content.chars().count()).sum();

        let mut options = self.model_selection.execute(
            ModelSelectionInput {
                options,
                query: query.clone(),
                content_length,
            },
            &self.metrics,
        )?;
        options.show_thinking |= self.config.show_thinking;

        let context = match (&self.context_extraction, query.as_deref()) {
            (Some(stage), Some(q)) if options.use_advanced_context && !q.trim().is_empty() => stage
                .execute(
                    ContextExtractionInput {
                        query: q.to_string(),
                        messages: messages.clone(),
                    },
                    &self.metrics,
                )?,
            _ => None,
        };

        let messages = self.message_preparation.execute(
            MessagePreparationInput {
                messages,
                context,
                system_prompt: options.system_prompt.clone(),
                preserve_system_prompt: options.preserve_system_prompt,
            },
            &self.metrics,
        )?;

        let provider_name = self.llm_completion.resolve_provider_name(&options);
        let streaming_context = StreamingContext {
            config_enable_streaming: self.config.enable_streaming,
            format,
            option_stream: options.stream,
            has_stream_callback: stream_callback.is_some(),
            provider_name: provider_name.clone(),
            tools_enabled: options.tools_enabled(),
        };
        let decision = self.strategy.resolve_initial_streaming(&streaming_context);
        options.stream = Some(decision.client_stream);
        options.stream_callback = None;
        if decision.client_stream != decision.provider_stream {
            info!(
                provider = provider_name.as_deref().unwrap_or("default"),
                "provider streaming disabled for this request"
            );
        }

        let tool_loop = ToolLoop {
            llm_completion: &self.llm_completion,
            tool_calling: &self.tool_calling,
            response_processing: &self.response_processing,
            tools: &self.tools,
            strategy: self.strategy.as_ref(),
            metrics: &self.metrics,
        };
        let show_thinking = options.show_thinking;
        let max_iterations = options
            .max_tool_iterations
            .unwrap_or(self.config.max_tool_iterations);
        let iterations_spent = options.current_tool_iteration.unwrap_or(0);
        let mut outcome = tool_loop.run(ToolLoopInput {
            messages,
            query,
            options,
            provider_name,
            stream_callback: stream_callback.clone(),
            client_stream: decision.client_stream,
            provider_stream: decision.provider_stream,
            max_iterations,
            iterations_spent,
            streaming_context,
        })?;

        let text = std::mem::take(&mut outcome.response.text);
        let text = self.response_processing.execute(
            ResponseProcessingInput {
                text,
                show_thinking,
                usage: outcome.response.usage,
            },
            &self.metrics,
        )?;
        let text = match &outcome.ceiling_notice {
            Some(notice) => format!("{}{}", notice, text),
            None => text,
        };

        if let Some(cb) = stream_callback.as_ref().filter(|_| decision.client_stream) {
            tool_loop::finish_client_stream(cb, &outcome, &text);
        }
        outcome.response.text = text;

        let elapsed = started.elapsed();
        self.metrics.record_execution(elapsed);
        debug!(
            elapsed_ms = elapsed.as_millis() as u64,
            iterations = outcome.iterations,
            "pipeline finished"
        );

        Ok(PipelineOutput {
            response: outcome.response,
            messages: outcome.messages,
            needs_follow_up: outcome.needs_follow_up,
            iterations: outcome.iterations,
            ceiling_reached: outcome.ceiling_reached,
        })
    }
}
