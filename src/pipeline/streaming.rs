//! Decides where streaming happens for a request: at the client callback, at
//! the provider boundary, both or neither.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub supports_streaming_with_tools: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            supports_streaming_with_tools: true,
        }
    }
}

/// Providers with known streaming quirks. Anything not listed gets the default.
const PROVIDER_CAPABILITIES: &[(&str, ProviderCapabilities)] = &[
    (
        "openai",
        ProviderCapabilities {
            supports_streaming_with_tools: true,
        },
    ),
    (
        "anthropic",
        ProviderCapabilities {
            supports_streaming_with_tools: true,
        },
    ),
    (
        "ollama",
        ProviderCapabilities {
            supports_streaming_with_tools: true,
        },
    ),
    // Streamed tool-call deltas from MiniMax arrive incomplete.
    (
        "minimax",
        ProviderCapabilities {
            supports_streaming_with_tools: false,
        },
    ),
];

pub fn capabilities_for(provider: Option<&str>) -> ProviderCapabilities {
    let Some(provider) = provider.map(str::trim) else {
        return ProviderCapabilities::default();
    };
    PROVIDER_CAPABILITIES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(provider))
        .map(|(_, caps)| *caps)
        .unwrap_or_default()
}

/// Inputs to the streaming decision for one request.
#[derive(Debug, Clone, Default)]
pub struct StreamingContext {
    pub config_enable_streaming: bool,
    pub format: Option<String>,
    pub option_stream: Option<bool>,
    pub has_stream_callback: bool,
    pub provider_name: Option<String>,
    pub tools_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingDecision {
    /// The caller receives chunks through its callback.
    pub client_stream: bool,
    /// The provider request itself is made in streaming mode.
    pub provider_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpKind {
    Tool,
    Error,
    FinalText,
}

pub trait StreamingStrategy: Send + Sync {
    fn resolve_initial_streaming(&self, ctx: &StreamingContext) -> StreamingDecision;

    fn resolve_follow_up_streaming(&self, ctx: &StreamingContext, kind: FollowUpKind) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStreamingStrategy;

impl DefaultStreamingStrategy {
    fn client_stream(ctx: &StreamingContext) -> bool {
        if ctx.has_stream_callback || ctx.option_stream == Some(true) {
            return true;
        }
        if ctx.format.as_deref() == Some("stream") {
            return true;
        }
        if ctx.option_stream == Some(false) {
            return false;
        }
        ctx.config_enable_streaming
    }
}

impl StreamingStrategy for DefaultStreamingStrategy {
    fn resolve_initial_streaming(&self, ctx: &StreamingContext) -> StreamingDecision {
        let client_stream = Self::client_stream(ctx);
        let caps = capabilities_for(ctx.provider_name.as_deref());
        let provider_stream =
            client_stream && !(ctx.tools_enabled && !caps.supports_streaming_with_tools);

        debug!(
            client_stream,
            provider_stream,
            provider = ctx.provider_name.as_deref().unwrap_or("default"),
            tools_enabled = ctx.tools_enabled,
            "resolved streaming"
        );
        StreamingDecision {
            client_stream,
            provider_stream,
        }
    }

    fn resolve_follow_up_streaming(&self, _ctx: &StreamingContext, kind: FollowUpKind) -> bool {
        debug!(?kind, "follow-up requests are never streamed");
        false
    }
}
