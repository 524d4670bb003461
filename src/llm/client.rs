//! Plumbing shared by every adapter: settings behind a lock, the cached HTTP
//! client, model and temperature resolution.

use super::ChatCompletionOptions;
use crate::config::ProviderSettings;
use crate::error::ProviderError;
use reqwest::blocking::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error};

/// Returns `requested` when it lies in (0, 1], otherwise `default`.
pub fn clamp_temperature(requested: Option<f32>, default: f32) -> f32 {
    match requested {
        Some(t) if t > 0.0 && t <= 1.0 => t,
        _ => default,
    }
}

#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub ai_enabled: bool,
    pub default_temperature: f32,
    pub timeout: Duration,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            ai_enabled: true,
            default_temperature: 0.7,
            timeout: Duration::from_secs(300),
        }
    }
}

impl AdapterOptions {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            ai_enabled: config.ai.enabled,
            default_temperature: config.ai.temperature,
            timeout: Duration::from_secs(config.ai.timeout_secs),
        }
    }
}

/// State every adapter owns. The HTTP client is built lazily and kept until
/// [`AdapterCore::clear_cache`] or a settings update.
#[derive(Debug)]
pub struct AdapterCore {
    provider: &'static str,
    options: AdapterOptions,
    settings: RwLock<ProviderSettings>,
    client: Mutex<Option<reqwest::blocking::Client>>,
}

impl AdapterCore {
    pub fn new(provider: &'static str, settings: ProviderSettings, options: AdapterOptions) -> Self {
        Self {
            provider,
            options,
            settings: RwLock::new(settings),
            client: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn ai_enabled(&self) -> bool {
        self.options.ai_enabled
    }

    pub fn settings(&self) -> ProviderSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_api_key(&self) -> bool {
        self.settings().api_key().is_some()
    }

    pub fn update_settings(&self, settings: ProviderSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
        self.clear_cache();
    }

    pub fn clear_cache(&self) {
        let mut client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        if client.take().is_some() {
            debug!(provider = self.provider, "cleared cached HTTP client");
        }
    }

    pub fn is_cached(&self) -> bool {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The cached client, building it on first use.
    pub fn client(&self) -> Result<reqwest::blocking::Client, ProviderError> {
        let mut cached = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = cached.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.options.timeout)
            .build()
            .map_err(|e| ProviderError::Request(format!("Failed to create HTTP client: {}", e)))?;
        debug!(provider = self.provider, "built HTTP client");
        *cached = Some(client.clone());
        Ok(client)
    }

    pub fn base_url(&self, default: &str) -> String {
        self.settings().base_url_or(default)
    }

    /// The request's model, else the configured default, else `fallback`.
    pub fn model(&self, options: &ChatCompletionOptions, fallback: &str) -> String {
        if let Some(model) = options.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            return model.to_string();
        }
        self.settings()
            .default_model()
            .unwrap_or(fallback)
            .to_string()
    }

    pub fn temperature(&self, options: &ChatCompletionOptions) -> f32 {
        clamp_temperature(options.temperature, self.options.default_temperature)
    }

    /// Fails with `Unavailable` before any I/O when the feature is disabled.
    pub fn ensure_enabled(&self) -> Result<(), ProviderError> {
        if self.options.ai_enabled {
            Ok(())
        } else {
            Err(ProviderError::unavailable(self.provider, "AI features are disabled"))
        }
    }

    pub fn require_api_key(&self) -> Result<String, ProviderError> {
        self.ensure_enabled()?;
        self.settings()
            .api_key()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::unavailable(self.provider, "API key is not configured"))
    }

    /// Sends a request and rejects non-success statuses. Failures are logged
    /// with the provider and model before being returned.
    pub fn send(
        &self,
        request: RequestBuilder,
        base_url: &str,
        model: &str,
    ) -> Result<Response, ProviderError> {
        let result = request
            .send()
            .map_err(|e| ProviderError::from_send(self.provider, base_url, e))
            .and_then(|response| {
                let status = response.status();
                if status.is_success() {
                    Ok(response)
                } else {
                    let body = response.text().unwrap_or_default();
                    Err(ProviderError::from_status(status, model, body))
                }
            });
        result.map_err(|err| self.log_failure(model, err))
    }

    pub fn read_json<T: DeserializeOwned>(
        &self,
        response: Response,
        model: &str,
    ) -> Result<T, ProviderError> {
        response.json::<T>().map_err(|e| {
            self.log_failure(
                model,
                ProviderError::Parse(format!("Failed to parse response: {}", e)),
            )
        })
    }

    pub fn log_failure(&self, model: &str, err: ProviderError) -> ProviderError {
        error!(provider = self.provider, model, error = %err, "chat completion failed");
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_core(settings: ProviderSettings) -> AdapterCore {
        AdapterCore::new("openai", settings, AdapterOptions::default())
    }

    #[test]
    fn test_clamp_temperature() {
        assert_eq!(clamp_temperature(Some(0.5), 0.7), 0.5);
        assert_eq!(clamp_temperature(Some(1.0), 0.7), 1.0);
        assert_eq!(clamp_temperature(Some(0.0), 0.7), 0.7);
        assert_eq!(clamp_temperature(Some(2.0), 0.7), 0.7);
        assert_eq!(clamp_temperature(Some(-0.1), 0.7), 0.7);
        assert_eq!(clamp_temperature(None, 0.7), 0.7);
        assert_eq!(clamp_temperature(Some(f32::NAN), 0.7), 0.7);
    }

    #[test]
    fn test_client_is_cached_until_cleared() {
        let core = make_core(ProviderSettings::default());
        assert!(!core.is_cached());
        core.client().unwrap();
        assert!(core.is_cached());
        core.clear_cache();
        assert!(!core.is_cached());
    }

    #[test]
    fn test_update_settings_clears_cache() {
        let core = make_core(ProviderSettings::default());
        core.client().unwrap();
        core.update_settings(ProviderSettings {
            api_key: Some("new-key".to_string()),
            ..Default::default()
        });
        assert!(!core.is_cached());
        assert_eq!(core.require_api_key().unwrap(), "new-key");
    }

    #[test]
    fn test_model_resolution_order() {
        let core = make_core(ProviderSettings {
            default_model: Some("configured".to_string()),
            ..Default::default()
        });
        let mut options = ChatCompletionOptions::default();
        assert_eq!(core.model(&options, "builtin"), "configured");
        options.model = Some("requested".to_string());
        assert_eq!(core.model(&options, "builtin"), "requested");

        let bare = make_core(ProviderSettings::default());
        assert_eq!(bare.model(&ChatCompletionOptions::default(), "builtin"), "builtin");
    }

    #[test]
    fn test_require_api_key() {
        let core = make_core(ProviderSettings {
            api_key: Some("  ".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            core.require_api_key(),
            Err(ProviderError::Unavailable { .. })
        ));
        assert!(!core.has_api_key());
    }

    #[test]
    fn test_disabled_feature_is_unavailable() {
        let core = AdapterCore::new(
            "anthropic",
            ProviderSettings {
                api_key: Some("key".to_string()),
                ..Default::default()
            },
            AdapterOptions {
                ai_enabled: false,
                ..Default::default()
            },
        );
        let err = core.require_api_key().unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }
}
