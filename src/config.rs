use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AiConfig {
    /// Global switch. When false no provider reports itself available.
    pub enabled: bool,
    pub selected_provider: String,
    /// Used whenever a request's temperature falls outside (0, 1].
    pub temperature: f32,
    /// HTTP timeout for provider calls, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            selected_provider: "ollama".to_string(),
            temperature: 0.7,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub enable_streaming: bool,
    pub enable_metrics: bool,
    pub max_tool_iterations: usize,
    pub show_thinking: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_streaming: true,
            enable_metrics: true,
            max_tool_iterations: 5,
            show_thinking: false,
        }
    }
}

/// Credentials and endpoint for one provider.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl ProviderSettings {
    /// The API key, if set to something other than whitespace.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }

    pub fn base_url_or(&self, default: &str) -> String {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: ProviderSettings,
    #[serde(default)]
    pub anthropic: ProviderSettings,
    #[serde(default)]
    pub minimax: ProviderSettings,
    #[serde(default = "default_ollama_settings")]
    pub ollama: ProviderSettings,
}

fn default_ollama_settings() -> ProviderSettings {
    ProviderSettings {
        api_key: None,
        base_url: Some("http://localhost:11434".to_string()),
        default_model: None,
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai: ProviderSettings::default(),
            anthropic: ProviderSettings::default(),
            minimax: ProviderSettings::default(),
            ollama: default_ollama_settings(),
        }
    }
}

impl Config {
    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".chatloom").join("config.toml"))
    }

    /// Load config from ~/.chatloom/config.toml, falling back to defaults.
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read config, using defaults");
                Self::default()
            }
        }
    }

    /// Settings for a provider by name (case-insensitive). Unknown names get
    /// empty settings.
    pub fn provider_settings(&self, name: &str) -> ProviderSettings {
        match name.to_ascii_lowercase().as_str() {
            "openai" => self.providers.openai.clone(),
            "anthropic" => self.providers.anthropic.clone(),
            "minimax" => self.providers.minimax.clone(),
            "ollama" => self.providers.ollama.clone(),
            _ => ProviderSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();
        assert!(config.ai.enabled);
        assert_eq!(config.ai.selected_provider, "ollama");
        assert!((config.ai.temperature - 0.7).abs() < f32::EPSILON);
        assert!(config.pipeline.enable_streaming);
        assert_eq!(config.pipeline.max_tool_iterations, 5);
        assert!(!config.pipeline.show_thinking);
        assert_eq!(
            config.providers.ollama.base_url.as_deref(),
            Some("http://localhost:11434")
        );
        assert!(config.providers.openai.api_key.is_none());
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let mut config = Config::default();
        config.providers.anthropic.api_key = Some("sk-ant".to_string());
        let toml_str = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml_str).unwrap();

        assert_eq!(parsed.ai.selected_provider, config.ai.selected_provider);
        assert_eq!(
            parsed.pipeline.max_tool_iterations,
            config.pipeline.max_tool_iterations
        );
        assert_eq!(parsed.providers.anthropic, config.providers.anthropic);
        assert_eq!(parsed.providers.ollama, config.providers.ollama);
    }

    #[test]
    fn test_config_parse_custom_values() {
        let toml_str = r#"
[ai]
enabled = true
selected_provider = "minimax"
temperature = 0.3

[pipeline]
enable_streaming = false
enable_metrics = false
max_tool_iterations = 3
show_thinking = true

[providers.minimax]
api_key = "mm-key"
default_model = "MiniMax-M2.1"
"#;
        let config = Config::from_toml(toml_str).unwrap();
        assert_eq!(config.ai.selected_provider, "minimax");
        assert_eq!(config.ai.timeout_secs, 300);
        assert!(!config.pipeline.enable_streaming);
        assert_eq!(config.pipeline.max_tool_iterations, 3);
        assert_eq!(config.providers.minimax.api_key(), Some("mm-key"));
        // Sections left out keep their defaults.
        assert_eq!(
            config.providers.ollama.base_url.as_deref(),
            Some("http://localhost:11434")
        );
    }

    #[test]
    fn test_config_parse_invalid_toml() {
        let result = Config::from_toml("this is not valid toml {{{");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_parse_missing_sections_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.ai.selected_provider, "ollama");
        assert!(config.pipeline.enable_metrics);
    }

    #[test]
    fn test_config_parse_partial_section() {
        let config = Config::from_toml("[ai]\nenabled = false\n").unwrap();
        assert!(!config.ai.enabled);
        assert_eq!(config.ai.selected_provider, "ollama");
        assert!((config.ai.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_config_parse_wrong_type() {
        let toml_str = r#"
[pipeline]
enable_streaming = true
enable_metrics = true
max_tool_iterations = "not a number"
show_thinking = false
"#;
        assert!(Config::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_provider_settings_blank_values() {
        let settings = ProviderSettings {
            api_key: Some("   ".to_string()),
            base_url: Some("https://api.example.com/v1/".to_string()),
            default_model: Some(" ".to_string()),
        };
        assert_eq!(settings.api_key(), None);
        assert_eq!(
            settings.base_url_or("https://fallback"),
            "https://api.example.com/v1"
        );
        assert_eq!(settings.default_model(), None);
        assert_eq!(
            ProviderSettings::default().base_url_or("https://fallback/"),
            "https://fallback"
        );
    }

    #[test]
    fn test_provider_settings_lookup() {
        let mut config = Config::default();
        config.providers.openai.api_key = Some("sk".to_string());
        assert_eq!(config.provider_settings("OpenAI").api_key(), Some("sk"));
        assert_eq!(config.provider_settings("unknown"), ProviderSettings::default());
    }

    #[test]
    fn test_load_from_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml"));
        assert_eq!(config.ai.selected_provider, "ollama");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ai]\nenabled = false\nselected_provider = \"openai\"\ntemperature = 0.5\n")
            .unwrap();
        let config = Config::load_from(&path);
        assert!(!config.ai.enabled);
        assert_eq!(config.ai.selected_provider, "openai");
    }

    #[test]
    fn test_load_from_invalid_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not [valid").unwrap();
        let config = Config::load_from(&path);
        assert!(config.ai.enabled);
    }
}
