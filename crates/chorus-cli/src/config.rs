use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::warn;

use chorus_core::history::DEFAULT_HISTORY_LIMIT;
use chorus_core::{ProviderConfig, WireProtocol, DEFAULT_FALLBACK_MESSAGE};

const ENV_PREFIX: &str = "CHORUS_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Provider that synthesizes when more than one answer comes back
    #[serde(default)]
    pub preferred_master: Option<String>,

    /// Per-query timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Entries kept per user in the history file
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// History file path (supports ~). Defaults to ~/.config/chorus/history.jsonl
    #[serde(default)]
    pub history_file: Option<String>,

    /// Reply shown when no provider produced an answer
    #[serde(default)]
    pub fallback_message: Option<String>,

    /// Upstreams, in fan-out order
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

fn default_timeout_ms() -> u64 {
    chorus_core::DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub id: String,

    pub model: String,

    pub protocol: WireProtocol,

    /// Base URL override (e.g. an OpenAI-compatible gateway)
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// Whether a configured provider can be used.
#[derive(Debug, Clone)]
pub enum ProviderStatus {
    Enabled(ProviderConfig),
    Disabled { reason: String },
}

impl ProviderEntry {
    fn api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn resolve(&self) -> ProviderStatus {
        let Some(api_key) = self.api_key() else {
            let reason = match &self.api_key_env {
                Some(var) => format!("no API key (${} is unset)", var),
                None => "no API key".to_string(),
            };
            return ProviderStatus::Disabled { reason };
        };

        let mut config = ProviderConfig::new(&self.id, &self.model, api_key, self.protocol);
        if let Some(url) = &self.url {
            config = config.with_endpoint_url(url);
        }
        ProviderStatus::Enabled(config)
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

impl Config {
    /// Load from `path` (or the default location), with `CHORUS_*`
    /// environment variables layered on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            anyhow::bail!(
                "No configuration found at {}. Create it with at least:\n\n\
                 [[providers]]\n\
                 id = \"gemini\"\n\
                 model = \"gemini-2.5-flash\"\n\
                 protocol = \"gemini\"\n\
                 api_key_env = \"GEMINI_API_KEY\"\n",
                config_path.display()
            );
        }

        let config: Config = Figment::new()
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["providers"]))
            .extract()
            .with_context(|| format!("Failed to read config: {}", config_path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = Figment::new().merge(Toml::string(content)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("chorus"))
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            anyhow::bail!("timeout_ms must be greater than zero");
        }
        if self.history_limit == 0 {
            anyhow::bail!("history_limit must be greater than zero");
        }
        let mut seen = HashSet::new();
        for entry in &self.providers {
            if entry.id.trim().is_empty() {
                anyhow::bail!("provider with model '{}' has an empty id", entry.model);
            }
            if !seen.insert(entry.id.as_str()) {
                anyhow::bail!("provider id '{}' is configured more than once", entry.id);
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn fallback_message(&self) -> &str {
        self.fallback_message
            .as_deref()
            .unwrap_or(DEFAULT_FALLBACK_MESSAGE)
    }

    pub fn history_path(&self) -> Result<PathBuf> {
        match &self.history_file {
            Some(path) => Ok(expand_path(path)),
            None => Ok(Self::config_dir()?.join("history.jsonl")),
        }
    }

    /// Usable providers in file order. Disabled ones are logged and skipped.
    pub fn enabled_providers(&self) -> Vec<ProviderConfig> {
        self.providers
            .iter()
            .filter_map(|entry| match entry.resolve() {
                ProviderStatus::Enabled(config) => Some(config),
                ProviderStatus::Disabled { reason } => {
                    warn!(provider = %entry.id, reason = %reason, "Provider disabled");
                    None
                }
            })
            .collect()
    }

    /// The config as TOML with inline keys removed.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut redacted = self.clone();
        for entry in &mut redacted.providers {
            entry.api_key = None;
        }
        Ok(toml::to_string_pretty(&redacted)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
            preferred_master = "openai"
            timeout_ms = 30000

            [[providers]]
            id = "gemini"
            model = "gemini-2.5-flash"
            protocol = "gemini"
            api_key = "g-test"

            [[providers]]
            id = "openai"
            model = "gpt-4o-mini"
            protocol = "openai"
            api_key = "sk-test"
        "#;

        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.preferred_master.as_deref(), Some("openai"));
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(config.fallback_message(), DEFAULT_FALLBACK_MESSAGE);

        let ids: Vec<String> = config.enabled_providers().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["gemini", "openai"]);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.timeout_ms, 60_000);
        assert!(config.providers.is_empty());
        assert!(config.preferred_master.is_none());
    }

    #[test]
    fn test_compatible_provider_url() {
        let toml = r#"
            [[providers]]
            id = "deepseek"
            model = "deepseek-chat"
            protocol = "openai-compatible"
            url = "https://api.deepseek.com/v1"
            api_key = "ds"
        "#;

        let providers = Config::from_toml_str(toml).unwrap().enabled_providers();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].protocol, WireProtocol::OpenAi);
        assert_eq!(providers[0].endpoint_url, "https://api.deepseek.com/v1");
    }

    #[test]
    fn test_key_from_environment() {
        std::env::set_var("CHORUS_TEST_KEY_PRESENT", "from-env");
        let toml = r#"
            [[providers]]
            id = "with-env"
            model = "m"
            protocol = "gemini"
            api_key_env = "CHORUS_TEST_KEY_PRESENT"

            [[providers]]
            id = "without-key"
            model = "m"
            protocol = "openai"
            api_key_env = "CHORUS_TEST_KEY_DEFINITELY_UNSET"
        "#;

        let config = Config::from_toml_str(toml).unwrap();
        let providers = config.enabled_providers();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].id, "with-env");
        assert_eq!(providers[0].api_key, "from-env");

        match config.providers[1].resolve() {
            ProviderStatus::Disabled { reason } => {
                assert!(reason.contains("CHORUS_TEST_KEY_DEFINITELY_UNSET"))
            }
            ProviderStatus::Enabled(_) => panic!("provider without a key was enabled"),
        }
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let toml = r#"
            [[providers]]
            id = "a"
            model = "m"
            protocol = "gemini"

            [[providers]]
            id = "a"
            model = "n"
            protocol = "openai"
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_rejects_zero_timeout() {
        assert!(Config::from_toml_str("timeout_ms = 0").is_err());
    }

    #[test]
    fn test_redacted_toml_drops_keys() {
        let toml = r#"
            [[providers]]
            id = "openai"
            model = "gpt-4o"
            protocol = "openai"
            api_key = "sk-secret"
        "#;
        let rendered = Config::from_toml_str(toml).unwrap().to_redacted_toml().unwrap();
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("gpt-4o"));
    }

    #[test]
    fn test_expand_path() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/h.jsonl"), home.join("h.jsonl"));
        }
        assert_eq!(expand_path("/tmp/h.jsonl"), PathBuf::from("/tmp/h.jsonl"));
    }
}
