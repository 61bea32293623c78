use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Language-model provider settings.
    pub model: ModelConfig,
    /// Telegram transport settings. Optional so the daemon can start
    /// without a chat platform attached.
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    /// IANA timezone every alarm clock time is interpreted in. This is a
    /// single fixed zone for the whole deployment, not per user.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Google Calendar lookup settings. Optional; the calendar capability
    /// reports itself unconfigured when absent.
    #[serde(default)]
    pub calendar: Option<CalendarConfig>,
    /// Speech synthesis settings.
    #[serde(default)]
    pub speech: SpeechConfig,
    /// History trimming policy.
    #[serde(default)]
    pub history: HistoryConfig,
    /// Path to the system prompt file. Relative paths resolve against the
    /// chime home directory. Missing file falls back to a built-in prompt.
    #[serde(default)]
    pub system_prompt_path: Option<String>,
    /// Data directory override (jobs database + history files). Defaults
    /// to the chime home directory.
    #[serde(default)]
    pub data_dir: Option<String>,
}

fn default_timezone() -> String {
    "America/Los_Angeles".to_string()
}

/// Language-model provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Provider kind. Only `"openai"` is recognised.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model name to request (e.g. "gpt-4o-mini").
    #[serde(default = "default_model")]
    pub model: String,
    /// API key — plain value or `$ENV_VAR` reference.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Override for the chat-completions endpoint (proxies, tests).
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl ModelConfig {
    /// Resolve the configured API key, defaulting to `$OPENAI_API_KEY`.
    pub fn resolved_api_key(&self) -> String {
        resolve_secret(self.api_key.as_deref().unwrap_or("$OPENAI_API_KEY"))
    }
}

/// Telegram transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TelegramConfig {
    /// Bot token — plain value or `$ENV_VAR` reference.
    pub token: String,
    /// User ids allowed to talk to the bot. Empty means everyone.
    #[serde(default)]
    pub allowed_users: Vec<i64>,
}

/// Google Calendar lookup configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CalendarConfig {
    /// API key — plain value or `$ENV_VAR` reference.
    pub api_key: String,
    /// Calendar identifier to query.
    pub calendar_id: String,
}

/// Speech synthesis configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SpeechConfig {
    /// When true, every finalized assistant reply is also delivered as a
    /// voice message.
    #[serde(default)]
    pub tts: bool,
    /// Synthesis voice name.
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Synthesis model name.
    #[serde(default = "default_tts_model")]
    pub model: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            tts: false,
            voice: default_voice(),
            model: default_tts_model(),
        }
    }
}

fn default_voice() -> String {
    "alloy".to_string()
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

/// History trimming policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryConfig {
    /// When the model reports more total tokens than this, trimming kicks in.
    #[serde(default = "default_token_threshold")]
    pub token_threshold: u64,
    /// Fraction of the oldest history entries removed per trim. Must be
    /// strictly between 0 and 1.
    #[serde(default = "default_trim_fraction")]
    pub trim_fraction: f64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            token_threshold: default_token_threshold(),
            trim_fraction: default_trim_fraction(),
        }
    }
}

fn default_token_threshold() -> u64 {
    8000
}

fn default_trim_fraction() -> f64 {
    0.25
}

impl Config {
    /// Read and parse a YAML configuration file.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&contents).context("failed to parse config YAML")?;
        config.validate()?;

        tracing::debug!(
            timezone = %config.timezone,
            telegram = config.telegram.is_some(),
            calendar = config.calendar.is_some(),
            "configuration loaded"
        );

        Ok(config)
    }

    /// Validate semantic constraints that serde cannot enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.tz()?;

        if self.model.provider != "openai" {
            anyhow::bail!(
                "config: unknown model provider '{}' (only 'openai' is supported)",
                self.model.provider
            );
        }

        let f = self.history.trim_fraction;
        if !(f > 0.0 && f < 1.0) {
            anyhow::bail!("config: history.trim_fraction must be between 0 and 1, got {f}");
        }
        if self.history.token_threshold == 0 {
            anyhow::bail!("config: history.token_threshold must be positive");
        }

        Ok(())
    }

    /// Parse the configured timezone.
    pub fn tz(&self) -> anyhow::Result<chrono_tz::Tz> {
        self.timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("config: unknown timezone '{}'", self.timezone))
    }

    /// Resolve the data directory (jobs database + history files).
    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(d) => PathBuf::from(d),
            None => crate::chime_home(),
        }
    }

    /// Serialize and write the configuration back to a YAML file.
    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_yaml::to_string(self).context("serialize config YAML")?;
        tokio::fs::write(path, &contents)
            .await
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Resolve a secret-ish config value: `$NAME` reads the `NAME` environment
/// variable (empty string when unset), anything else is used verbatim.
pub fn resolve_secret(value: &str) -> String {
    if let Some(var) = value.strip_prefix('$') {
        std::env::var(var).unwrap_or_default()
    } else {
        value.to_string()
    }
}
