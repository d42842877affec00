use std::env;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::records::Rating;

pub const DEFAULT_API_BASE: &str = "https://safebooru.org/index.php";
pub const DEFAULT_TAGS: &str = "anime cute";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub safebooru: SafebooruConfig,
    pub response: ResponseConfig,
    pub bot: BotConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafebooruConfig {
    pub api_base: String,
    pub default_tags: String,
    pub max_results: u32,
    pub rating: Rating,
    pub timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for SafebooruConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            default_tags: DEFAULT_TAGS.to_string(),
            max_results: 3,
            rating: Rating::Safe,
            timeout_secs: 60,
            download_timeout_secs: 60,
        }
    }
}

impl SafebooruConfig {
    /// Results requested per search; a handful more than will ever be shown so
    /// the random pick has something to choose from.
    pub fn search_limit(&self) -> u32 {
        self.max_results.saturating_mul(3).max(10)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StylerMode {
    #[default]
    Passthrough,
    Rewrite,
}

impl FromStr for StylerMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "passthrough" | "plain" => Ok(StylerMode::Passthrough),
            "rewrite" | "personality" => Ok(StylerMode::Rewrite),
            other => bail!("unknown styler '{other}' (expected passthrough or rewrite)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    pub show_tags: bool,
    pub personality_style: String,
    pub enable_natural_search: bool,
    pub styler: StylerMode,
    pub rewrite_model: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            show_tags: false,
            personality_style: "cute".to_string(),
            enable_natural_search: true,
            styler: StylerMode::Passthrough,
            rewrite_model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub nickname: Option<String>,
    pub active_window_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            nickname: None,
            active_window_secs: 60,
        }
    }
}

impl PluginConfig {
    /// Reads the optional JSON file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid config JSON in {}", path.display()))
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = non_empty_env("SAFEBOORU_API_BASE") {
            self.safebooru.api_base = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = non_empty_env("SAFEBOORU_DEFAULT_TAGS") {
            self.safebooru.default_tags = value;
        }
        if let Some(value) = non_empty_env("SAFEBOORU_RATING") {
            self.safebooru.rating = value.parse()?;
        }
        if let Some(value) = non_empty_env("SAFEBOORU_TIMEOUT") {
            self.safebooru.timeout_secs = value
                .parse()
                .with_context(|| format!("SAFEBOORU_TIMEOUT must be whole seconds, got '{value}'"))?;
        }
        if let Some(value) = non_empty_env("SAFEBOORU_STYLER") {
            self.response.styler = value.parse()?;
        }
        if let Some(value) = non_empty_env("SAFEBOORU_BOT_NICKNAME") {
            self.bot.nickname = Some(value);
        }
        Ok(())
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::records::Rating;

    use super::{PluginConfig, StylerMode, DEFAULT_API_BASE};

    #[test]
    fn defaults_match_plugin_schema() {
        let config = PluginConfig::default();
        assert_eq!(config.safebooru.api_base, DEFAULT_API_BASE);
        assert_eq!(config.safebooru.default_tags, "anime cute");
        assert_eq!(config.safebooru.max_results, 3);
        assert_eq!(config.safebooru.rating, Rating::Safe);
        assert_eq!(config.safebooru.timeout_secs, 60);
        assert_eq!(config.response.personality_style, "cute");
        assert!(config.response.enable_natural_search);
        assert!(!config.response.show_tags);
        assert_eq!(config.bot.active_window_secs, 60);
    }

    #[test]
    fn search_limit_has_a_floor_of_ten() {
        let mut config = PluginConfig::default();
        assert_eq!(config.safebooru.search_limit(), 10);
        config.safebooru.max_results = 5;
        assert_eq!(config.safebooru.search_limit(), 15);
        config.safebooru.max_results = 0;
        assert_eq!(config.safebooru.search_limit(), 10);
    }

    #[test]
    fn partial_file_keeps_other_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        fs::write(
            &path,
            r#"{"safebooru": {"rating": "questionable", "max_results": 4},
                "response": {"styler": "rewrite"}}"#,
        )?;
        let config = PluginConfig::from_file(&path)?;
        assert_eq!(config.safebooru.rating, Rating::Questionable);
        assert_eq!(config.safebooru.max_results, 4);
        assert_eq!(config.safebooru.default_tags, "anime cute");
        assert_eq!(config.response.styler, StylerMode::Rewrite);
        assert_eq!(config.bot.nickname, None);
        Ok(())
    }

    #[test]
    fn invalid_file_reports_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("broken.json");
        fs::write(&path, "{not json")?;
        let err = PluginConfig::from_file(&path)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("broken.json"), "unexpected error: {err}");
        Ok(())
    }

    #[test]
    fn styler_mode_accepts_aliases() -> anyhow::Result<()> {
        assert_eq!("Personality".parse::<StylerMode>()?, StylerMode::Rewrite);
        assert_eq!("plain".parse::<StylerMode>()?, StylerMode::Passthrough);
        assert!("loud".parse::<StylerMode>().is_err());
        Ok(())
    }
}
