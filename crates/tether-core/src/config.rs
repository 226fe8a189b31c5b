use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (tether.toml + TETHER_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TetherConfig {
    pub api: ApiConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Keep-alive ping cadence. The server-side cache segment lives 5
    /// minutes, so the refresh must land inside that window.
    #[serde(default = "default_keep_alive_minutes")]
    pub keep_alive_minutes: u64,
    /// When false, no tool definitions are included in requests.
    #[serde(default = "bool_true")]
    pub tool_use_enabled: bool,
    /// Buffered tool_use entries older than this are discarded on flush.
    #[serde(default = "default_tool_pair_timeout_minutes")]
    pub tool_pair_timeout_minutes: u64,
    #[serde(default = "bool_true")]
    pub use_cache: bool,
    #[serde(default = "bool_true")]
    pub cache_tools: bool,
    #[serde(default = "bool_true")]
    pub cache_system: bool,
    #[serde(default = "bool_true")]
    pub cache_messages: bool,
    #[serde(default)]
    pub use_thinking: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            keep_alive_minutes: default_keep_alive_minutes(),
            tool_use_enabled: true,
            tool_pair_timeout_minutes: default_tool_pair_timeout_minutes(),
            use_cache: true,
            cache_tools: true,
            cache_system: true,
            cache_messages: true,
            use_thinking: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_keep_alive_minutes() -> u64 {
    4
}
fn default_tool_pair_timeout_minutes() -> u64 {
    5
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tether/tether.db", home)
}

impl TetherConfig {
    /// Load config from a TOML file with TETHER_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: TetherConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TETHER_").split("_"))
            .extract()
            .map_err(|e| crate::error::TetherError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Fatal-at-startup checks: a credential must be present.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.api.api_key.trim().is_empty() {
            return Err(crate::error::TetherError::Config(
                "api.api_key is required".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tether/tether.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_sections() {
        let config: TetherConfig = serde_json::from_value(serde_json::json!({
            "api": { "api_key": "sk-test" }
        }))
        .unwrap();
        assert_eq!(config.api.base_url, "https://api.anthropic.com");
        assert_eq!(config.chat.keep_alive_minutes, 4);
        assert_eq!(config.chat.tool_pair_timeout_minutes, 5);
        assert!(config.chat.tool_use_enabled);
        assert!(config.chat.use_cache);
        assert!(!config.chat.use_thinking);
    }

    #[test]
    fn empty_api_key_is_fatal() {
        let config: TetherConfig = serde_json::from_value(serde_json::json!({
            "api": { "api_key": "" }
        }))
        .unwrap();
        assert!(config.validate().is_err());
    }
}
