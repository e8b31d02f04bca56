use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "wikimigrate/0.1";
pub const DEFAULT_SOURCE_API_URL: &str = "https://api.assembla.com/v1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrateConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub target: TargetSection,
    #[serde(default)]
    pub http: HttpSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourceSection {
    pub api_url: Option<String>,
    pub space: Option<String>,
    pub wiki_url: Option<String>,
    pub ticket_report: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TargetSection {
    pub base_url: Option<String>,
    pub space_key: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl MigrateConfig {
    /// Source API base URL: env ASSEMBLA_API_URL > config > DEFAULT_SOURCE_API_URL.
    pub fn source_api_url(&self) -> String {
        env_override("ASSEMBLA_API_URL")
            .or_else(|| self.source.api_url.clone())
            .unwrap_or_else(|| DEFAULT_SOURCE_API_URL.to_string())
    }

    /// Source space name: env ASSEMBLA_SPACE > config.
    pub fn source_space(&self) -> Option<String> {
        env_override("ASSEMBLA_SPACE").or_else(|| self.source.space.clone())
    }

    /// Base URL of the source wiki, used for provenance links: env ASSEMBLA_WIKI > config.
    pub fn wiki_url(&self) -> Option<String> {
        env_override("ASSEMBLA_WIKI")
            .or_else(|| self.source.wiki_url.clone())
            .map(|url| url.trim_end_matches('/').to_string())
    }

    /// Ticket report filter used when exporting tickets: env ASSEMBLA_TICKET_REPORT > config > 0.
    pub fn ticket_report(&self) -> u32 {
        env_override("ASSEMBLA_TICKET_REPORT")
            .and_then(|value| value.parse().ok())
            .or(self.source.ticket_report)
            .unwrap_or(0)
    }

    /// Target base URL: env CONFLUENCE_API > config.
    pub fn target_base_url(&self) -> Option<String> {
        env_override("CONFLUENCE_API")
            .or_else(|| self.target.base_url.clone())
            .map(|url| url.trim_end_matches('/').to_string())
    }

    /// Target space key: env CONFLUENCE_SPACE > config.
    pub fn target_space_key(&self) -> Option<String> {
        env_override("CONFLUENCE_SPACE").or_else(|| self.target.space_key.clone())
    }

    /// Target account email: env CONFLUENCE_EMAIL > config.
    pub fn target_email(&self) -> Option<String> {
        env_override("CONFLUENCE_EMAIL").or_else(|| self.target.email.clone())
    }

    /// Resolve user agent: env WIKIMIGRATE_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WIKIMIGRATE_USER_AGENT")
            .or_else(|| self.http.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Resolve HTTP timeout: env WIKIMIGRATE_HTTP_TIMEOUT_MS > config > DEFAULT_TIMEOUT_MS.
    pub fn timeout_ms(&self) -> u64 {
        env_override("WIKIMIGRATE_HTTP_TIMEOUT_MS")
            .and_then(|value| value.parse().ok())
            .or(self.http.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
    }
}

/// Credentials never live in config.toml.
pub fn secret(key: &str) -> Option<String> {
    env_override(key)
}

/// Load and parse a MigrateConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigrateConfig> {
    if !config_path.exists() {
        return Ok(MigrateConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrateConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
