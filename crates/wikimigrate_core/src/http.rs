use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, Response};

use crate::config::MigrateConfig;

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl HttpSettings {
    pub fn from_config(config: &MigrateConfig) -> Self {
        Self {
            user_agent: config.user_agent(),
            timeout_ms: config.timeout_ms(),
        }
    }

    pub fn build_client(&self, label: &str) -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_millis(self.timeout_ms))
            .user_agent(self.user_agent.clone())
            .build()
            .with_context(|| format!("failed to build {label} HTTP client"))
    }
}

/// Turn a non-2xx response into an error carrying the status and a short body excerpt.
pub fn ensure_success(response: Response, label: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    let excerpt = body.trim().chars().take(200).collect::<String>();
    if excerpt.is_empty() {
        bail!("{label} request failed with HTTP {status}");
    }
    bail!("{label} request failed with HTTP {status}: {excerpt}");
}
