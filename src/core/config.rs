use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL_ENV: &str = "TANDEM_BASE_URL";
const API_KEY_ENV: &str = "TANDEM_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comparison_models: Vec<String>,
    #[serde(default)]
    pub tools_enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Config {
    pub fn load() -> Result<Config, Box<dyn std::error::Error>> {
        Self::load_from_path(&Self::config_path())
    }

    pub fn load_from_path(config_path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path).map_err(|e| {
                format!("Failed to read config at {}: {e}", config_path.display())
            })?;
            let config: Config = toml::from_str(&contents).map_err(|e| {
                format!("Failed to parse config at {}: {e}", config_path.display())
            })?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn config_path() -> PathBuf {
        let proj_dirs =
            ProjectDirs::from("org", "tandem", "tandem").expect("Failed to determine config directory");
        proj_dirs.config_dir().join("config.toml")
    }
}

/// The resolved backend endpoint for this run.
#[derive(Debug, Clone)]
pub struct BackendSession {
    pub base_url: String,
    pub api_key: String,
}

/// Resolve the backend endpoint: environment first, config fallback. The
/// API key is optional for local backends.
pub fn resolve_backend_session(config: &Config) -> Result<BackendSession, Box<dyn std::error::Error>> {
    let base_url = std::env::var(DEFAULT_BASE_URL_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| config.base_url.clone())
        .ok_or_else(|| {
            format!(
                "No backend configured. Set {DEFAULT_BASE_URL_ENV} or add base_url to {}",
                Config::config_path().display()
            )
        })?;

    let api_key = std::env::var(API_KEY_ENV).unwrap_or_default();

    Ok(BackendSession { base_url, api_key })
}
