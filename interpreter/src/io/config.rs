//! Agent settings stored as TOML (by default `<config dir>/interpreter/settings.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::model_info::{self, ModelProfile};
use crate::core::types::RenderingMode;
use crate::io::runtime::RuntimeOptions;

/// Environment variable consulted when `key` is not set.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Interpreter agent settings (TOML).
///
/// Meant to be edited by hand. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Model id, also used to pick the model profile.
    pub model_name: String,

    /// Azure OpenAI endpoint. Requires `deployment`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Azure OpenAI deployment. Requires `endpoint`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,

    /// API key. Falls back to `OPENAI_API_KEY`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Run generated code without asking for confirmation.
    pub auto_execution: bool,

    /// Render failing run output to the user.
    pub display_errors: bool,

    /// Tokens reserved for the model's reply.
    pub max_response_tokens: u32,

    /// Overrides the profile's context window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_limit: Option<usize>,

    /// Overrides whether the model is driven through function calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_calling: Option<bool>,

    /// Upper bound on a single code run. Unset waits for the run to finish.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,

    /// Stop a task after this many model turns (0 = unlimited).
    pub max_turns: u32,

    /// Stream replies as they arrive.
    pub streaming: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_name: "gpt-4o".to_string(),
            endpoint: None,
            deployment: None,
            key: None,
            auto_execution: false,
            display_errors: true,
            max_response_tokens: 1000,
            token_limit: None,
            function_calling: None,
            run_timeout_secs: None,
            max_turns: 0,
            streaming: true,
        }
    }
}

/// Where chat requests are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    OpenAi,
    Azure { endpoint: String, deployment: String },
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(anyhow!("model_name must be non-empty"));
        }
        if self.max_response_tokens == 0 {
            return Err(anyhow!("max_response_tokens must be > 0"));
        }
        if self.run_timeout_secs == Some(0) {
            return Err(anyhow!("run_timeout_secs must be > 0 when set"));
        }
        if let Some(limit) = self.token_limit {
            if limit <= self.max_response_tokens as usize {
                return Err(anyhow!(
                    "token_limit ({limit}) must exceed max_response_tokens ({})",
                    self.max_response_tokens
                ));
            }
        }
        self.endpoint_kind()?;
        self.model_profile()?;
        Ok(())
    }

    /// Azure when both endpoint and deployment are set, OpenAI when neither.
    pub fn endpoint_kind(&self) -> Result<EndpointKind> {
        let endpoint = self.endpoint.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let deployment = self.deployment.as_deref().map(str::trim).filter(|s| !s.is_empty());
        match (endpoint, deployment) {
            (Some(endpoint), Some(deployment)) => Ok(EndpointKind::Azure {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                deployment: deployment.to_string(),
            }),
            (None, None) => Ok(EndpointKind::OpenAi),
            _ => bail!("endpoint and deployment must be set together (Azure) or both left unset (OpenAI)"),
        }
    }

    /// Profile of the configured model with overrides applied.
    pub fn model_profile(&self) -> Result<ModelProfile> {
        let mut profile = match (model_info::lookup(&self.model_name), self.token_limit) {
            (Some(profile), _) => profile,
            (None, Some(limit)) => model_info::custom(&self.model_name, limit),
            (None, None) => bail!(
                "unknown model '{}': set token_limit to use it",
                self.model_name
            ),
        };
        if let Some(limit) = self.token_limit {
            profile.token_limit = limit;
        }
        if let Some(function_calling) = self.function_calling {
            profile.function_calling = function_calling;
        }
        Ok(profile)
    }

    /// Configured key, or the value of [`API_KEY_ENV`].
    pub fn api_key(&self) -> Option<String> {
        self.key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|key| !key.trim().is_empty()))
    }

    pub fn rendering_mode(&self) -> RenderingMode {
        if self.streaming {
            RenderingMode::Streaming
        } else {
            RenderingMode::FullResponse
        }
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            search_path: None,
            run_timeout: self.run_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Default settings location under the user's config directory.
pub fn default_settings_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("resolve user config directory")?;
    Ok(base.join("interpreter").join("settings.toml"))
}

/// Load settings from a TOML file.
///
/// If the file is missing, returns `Settings::default()`.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        let settings = Settings::default();
        settings.validate()?;
        return Ok(settings);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(settings)
}

/// Atomically write settings to disk (temp file + rename).
pub fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    settings.validate()?;
    let mut buf = toml::to_string_pretty(settings).context("serialize settings toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("settings path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp settings {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace settings {}", path.display()))?;
    Ok(())
}
