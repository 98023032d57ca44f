//! Configuration loading and validation for toolbridge.
//!
//! Settings come from three layers, lowest priority first:
//! 1. built-in defaults
//! 2. an optional TOML file (`toolbridge.toml` in the working directory)
//! 3. environment variables, after loading a local `.env` if present
//!
//! Everything here is per-deployment. Requests can only override
//! `simulate`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default config file name, resolved against the working directory.
pub const CONFIG_FILE_NAME: &str = "toolbridge.toml";

/// The root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Upstream model settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Tool registry (MCP server) settings
    #[serde(default)]
    pub mcp: McpConfig,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// HTTP gateway settings
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    #[serde(default)]
    pub thinking_enabled: bool,

    #[serde(default = "default_thinking_budget")]
    pub thinking_budget_tokens: u32,

    /// Per-request timeout for the upstream HTTP call
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_max_output_tokens() -> u32 {
    1024
}
fn default_thinking_budget() -> u32 {
    1024
}
fn default_provider_timeout() -> u64 {
    300
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            temperature: 0.0,
            max_output_tokens: default_max_output_tokens(),
            thinking_enabled: false,
            thinking_budget_tokens: default_thinking_budget(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("thinking_enabled", &self.thinking_enabled)
            .field("thinking_budget_tokens", &self.thinking_budget_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Streamable-HTTP endpoint of the MCP server. No server means no tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,

    /// Client name announced during the MCP handshake
    #[serde(default = "default_client_name")]
    pub client_name: String,

    #[serde(default = "default_mcp_timeout")]
    pub timeout_secs: u64,
}

fn default_client_name() -> String {
    "mcp-agent-base".into()
}
fn default_mcp_timeout() -> u64 {
    30
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            client_name: default_client_name(),
            timeout_secs: default_mcp_timeout(),
        }
    }
}

/// What to do when tool discovery fails at the start of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryPolicy {
    /// Proceed without offering tools to the model.
    #[default]
    Degrade,
    /// Fail the request.
    Abort,
}

impl std::str::FromStr for DiscoveryPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "degrade" => Ok(Self::Degrade),
            "abort" => Ok(Self::Abort),
            other => Err(ConfigError::ValidationError(format!(
                "discovery_failure must be \"degrade\" or \"abort\", got \"{other}\""
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Inline system prompt; takes precedence over `system_prompt_file`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Prompt file, relative to the working directory
    #[serde(default = "default_system_prompt_file")]
    pub system_prompt_file: PathBuf,

    /// Maximum number of tool phases per request
    #[serde(default = "default_turn_budget")]
    pub turn_budget: u32,

    /// Surface tool input/output to the client as content
    #[serde(default = "default_true")]
    pub include_tool_logs: bool,

    /// Return a canned reply without calling the model or the registry
    #[serde(default)]
    pub simulate: bool,

    #[serde(default)]
    pub discovery_failure: DiscoveryPolicy,
}

fn default_system_prompt_file() -> PathBuf {
    PathBuf::from("prompts").join("system_prompt.txt")
}
fn default_turn_budget() -> u32 {
    10
}
fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            system_prompt_file: default_system_prompt_file(),
            turn_budget: default_turn_budget(),
            include_tool_logs: true,
            simulate: false,
            discovery_failure: DiscoveryPolicy::Degrade,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Capacity of the per-request event channel between loop and client
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    5000
}
fn default_event_buffer() -> usize {
    32
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl AppConfig {
    /// Load the deployment configuration.
    ///
    /// Reads `path` (or `toolbridge.toml` in the working directory), then a
    /// local `.env`, then applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

        if let Ok(env_file) = dotenv::dotenv() {
            tracing::debug!("Loaded environment from {}", env_file.display());
        }

        Self::load_layered(&path, |key| std::env::var(key).ok())
    }

    /// Read the file at `path`, apply overrides from `lookup`, then validate
    /// the merged result.
    pub fn load_layered<F>(path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// Only the file layer is read; validation waits until the environment
    /// has been applied in [`load`](Self::load).
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = var("ANTHROPIC_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = var("ANTHROPIC_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Some(model) = var("DEFAULT_MODEL") {
            self.provider.model = model;
        }
        if let Some(raw) = var("DEFAULT_TEMPERATURE") {
            self.provider.temperature = parse_number("DEFAULT_TEMPERATURE", &raw)?;
        }
        if let Some(raw) = var("DEFAULT_MAX_OUTPUT_TOKENS") {
            self.provider.max_output_tokens = parse_number("DEFAULT_MAX_OUTPUT_TOKENS", &raw)?;
        }
        if let Some(raw) = var("THINKING_ENABLED") {
            self.provider.thinking_enabled = parse_flag(&raw);
        }
        if let Some(raw) = var("THINKING_BUDGET_TOKENS") {
            self.provider.thinking_budget_tokens = parse_number("THINKING_BUDGET_TOKENS", &raw)?;
        }

        if let Some(url) = var("MCP_SERVER_URL") {
            self.mcp.server_url = Some(url);
        }
        if let Some(name) = var("CLIENT_NAME") {
            self.mcp.client_name = name;
        }

        if let Some(raw) = var("INCLUDE_TOOL_LOGS") {
            self.agent.include_tool_logs = parse_flag(&raw);
        }
        if let Some(raw) = var("SIMULATE") {
            self.agent.simulate = parse_flag(&raw);
        }
        if let Some(raw) = var("TURN_BUDGET") {
            self.agent.turn_budget = parse_number("TURN_BUDGET", &raw)?;
        }
        if let Some(raw) = var("DISCOVERY_FAILURE") {
            self.agent.discovery_failure = raw.parse()?;
        }

        if let Some(raw) = var("PORT") {
            self.gateway.port = parse_number("PORT", &raw)?;
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.provider.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 1.0".into(),
            ));
        }

        if self.provider.max_output_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "max_output_tokens must be > 0".into(),
            ));
        }

        if self.provider.thinking_enabled
            && self.provider.thinking_budget_tokens >= self.provider.max_output_tokens
        {
            return Err(ConfigError::ValidationError(
                "thinking_budget_tokens must be below max_output_tokens".into(),
            ));
        }

        if self.agent.turn_budget == 0 {
            return Err(ConfigError::ValidationError(
                "turn_budget must be at least 1".into(),
            ));
        }

        if self.gateway.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "event_buffer must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an upstream API key is available.
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Resolve the system prompt against `base_dir`.
    ///
    /// Returns `None` when neither an inline prompt nor a readable,
    /// non-empty prompt file is available.
    pub fn system_prompt(&self, base_dir: &Path) -> Option<String> {
        if let Some(prompt) = &self.agent.system_prompt {
            let prompt = prompt.trim();
            return (!prompt.is_empty()).then(|| prompt.to_string());
        }

        let path = base_dir.join(&self.agent.system_prompt_file);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let content = content.trim();
                (!content.is_empty()).then(|| content.to_string())
            }
            Err(e) => {
                tracing::debug!("No system prompt at {}: {e}", path.display());
                None
            }
        }
    }
}

/// `1`, `true`, `yes` and `on` (any case) are truthy; anything else is false.
pub fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::ValidationError(format!("{key}={raw:?} is invalid: {e}")))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
