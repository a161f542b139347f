//! Configuration loading, validation, and management for gemcord.
//!
//! Loads configuration from `~/.gemcord/config.toml` with environment
//! variable overrides. Validates all settings at startup; the result is
//! read-only for the lifetime of the process.

use gemcord_core::HarmBlockThreshold;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.gemcord/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Platform user ID allowed to run owner-only commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,

    /// Model API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model name
    #[serde(default = "default_model")]
    pub model: String,

    /// System prompt sent with every request
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Alternative system prompts the owner can switch a conversation to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_prompts: Vec<NamedPrompt>,

    /// Alternative models the owner can switch a conversation to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,

    /// Safety threshold applied to every harm category
    #[serde(default)]
    pub harm_block_threshold: HarmBlockThreshold,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub reply: ReplyConfig,

    #[serde(default)]
    pub discord: DiscordConfig,
}

fn default_model() -> String {
    "gemini-2.5-flash".into()
}
fn default_system_prompt() -> String {
    "You are a helpful assistant in a group chat. Messages are prefixed with the time, \
     the author's name and their ID. Answer concisely and use the available tools for \
     arithmetic and current information."
        .into()
}
fn default_temperature() -> f32 {
    1.0
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("owner_id", &self.owner_id)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("system_prompt", &self.system_prompt)
            .field("temperature", &self.temperature)
            .field("system_prompts", &self.system_prompts)
            .field("models", &self.models)
            .field("harm_block_threshold", &self.harm_block_threshold)
            .field("session", &self.session)
            .field("orchestrator", &self.orchestrator)
            .field("tools", &self.tools)
            .field("media", &self.media)
            .field("reply", &self.reply)
            .field("discord", &self.discord)
            .finish()
    }
}

impl std::fmt::Debug for ToolsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolsConfig")
            .field("timeout_secs", &self.timeout_secs)
            .field("wolfram_app_id", &redact(&self.wolfram_app_id))
            .field("search_max_results", &self.search_max_results)
            .field("memory_enabled", &self.memory_enabled)
            .field("memory_path", &self.memory_path)
            .finish()
    }
}

impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("bot_token", &redact(&self.bot_token))
            .field("allowed_users", &self.allowed_users)
            .finish()
    }
}

/// Conversation session store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum number of turns kept per conversation
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    /// Sessions idle longer than this are evicted
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How often the eviction sweep runs
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
}

fn default_max_turns() -> usize {
    40
}
fn default_idle_timeout_secs() -> u64 {
    3600
}
fn default_eviction_interval_secs() -> u64 {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            idle_timeout_secs: default_idle_timeout_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

/// Orchestrator loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Hard cap on model ⇄ tool round-trips per turn
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,

    /// Timeout for a single model request
    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,

    /// Delay before the single retry of a failed model request
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_tool_iterations() -> u32 {
    5
}
fn default_model_timeout_secs() -> u64 {
    120
}
fn default_retry_backoff_ms() -> u64 {
    1000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            model_timeout_secs: default_model_timeout_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Built-in tool settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default per-call timeout
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,

    /// Wolfram|Alpha app ID; without it symbolic math is evaluated locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wolfram_app_id: Option<String>,

    /// Default number of search results returned to the model
    #[serde(default = "default_search_max_results")]
    pub search_max_results: usize,

    /// Offer the `save_memory` tool and feed saved notes to new conversations
    #[serde(default = "default_true")]
    pub memory_enabled: bool,

    /// Where saved notes live; defaults to `~/.gemcord/memory.txt`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_path: Option<PathBuf>,
}

impl ToolsConfig {
    pub fn memory_path(&self) -> PathBuf {
        self.memory_path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("memory.txt"))
    }
}

/// A system prompt selectable by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPrompt {
    pub name: String,
    pub prompt: String,
}

fn default_tool_timeout_secs() -> u64 {
    30
}
fn default_search_max_results() -> usize {
    5
}
fn default_true() -> bool {
    true
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            wolfram_app_id: None,
            search_max_results: default_search_max_results(),
            memory_enabled: true,
            memory_path: None,
        }
    }
}

/// Media resolver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Largest single download accepted
    #[serde(default = "default_media_max_bytes")]
    pub max_bytes: u64,

    /// Timeout for one download (attachments and video streams)
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    #[serde(default = "default_yt_dlp_path")]
    pub yt_dlp_path: String,

    /// MIME types accepted in addition to the built-in set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_mime_types: Vec<String>,
}

fn default_media_max_bytes() -> u64 {
    20 * 1024 * 1024
}
fn default_download_timeout_secs() -> u64 {
    300
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".into()
}
fn default_yt_dlp_path() -> String {
    "yt-dlp".into()
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_media_max_bytes(),
            download_timeout_secs: default_download_timeout_secs(),
            ffmpeg_path: default_ffmpeg_path(),
            yt_dlp_path: default_yt_dlp_path(),
            extra_mime_types: vec![],
        }
    }
}

/// Reply chunking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    /// Platform maximum message length, in characters
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
}

fn default_max_message_length() -> usize {
    2000
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
        }
    }
}

/// Discord channel settings.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,

    /// Users allowed to talk to the bot; empty or `["*"]` allows everyone
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_users: Vec<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.gemcord/config.toml).
    ///
    /// Environment variables take precedence over the file:
    /// - `GEMCORD_API_KEY`, then `GEMINI_API_KEY` (when no key is configured)
    /// - `GEMCORD_MODEL`
    /// - `GEMCORD_OWNER_ID`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("GEMCORD_API_KEY")
                .ok()
                .or_else(|| std::env::var("GEMINI_API_KEY").ok());
        }

        if let Ok(model) = std::env::var("GEMCORD_MODEL") {
            self.model = model;
        }

        if let Ok(owner) = std::env::var("GEMCORD_OWNER_ID") {
            self.owner_id = Some(owner);
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".gemcord")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.orchestrator.max_tool_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.max_tool_iterations must be at least 1".into(),
            ));
        }

        if self.session.max_turns < 2 {
            return Err(ConfigError::ValidationError(
                "session.max_turns must be at least 2".into(),
            ));
        }

        if self.reply.max_message_length < 16 {
            return Err(ConfigError::ValidationError(
                "reply.max_message_length must be at least 16".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Whether `user_id` is the configured bot owner.
    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id.as_deref() == Some(user_id)
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            owner_id: None,
            api_key: None,
            model: default_model(),
            system_prompt: default_system_prompt(),
            temperature: default_temperature(),
            system_prompts: Vec::new(),
            models: Vec::new(),
            harm_block_threshold: HarmBlockThreshold::default(),
            session: SessionConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            tools: ToolsConfig::default(),
            media: MediaConfig::default(),
            reply: ReplyConfig::default(),
            discord: DiscordConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
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

impl From<ConfigError> for gemcord_core::Error {
    fn from(e: ConfigError) -> Self {
        gemcord_core::Error::Config {
            message: e.to_string(),
        }
    }
}
