//! Process configuration for the Chromebot server.
//!
//! Configuration values can be constructed from defaults, loaded from
//! environment variables (with optional `.env` support), or adjusted with
//! builder-style helpers before the server starts. The defaults match the
//! reference deployment: a headful Chrome on port 8765 with at most five
//! concurrently open pages.

use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::{LaunchOptions, Viewport};

/// Default HTTP listen port.
pub const DEFAULT_PORT: u16 = 8765;

/// Default per-operation timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default ceiling on concurrently open pages.
pub const DEFAULT_MAX_CONCURRENT_PAGES: usize = 5;

/// Default discovery endpoint for attaching to an already-running Chrome.
pub const DEFAULT_ATTACH_ENDPOINT: &str = "http://localhost:9222";

/// Chrome flags passed on every fresh launch.
pub const DEFAULT_LAUNCH_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-blink-features=AutomationControlled",
    "--disable-extensions",
    "--disable-popup-blocking",
];

/// Verbosity level for Chromebot logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Minimal,
    Medium,
    Detailed,
}

impl Verbosity {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Verbosity::Minimal => 0,
            Verbosity::Medium => 1,
            Verbosity::Detailed => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Verbosity::Minimal),
            1 => Some(Verbosity::Medium),
            2 => Some(Verbosity::Detailed),
            _ => None,
        }
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Medium
    }
}

/// Settings for attaching to an externally-managed browser instead of
/// launching a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachConfig {
    pub enabled: bool,
    /// HTTP debug endpoint queried to discover a connectable WebSocket URL.
    pub endpoint: String,
}

impl Default for AttachConfig {
    fn default() -> Self {
        AttachConfig {
            enabled: false,
            endpoint: DEFAULT_ATTACH_ENDPOINT.to_string(),
        }
    }
}

/// Configuration values for the Chromebot server and browser session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromebotConfig {
    pub port: u16,
    pub headless: bool,
    pub viewport: Viewport,
    pub launch_args: Vec<String>,
    pub user_data_dir: Option<PathBuf>,
    pub chrome_executable: Option<PathBuf>,
    pub attach: AttachConfig,
    /// Default timeout applied to navigation and wait operations.
    pub timeout_ms: u64,
    pub max_concurrent_pages: usize,
    pub verbose: Verbosity,
}

impl Default for ChromebotConfig {
    fn default() -> Self {
        ChromebotConfig {
            port: DEFAULT_PORT,
            headless: false,
            viewport: Viewport::default(),
            launch_args: DEFAULT_LAUNCH_ARGS.iter().map(|s| s.to_string()).collect(),
            user_data_dir: None,
            chrome_executable: None,
            attach: AttachConfig::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_concurrent_pages: DEFAULT_MAX_CONCURRENT_PAGES,
            verbose: Verbosity::default(),
        }
    }
}

impl ChromebotConfig {
    /// Construct a configuration by reading `CHROMEBOT_*` environment
    /// variables, after loading a `.env` file if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv();
        let mut config = ChromebotConfig::default();

        if let Some(value) = env_var("CHROMEBOT_PORT") {
            config.port = parse_u16("CHROMEBOT_PORT", &value)?;
        }

        if let Some(value) = env_var("CHROMEBOT_HEADLESS") {
            config.headless = parse_bool("CHROMEBOT_HEADLESS", &value)?;
        }

        if let Some(value) = env_var("CHROMEBOT_VIEWPORT") {
            config.viewport = parse_viewport("CHROMEBOT_VIEWPORT", &value)?;
        }

        if let Some(value) = env_var("CHROMEBOT_LAUNCH_ARGS") {
            config.launch_args = value
                .split_whitespace()
                .map(|arg| arg.to_string())
                .collect();
        }

        if let Some(value) = env_var("CHROMEBOT_USER_DATA_DIR") {
            config.user_data_dir = Some(PathBuf::from(value));
        }

        if let Some(value) = env_var("CHROMEBOT_CHROME_BIN") {
            config.chrome_executable = Some(PathBuf::from(value));
        }

        if let Some(value) = env_var("CHROMEBOT_ATTACH") {
            config.attach.enabled = parse_bool("CHROMEBOT_ATTACH", &value)?;
        }

        if let Some(value) = env_var("CHROMEBOT_ATTACH_ENDPOINT") {
            config.attach.endpoint = value;
        }

        if let Some(value) = env_var("CHROMEBOT_TIMEOUT_MS") {
            config.timeout_ms = parse_u64("CHROMEBOT_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = env_var("CHROMEBOT_MAX_PAGES") {
            config.max_concurrent_pages = parse_u64("CHROMEBOT_MAX_PAGES", &value)? as usize;
        }

        if let Some(value) = env_var("CHROMEBOT_VERBOSE") {
            let parsed = parse_u8("CHROMEBOT_VERBOSE", &value)?;
            config.verbose =
                Verbosity::from_u8(parsed).ok_or_else(|| ConfigError::InvalidEnumVariant {
                    field: "CHROMEBOT_VERBOSE",
                    value: parsed.to_string(),
                })?;
        }

        Ok(config)
    }

    /// Builder-style helper to override the listen port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder-style helper to toggle headless mode.
    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Builder-style helper to enable attach mode against an endpoint.
    pub fn with_attach(mut self, endpoint: impl Into<String>) -> Self {
        self.attach.enabled = true;
        self.attach.endpoint = endpoint.into();
        self
    }

    /// Bridge the configured launch parameters into the driver's options.
    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            headless: self.headless,
            viewport: self.viewport.clone(),
            args: self.launch_args.clone(),
            user_data_dir: self.user_data_dir.clone(),
            executable: self.chrome_executable.clone(),
        }
    }
}

/// Errors that can arise while constructing a [`ChromebotConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {field}")]
    InvalidEnumVariant { field: &'static str, value: String },
    #[error("invalid boolean '{value}' for {field}")]
    InvalidBool { field: &'static str, value: String },
    #[error("invalid number '{value}' for {field}: {source}")]
    InvalidNumber {
        field: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid viewport '{value}' for {field}; expected WIDTHxHEIGHT")]
    InvalidViewport { field: &'static str, value: String },
}

fn env_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            field,
            value: value.to_string(),
        }),
    }
}

fn parse_u8(field: &'static str, value: &str) -> Result<u8, ConfigError> {
    value
        .trim()
        .parse::<u8>()
        .map_err(|source| ConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_u16(field: &'static str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|source| ConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|source| ConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_viewport(field: &'static str, value: &str) -> Result<Viewport, ConfigError> {
    let invalid = || ConfigError::InvalidViewport {
        field,
        value: value.to_string(),
    };
    let (width, height) = value.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
    Ok(Viewport {
        width: width.trim().parse().map_err(|_| invalid())?,
        height: height.trim().parse().map_err(|_| invalid())?,
    })
}
