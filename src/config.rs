use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::McpError;

pub const DEFAULT_VERSION: &str = "v1.0.0";
pub const DEFAULT_PORT: &str = "8080";
pub const DEFAULT_RESOURCE_PREFIX: &str = "/resource";
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_PUSH_TIMEOUT_MS: u64 = 5_000;

/// Run mode. Debug turns on request logging and startup tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Debug,
    Release,
    Test,
}

impl FromStr for Mode {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Mode::Debug),
            "release" => Ok(Mode::Release),
            "test" => Ok(Mode::Test),
            other => Err(McpError::Config(format!("unsupported mode: {other}"))),
        }
    }
}

/// How responses reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// Responses for a live session are pushed onto its event stream.
    #[default]
    Sse,
    /// Every call is answered on its own HTTP response.
    StreamableHttp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Sse => "sse",
            Transport::StreamableHttp => "streamable-http",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sse" => Ok(Transport::Sse),
            "streamable-http" => Ok(Transport::StreamableHttp),
            other => Err(McpError::Config(format!("unsupported transport type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub mode: Mode,
    pub transport: Transport,
    /// Bind address; `None` falls back to `PORT` and then `:8080`.
    pub addr: Option<String>,
    pub resource_prefix: String,
    /// Per-session outbound queue capacity.
    pub queue_capacity: usize,
    /// How long a push waits on a full session queue.
    pub push_timeout_ms: u64,
    /// Reject session traffic until that session has sent `initialize`.
    pub require_initialize: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            name: "zeno".into(),
            version: DEFAULT_VERSION.into(),
            mode: Mode::default(),
            transport: Transport::default(),
            addr: None,
            resource_prefix: DEFAULT_RESOURCE_PREFIX.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            push_timeout_ms: DEFAULT_PUSH_TIMEOUT_MS,
            require_initialize: false,
        }
    }
}

impl ServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        ServerConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load a config from a JSON file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, McpError> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    /// Parse a config from raw JSON bytes. Missing fields take defaults.
    pub fn parse(data: &[u8]) -> Result<Self, McpError> {
        let config: ServerConfig = serde_json::from_slice(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `PORT`, `ZENO_MODE` and `ZENO_TRANSPORT`.
    pub fn from_env() -> Result<Self, McpError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, McpError> {
        let mut config = ServerConfig::default();
        config.apply_lookup(lookup)?;
        Ok(config)
    }

    /// Overlay environment-style settings onto this config.
    pub fn apply_lookup(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), McpError> {
        if let Some(port) = lookup("PORT").filter(|p| !p.is_empty()) {
            tracing::debug!(port = %port, "using PORT from environment");
            self.addr = Some(format!("0.0.0.0:{port}"));
        }
        if let Some(mode) = lookup("ZENO_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(transport) = lookup("ZENO_TRANSPORT") {
            self.transport = transport.parse()?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), McpError> {
        if self.queue_capacity == 0 {
            return Err(McpError::Config("queue_capacity must be at least 1".into()));
        }
        if !self.resource_prefix.is_empty() && !self.resource_prefix.starts_with('/') {
            return Err(McpError::Config(format!(
                "resource_prefix must start with '/': {:?}",
                self.resource_prefix
            )));
        }
        Ok(())
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    /// The prefix without a trailing slash, e.g. `/resource`.
    pub fn resource_prefix(&self) -> &str {
        self.resource_prefix.trim_end_matches('/')
    }

    pub fn bind_address(&self) -> String {
        resolve_address(self.addr.as_deref(), std::env::var("PORT").ok())
    }
}

/// Explicit address first, then `PORT`, then `0.0.0.0:8080`.
///
/// An explicit `:port` is widened to all interfaces.
pub fn resolve_address(explicit: Option<&str>, port: Option<String>) -> String {
    match explicit.filter(|a| !a.is_empty()) {
        Some(addr) if addr.starts_with(':') => format!("0.0.0.0{addr}"),
        Some(addr) => addr.to_string(),
        None => match port.filter(|p| !p.is_empty()) {
            Some(port) => format!("0.0.0.0:{port}"),
            None => {
                tracing::debug!("PORT is undefined, using :{DEFAULT_PORT}");
                format!("0.0.0.0:{DEFAULT_PORT}")
            }
        },
    }
}
