use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
pub const DEFAULT_API_VERSION: &str = "v1.41";
/// Request timeout. Waits and attaches last as long as the step does.
pub const DEFAULT_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Where and how to reach the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// `unix:///path/to.sock` or `tcp://host:port`.
    pub host: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: format!("unix://{DEFAULT_SOCKET}"),
            api_version: default_api_version(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl EngineConfig {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.trim_end_matches('/').to_owned(),
            api_version: default_api_version(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    #[must_use]
    pub fn with_api_version(mut self, version: &str) -> Self {
        let version = version.trim_start_matches('v');
        self.api_version = format!("v{version}");
        self
    }

    /// `BOXFORGE_ENGINE_HOST`, then `DOCKER_HOST`, then the default socket.
    pub fn from_env() -> Self {
        let host = std::env::var("BOXFORGE_ENGINE_HOST")
            .or_else(|_| std::env::var("DOCKER_HOST"))
            .ok()
            .filter(|h| !h.trim().is_empty());
        let mut config = host.map_or_else(Self::default, |h| Self::new(&h));
        if let Ok(version) = std::env::var("DOCKER_API_VERSION") {
            if !version.trim().is_empty() {
                config = config.with_api_version(version.trim());
            }
        }
        config
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| EngineError::Config(format!("invalid engine config: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn endpoint(&self) -> Result<Endpoint, EngineError> {
        if let Some(path) = self.host.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(EngineError::Config("empty unix socket path".to_owned()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = self.host.strip_prefix("tcp://") {
            if !addr.contains(':') {
                return Err(EngineError::Config(format!(
                    "tcp endpoint '{addr}' is missing a port"
                )));
            }
            return Ok(Endpoint::Tcp(addr.to_owned()));
        }
        if self.host.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(&self.host)));
        }
        Err(EngineError::Config(format!(
            "unsupported engine host '{}': expected unix:// or tcp://",
            self.host
        )))
    }
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_owned()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
