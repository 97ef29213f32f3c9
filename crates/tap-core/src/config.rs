use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    /// Upper bound on a single message head, shared by the request and
    /// response parsers.
    pub max_head_bytes: usize,
    /// Directory receiving the `req-<uuid>` / `resp-<uuid>` body files.
    pub capture_dir: PathBuf,
    /// `None` leaves upstream dials unbounded.
    pub upstream_connect_timeout_ms: Option<u64>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 8080,
            max_head_bytes: 64 * 1024,
            capture_dir: PathBuf::from("capture"),
            upstream_connect_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProxyConfigError {
    #[error("listen_addr must not be empty")]
    EmptyListenAddr,
    #[error("max_head_bytes must be greater than zero")]
    ZeroHeadLimit,
    #[error("capture_dir must not be empty")]
    EmptyCaptureDir,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyConfigError> {
        if self.listen_addr.is_empty() {
            return Err(ProxyConfigError::EmptyListenAddr);
        }
        if self.max_head_bytes == 0 {
            return Err(ProxyConfigError::ZeroHeadLimit);
        }
        if self.capture_dir.as_os_str().is_empty() {
            return Err(ProxyConfigError::EmptyCaptureDir);
        }
        Ok(())
    }

    pub fn upstream_connect_timeout(&self) -> Option<Duration> {
        self.upstream_connect_timeout_ms.map(Duration::from_millis)
    }
}
