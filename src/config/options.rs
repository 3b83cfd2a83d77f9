//! Dial Options
//!
//! Tunables that are not part of the connection URI. Every field has a default,
//! so an empty JSON object (or no file at all) yields the stock behaviour.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DialError, Result};

/// Which implementation carries the `ssh` transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshBackend {
    /// In-process SSH client with ProxyJump chaining
    #[default]
    Native,
    /// Spawn the system `ssh` binary and proxy over its stdio
    Command,
}

/// Options shared by every dialer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialOptions {
    /// Raw connect timeout in seconds (default: 2)
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// TLS / SSH handshake timeout in seconds (default: 30)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Maximum ProxyJump depth before giving up (default: 10)
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,

    /// SSH keepalive interval in seconds, 0 disables (default: 30)
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,

    /// SSH client config file. `None` means `~/.ssh/config`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_config_path: Option<PathBuf>,

    #[serde(default)]
    pub ssh_backend: SshBackend,

    /// Binary used by the command backend (default: "ssh")
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,
}

fn default_dial_timeout() -> u64 {
    2
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_max_hops() -> usize {
    10
}

fn default_keepalive() -> u64 {
    30
}

fn default_ssh_command() -> String {
    "ssh".to_string()
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            dial_timeout_secs: default_dial_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            max_hops: default_max_hops(),
            keepalive_interval_secs: default_keepalive(),
            ssh_config_path: None,
            ssh_backend: SshBackend::Native,
            ssh_command: default_ssh_command(),
        }
    }
}

impl DialOptions {
    /// Load options from a JSON file.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content)
            .map_err(|e| DialError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}
