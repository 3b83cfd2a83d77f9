//! Configuration Module
//!
//! Dial options and the read-only SSH client config view.

pub mod options;
pub mod ssh_config;

pub use options::{DialOptions, SshBackend};
pub use ssh_config::{default_ssh_config_path, SshConfigError, SshConfigView};
