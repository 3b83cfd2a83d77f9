//! Dial error types

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DialError {
    #[error("Invalid connection URI: {0}")]
    Parse(#[from] url::ParseError),

    #[error("transport '{0}' not implemented")]
    UnsupportedTransport(String),

    #[error("can't locate resource '{name}' in {searched:?}")]
    ResourceNotFound { name: String, searched: Vec<PathBuf> },

    #[error("Could not configure SSH authentication methods for {host}")]
    NoAuthMethods { host: String },

    #[error("Authentication to {user}@{host} rejected: no offered method was accepted")]
    AuthenticationFailed { host: String, user: String },

    #[error(
        "HOST KEY VERIFICATION FAILED for {host}: expected {expected}, got {actual}. \
         If the key change is legitimate, update your known_hosts file"
    )]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("Host key verification failed: unknown host {host} (fingerprint: {fingerprint})")]
    HostKeyUnknown { host: String, fingerprint: String },

    #[error("Host key for {host} is marked @revoked (fingerprint: {fingerprint})")]
    HostKeyRevoked { host: String, fingerprint: String },

    #[error("max tunnel depth of {max} reached, check ProxyJump settings for cycles")]
    DepthExceeded { max: usize },

    #[error("Failed to connect to {target} over {transport}: {source}")]
    Connect {
        target: String,
        transport: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("server verification (of our certificate or IP address) failed")]
    ServerVerification,

    #[error("failed to read ssh known hosts {path:?}: {source}")]
    KnownHosts {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH protocol error: {0}")]
    Ssh(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DialError {
    /// Prefix a protocol-level error with the hop it happened on.
    pub(crate) fn at_hop(self, hop: &str) -> Self {
        match self {
            DialError::Ssh(msg) => DialError::Ssh(format!("{}: {}", hop, msg)),
            DialError::Timeout(msg) => DialError::Timeout(format!("{}: {}", hop, msg)),
            other => other,
        }
    }
}

impl From<russh::Error> for DialError {
    fn from(err: russh::Error) -> Self {
        DialError::Ssh(err.to_string())
    }
}

impl From<russh::keys::Error> for DialError {
    fn from(err: russh::keys::Error) -> Self {
        DialError::Key(err.to_string())
    }
}

impl From<rustls::Error> for DialError {
    fn from(err: rustls::Error) -> Self {
        DialError::Tls(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DialError>;
