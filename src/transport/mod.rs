//! Dial orchestration
//!
//! One [`Dialer`] per transport, chosen by a pure function of the parsed URI.
//! There is no fallback between transports and no retry at this layer.

pub mod tcp;
pub mod tls;
pub mod unix;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tracing::debug;

use crate::config::{DialOptions, SshBackend};
use crate::error::{DialError, Result};
use crate::ssh::{SshCommandDialer, SshDialer};
use crate::stream::BoxedStream;
use crate::uri::ConnectionUri;

pub use tcp::TcpDialer;
pub use tls::TlsDialer;
pub use unix::UnixDialer;

/// Transports this crate can dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Unix,
    Tcp,
    Tls,
    Ssh,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Unix => "unix",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
            Transport::Ssh => "ssh",
        }
    }

    /// Transport named by `uri`.
    pub fn from_uri(uri: &ConnectionUri) -> Result<Self> {
        uri.transport().parse()
    }
}

impl FromStr for Transport {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unix" => Ok(Transport::Unix),
            "tcp" => Ok(Transport::Tcp),
            "tls" => Ok(Transport::Tls),
            "ssh" => Ok(Transport::Ssh),
            other => Err(DialError::UnsupportedTransport(other.to_string())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens a byte stream to the daemon named by a connection URI.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn dial(&self, uri: &ConnectionUri, options: &DialOptions) -> Result<BoxedStream>;
}

/// Dialer for `transport`. SSH honours [`DialOptions::ssh_backend`].
pub fn dialer_for(transport: Transport, options: &DialOptions) -> Box<dyn Dialer> {
    match transport {
        Transport::Unix => Box::new(UnixDialer),
        Transport::Tcp => Box::new(TcpDialer),
        Transport::Tls => Box::new(TlsDialer),
        Transport::Ssh => match options.ssh_backend {
            SshBackend::Native => Box::new(SshDialer::from_process()),
            SshBackend::Command => Box::new(SshCommandDialer),
        },
    }
}

/// Dial `uri` with the transport it names.
pub async fn dial(uri: &ConnectionUri, options: &DialOptions) -> Result<BoxedStream> {
    let transport = Transport::from_uri(uri)?;
    let dialer = dialer_for(transport, options);
    debug!("Dialing {} with the {} dialer", uri, dialer.name());
    dialer.dial(uri, options).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_of(s: &str) -> Result<Transport> {
        Transport::from_uri(&ConnectionUri::parse(s).unwrap())
    }

    #[test]
    fn test_transport_selection() {
        assert_eq!(transport_of("qemu+ssh://h/system").unwrap(), Transport::Ssh);
        assert_eq!(transport_of("qemu+tcp://h/system").unwrap(), Transport::Tcp);
        assert_eq!(transport_of("qemu+unix:///system").unwrap(), Transport::Unix);
        assert_eq!(transport_of("qemu://h/system").unwrap(), Transport::Tls);
        assert_eq!(transport_of("qemu:///system").unwrap(), Transport::Unix);
    }

    #[test]
    fn test_unknown_transport_is_rejected() {
        let err = transport_of("qemu+libssh2://h/system").unwrap_err();
        assert!(matches!(err, DialError::UnsupportedTransport(ref t) if t == "libssh2"));
        assert_eq!(err.to_string(), "transport 'libssh2' not implemented");
    }

    #[test]
    fn test_dialer_for_ssh_backend() {
        let mut options = DialOptions::default();
        assert_eq!(dialer_for(Transport::Ssh, &options).name(), "ssh");
        options.ssh_backend = SshBackend::Command;
        assert_eq!(dialer_for(Transport::Ssh, &options).name(), "ssh-command");
        assert_eq!(dialer_for(Transport::Tls, &options).name(), "tls");
    }

    #[tokio::test]
    async fn test_dial_unsupported_transport_does_no_io() {
        let uri = ConnectionUri::parse("qemu+ext://h/system").unwrap();
        let result = dial(&uri, &DialOptions::default()).await;
        assert!(matches!(result, Err(DialError::UnsupportedTransport(_))));
    }
}
