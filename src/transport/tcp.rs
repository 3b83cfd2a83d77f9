//! Plain TCP transport

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::Dialer;
use crate::config::DialOptions;
use crate::error::{DialError, Result};
use crate::stream::BoxedStream;
use crate::uri::ConnectionUri;

/// libvirtd plain TCP port
pub const DEFAULT_TCP_PORT: u16 = 16509;

/// `host:port`, bracketing IPv6 literals.
pub(crate) fn display_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// TCP connect bounded by `timeout`, errors tagged with `transport`.
pub(crate) async fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
    transport: &'static str,
) -> Result<TcpStream> {
    let target = display_addr(host, port);

    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| DialError::Timeout(format!("connect to {} timed out", target)))?
        .map_err(|source| DialError::Connect {
            target: target.clone(),
            transport,
            source,
        })?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on {}: {}", target, e);
    }

    Ok(stream)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn dial(&self, uri: &ConnectionUri, options: &DialOptions) -> Result<BoxedStream> {
        let host = uri.hostname();
        let port = uri.port().unwrap_or(DEFAULT_TCP_PORT);

        let stream = connect_tcp(&host, port, options.dial_timeout(), "tcp").await?;
        info!("Connected to {} over tcp", display_addr(&host, port));

        Ok(Box::new(stream))
    }
}
