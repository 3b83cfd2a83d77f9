//! ProxyJump tunnel construction
//!
//! Folds a prepared hop list into nested SSH sessions and opens the daemon
//! socket on the last one:
//! ```text
//! Client --TCP/SSH--> [Hop1] --direct-tcpip--> [Hop2] --direct-tcpip--> ... --> [Target] --streamlocal--> libvirt-sock
//! ```
//!
//! # Key APIs
//!
//! - `russh::client::connect_stream()` - SSH handshake over any AsyncRead + AsyncWrite
//! - `Handle::channel_open_direct_tcpip()` - TCP tunnel to the next hop
//! - `Handle::channel_open_direct_streamlocal()` - Unix socket on the final host
//! - `Channel::into_stream()` - channel as AsyncRead + AsyncWrite

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use russh::client::{self, Handle, Msg};
use russh::ChannelStream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info};

use super::auth::authenticate;
use super::client::ClientHandler;
use super::PreparedHop;
use crate::config::DialOptions;
use crate::error::DialError;
use crate::stream::DialStream;
use crate::transport::tcp::connect_tcp;

/// Stream to the remote daemon socket.
///
/// Owns every hop's session handle; dropping the tunnel closes the channel
/// first and then tears down the hops.
pub struct SshTunnel {
    stream: ChannelStream<Msg>,
    /// Order: [hop1, hop2, ..., target]
    handles: Vec<Handle<ClientHandler>>,
}

impl SshTunnel {
    /// Number of SSH sessions carrying this tunnel.
    pub fn hop_count(&self) -> usize {
        self.handles.len()
    }
}

impl AsyncRead for SshTunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SshTunnel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Handshake and authenticate one hop over an already-open transport.
async fn connect_hop<S>(
    hop: PreparedHop,
    transport: S,
    options: &DialOptions,
) -> Result<Handle<ClientHandler>, DialError>
where
    S: DialStream + 'static,
{
    let PreparedHop {
        route,
        known_hosts,
        host_key_algorithms,
        auth_methods,
    } = hop;

    let ssh_config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: options.keepalive_interval(),
        keepalive_max: 3,
        preferred: russh::Preferred {
            key: host_key_algorithms.into(),
            ..Default::default()
        },
        ..Default::default()
    };

    let handler = ClientHandler::new(route.host.clone(), route.port, known_hosts);

    let mut handle = tokio::time::timeout(
        options.handshake_timeout(),
        client::connect_stream(Arc::new(ssh_config), transport, handler),
    )
    .await
    .map_err(|_| DialError::Timeout(format!("SSH handshake with {} timed out", route)))??;

    debug!("SSH handshake with {} completed", route);

    tokio::time::timeout(
        options.handshake_timeout(),
        authenticate(&mut handle, &route.host, &route.user, auth_methods),
    )
    .await
    .map_err(|_| DialError::Timeout(format!("SSH authentication with {} timed out", route)))??;

    Ok(handle)
}

/// Dial the first hop over TCP, tunnel through the rest, then open `socket`
/// on the final host.
pub async fn connect_chain(
    hops: Vec<PreparedHop>,
    socket: &str,
    options: &DialOptions,
) -> Result<SshTunnel, DialError> {
    let total = hops.len();
    let mut handles: Vec<Handle<ClientHandler>> = Vec::with_capacity(total);

    for (i, hop) in hops.into_iter().enumerate() {
        let label = hop.route.to_string();
        info!("SSH hop {}/{}: connecting to {}", i + 1, total, label);

        let handle = match handles.last() {
            None => {
                let tcp = connect_tcp(
                    &hop.route.host,
                    hop.route.port,
                    options.dial_timeout(),
                    "ssh",
                )
                .await?;
                connect_hop(hop, tcp, options).await
            }
            Some(parent) => {
                let channel = parent
                    .channel_open_direct_tcpip(
                        hop.route.host.as_str(),
                        u32::from(hop.route.port),
                        "127.0.0.1",
                        0,
                    )
                    .await
                    .map_err(|e| {
                        DialError::Ssh(format!("failed to open tunnel to {}: {}", label, e))
                    })?;
                connect_hop(hop, channel.into_stream(), options).await
            }
        }
        .map_err(|e| e.at_hop(&label))?;

        handles.push(handle);
    }

    let target = handles
        .last()
        .ok_or_else(|| DialError::Config("empty SSH route".to_string()))?;

    let channel = target
        .channel_open_direct_streamlocal(socket)
        .await
        .map_err(|e| DialError::Ssh(format!("failed to open remote socket {}: {}", socket, e)))?;

    info!("Opened remote socket {} over {} SSH hop(s)", socket, handles.len());

    Ok(SshTunnel {
        stream: channel.into_stream(),
        handles,
    })
}
