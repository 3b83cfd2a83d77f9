//! Local Unix socket transport

use async_trait::async_trait;
use tracing::info;

use super::Dialer;
use crate::config::DialOptions;
use crate::error::{DialError, Result};
use crate::stream::BoxedStream;
use crate::uri::ConnectionUri;

/// libvirtd read-write socket
pub const DEFAULT_SOCKET: &str = "/var/run/libvirt/libvirt-sock";

/// Connects to the socket named by the `socket` query parameter.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixDialer;

#[async_trait]
impl Dialer for UnixDialer {
    fn name(&self) -> &'static str {
        "unix"
    }

    #[cfg(unix)]
    async fn dial(&self, uri: &ConnectionUri, options: &DialOptions) -> Result<BoxedStream> {
        let socket = uri
            .param("socket")
            .unwrap_or_else(|| DEFAULT_SOCKET.to_string());

        let stream = tokio::time::timeout(
            options.dial_timeout(),
            tokio::net::UnixStream::connect(&socket),
        )
        .await
        .map_err(|_| DialError::Timeout(format!("connect to {} timed out", socket)))?
        .map_err(|source| DialError::Connect {
            target: socket.clone(),
            transport: "unix",
            source,
        })?;

        info!("Connected to {}", socket);
        Ok(Box::new(stream))
    }

    #[cfg(not(unix))]
    async fn dial(&self, _uri: &ConnectionUri, _options: &DialOptions) -> Result<BoxedStream> {
        Err(DialError::UnsupportedTransport("unix".to_string()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_dial_socket_param() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libvirt-sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hello").await.unwrap();
        });

        let uri = ConnectionUri::parse(&format!("qemu:///system?socket={}", path.display())).unwrap();
        let mut stream = UnixDialer.dial(&uri, &DialOptions::default()).await.unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");

        let uri = ConnectionUri::parse(&format!("qemu+unix:///system?socket={}", path.display()))
            .unwrap();
        let err = UnixDialer
            .dial(&uri, &DialOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DialError::Connect { transport: "unix", .. }));
    }
}
