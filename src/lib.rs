//! virtdial - connection dialer for libvirt daemons
//!
//! Turns a libvirt connection URI into a live byte stream to the daemon over
//! a local Unix socket, plain TCP, mutual TLS, or SSH with `ProxyJump`
//! bastions. The RPC protocol spoken over the stream is the caller's business.
//!
//! ```no_run
//! # async fn example() -> virtdial::Result<()> {
//! let stream = virtdial::dial("qemu+ssh://root@host/system").await?;
//! # drop(stream);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ssh;
pub mod stream;
pub mod transport;
pub mod uri;
pub mod util;

pub use config::{DialOptions, SshBackend};
pub use error::{DialError, Result};
pub use stream::{BoxedStream, DialStream};
pub use transport::{Dialer, Transport};
pub use uri::ConnectionUri;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Dial `uri` with default options.
pub async fn dial(uri: &str) -> Result<BoxedStream> {
    dial_with(&ConnectionUri::parse(uri)?, &DialOptions::default()).await
}

/// Dial an already parsed URI.
pub async fn dial_with(uri: &ConnectionUri, options: &DialOptions) -> Result<BoxedStream> {
    transport::dial(uri, options).await
}

/// Initialize logging
///
/// `RUST_LOG` wins when set, otherwise `default_filter` applies.
pub fn init_logging(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
