//! Generic byte stream handed back to callers

use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream to the remote daemon.
///
/// Every dialer returns one of these; the RPC layer above only needs to read
/// and write bytes, never to know which transport produced them.
pub trait DialStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DialStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased stream owned by the caller, who is responsible for closing it.
pub type BoxedStream = Box<dyn DialStream>;
