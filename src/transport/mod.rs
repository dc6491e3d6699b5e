//! Byte-duplex abstraction over the Snowflake WebSocket tunnel.
//!
//! The engine never opens sockets itself. The embedder hands in a
//! [`BridgeConnector`] that produces one byte duplex per link; application
//! bytes ride the WebSocket as binary frames with no extra framing. TLS to
//! the guard and to HTTPS exits is layered on top in [`tls`].

pub mod pipe;
pub mod tls;

use crate::error::{Result, TorError};
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};
use std::rc::Rc;

/// A bidirectional byte stream: a `{ read, write, close }` duplex.
#[async_trait(?Send)]
pub trait ByteStream {
    /// Read up to `buf.len()` bytes; `Ok(0)` means clean EOF.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write the whole buffer.
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Close both directions. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

pub type BoxStream = Box<dyn ByteStream>;

#[async_trait(?Send)]
impl ByteStream for BoxStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write_all(buf).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}

/// Read exactly `buf.len()` bytes or fail with `ShortRead`.
pub async fn read_exact<S: ByteStream + ?Sized>(stream: &mut S, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(TorError::ShortRead(buf.len() - filled));
        }
        filled += n;
    }
    Ok(())
}

/// Adapter lifting any `futures` I/O object into a [`ByteStream`].
pub struct IoStream<T>(pub T);

#[async_trait(?Send)]
impl<T: AsyncRead + AsyncWrite + Unpin> ByteStream for IoStream<T> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        AsyncReadExt::read(&mut self.0, buf)
            .await
            .map_err(|e| TorError::ConnectFailed(format!("read: {e}")))
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        AsyncWriteExt::write_all(&mut self.0, buf)
            .await
            .map_err(|e| TorError::ConnectFailed(format!("write: {e}")))?;
        AsyncWriteExt::flush(&mut self.0)
            .await
            .map_err(|e| TorError::ConnectFailed(format!("flush: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        let _ = AsyncWriteExt::close(&mut self.0).await;
        Ok(())
    }
}

/// Produces one WebSocket tunnel per link. The WebSocket implementation
/// itself lives with the embedder (browser API, tungstenite, ...).
#[async_trait(?Send)]
pub trait BridgeConnector {
    async fn connect(&self, url: &str) -> Result<BoxStream>;
}

pub type SharedConnector = Rc<dyn BridgeConnector>;
