//! Raw transport
//!
//! Frames are a `u32` little endian length followed by that many bytes.
//! An outbound peer connection opens with one identity frame carrying the
//! sender's address; every later frame is an encoded envelope.

use crate::error::{CommError, CommResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Write one length prefixed frame.
pub async fn write_frame<W>(writer: &mut W, data: &[u8], max_len: usize) -> CommResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    if data.len() > max_len {
        return Err(CommError::MessageTooLarge {
            len: data.len(),
            max: max_len,
        });
    }
    let len = u32::try_from(data.len()).map_err(|_| CommError::MessageTooLarge {
        len: data.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length prefixed frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> CommResult<Option<Bytes>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len) as usize;
    if len > max_len {
        return Err(CommError::MessageTooLarge { len, max: max_len });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

/// Outbound half of a peer channel
#[async_trait]
pub trait Link: Send + Sync {
    /// Send one encoded envelope.
    async fn send(&self, frame: Bytes) -> CommResult<()>;

    /// Close the channel. Later sends fail.
    async fn close(&self) -> CommResult<()>;
}

/// Opens outbound peer channels
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `address` and announce `identity` as the sender.
    async fn connect(&self, address: &str, identity: &str) -> CommResult<Arc<dyn Link>>;
}

/// Connection carrying strictly alternating requests and responses
#[async_trait]
pub trait DuplexLink: Send {
    /// Send a request and wait for the response.
    async fn round_trip(&mut self, request: Bytes) -> CommResult<Bytes>;
}

/// TCP implementation of [`Connector`]
#[derive(Clone, Debug)]
pub struct TcpConnector {
    max_frame_len: usize,
    connect_timeout: Duration,
}

impl TcpConnector {
    #[must_use]
    pub const fn new(max_frame_len: usize, connect_timeout: Duration) -> Self {
        Self {
            max_frame_len,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str, identity: &str) -> CommResult<Arc<dyn Link>> {
        let stream = connect_with_timeout(address, self.connect_timeout).await?;
        let mut link = TcpLink {
            stream: Mutex::new(Some(stream)),
            max_frame_len: self.max_frame_len,
        };
        if let Some(stream) = link.stream.get_mut().as_mut() {
            write_frame(stream, identity.as_bytes(), self.max_frame_len).await?;
        }
        debug!("Opened channel to {} as {}", address, identity);
        Ok(Arc::new(link))
    }
}

async fn connect_with_timeout(address: &str, timeout: Duration) -> CommResult<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            CommError::Io(std::io::Error::new(
                ErrorKind::TimedOut,
                format!("connect to {address} timed out"),
            ))
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Outbound TCP peer channel
pub struct TcpLink {
    stream: Mutex<Option<TcpStream>>,
    max_frame_len: usize,
}

#[async_trait]
impl Link for TcpLink {
    async fn send(&self, frame: Bytes) -> CommResult<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(CommError::Closed)?;
        write_frame(stream, &frame, self.max_frame_len).await
    }

    async fn close(&self) -> CommResult<()> {
        let mut guard = self.stream.lock().await;
        match guard.take() {
            Some(mut stream) => Ok(stream.shutdown().await?),
            None => Ok(()),
        }
    }
}

/// TCP implementation of [`DuplexLink`]
pub struct TcpDuplexLink {
    stream: TcpStream,
    max_frame_len: usize,
}

impl TcpDuplexLink {
    pub async fn connect(
        address: &str,
        max_frame_len: usize,
        connect_timeout: Duration,
    ) -> CommResult<Self> {
        Ok(Self {
            stream: connect_with_timeout(address, connect_timeout).await?,
            max_frame_len,
        })
    }
}

#[async_trait]
impl DuplexLink for TcpDuplexLink {
    async fn round_trip(&mut self, request: Bytes) -> CommResult<Bytes> {
        write_frame(&mut self.stream, &request, self.max_frame_len).await?;
        read_frame(&mut self.stream, self.max_frame_len)
            .await?
            .ok_or(CommError::Closed)
    }
}
