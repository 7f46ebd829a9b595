//! Byte transport between host and device.
//!
//! The secure link only needs to push whole frames out and pull whole frames
//! in. [`StreamTransport`] adapts any tokio byte stream (TCP socket, serial
//! bridge, in-memory duplex pipe) to that contract.

use async_trait::async_trait;
use bytes::BytesMut;
use securelink_wire::{FrameDecoder, SecureFrame, WireError};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Transport failures
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying I/O failed
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Byte stream could not be split into frames
    #[error("framing error: {0}")]
    Wire(#[from] WireError),

    /// Peer went away
    #[error("transport closed")]
    Closed,
}

/// Frame-level transport primitive
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one frame
    async fn send(&self, frame: &SecureFrame) -> Result<(), TransportError>;

    /// Read the next frame, `None` once the peer closed the stream cleanly
    async fn recv(&self) -> Result<Option<SecureFrame>, TransportError>;
}

struct ReadState<S> {
    half: ReadHalf<S>,
    buffer: BytesMut,
    decoder: FrameDecoder,
}

/// [`Transport`] over an async byte stream
pub struct StreamTransport<S> {
    reader: Mutex<ReadState<S>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a byte stream
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(ReadState {
                half: read_half,
                buffer: BytesMut::with_capacity(4096),
                decoder: FrameDecoder::new(),
            }),
            writer: Mutex::new(write_half),
        }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, frame: &SecureFrame) -> Result<(), TransportError> {
        let bytes = frame.encode();
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        trace!(len = bytes.len(), encrypted = frame.is_encrypted(), "Wrote frame");
        Ok(())
    }

    async fn recv(&self) -> Result<Option<SecureFrame>, TransportError> {
        let mut guard = self.reader.lock().await;
        let state = &mut *guard;
        loop {
            if let Some(frame) = state.decoder.decode(&mut state.buffer)? {
                return Ok(Some(frame));
            }

            let bytes_read = state.half.read_buf(&mut state.buffer).await?;
            if bytes_read == 0 {
                if state.buffer.is_empty() {
                    debug!("Transport reached end of stream");
                    return Ok(None);
                }
                return Err(TransportError::Closed);
            }
            trace!(
                "Read {} bytes, buffer now has {} bytes",
                bytes_read,
                state.buffer.len()
            );
        }
    }
}

/// Connect to a device bridge over TCP
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<StreamTransport<TcpStream>> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    debug!("Connected to device bridge at {}", addr);
    Ok(StreamTransport::new(stream))
}
