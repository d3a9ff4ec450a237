//! TCP transport implementation
//!
//! Frames are carried as `[length: u32][bincode payload]` directly on the
//! TCP byte stream.

use agent_center_proto::{AgentCommand, AgentFrame, FrameCodec};
use async_trait::async_trait;
use bytes::BytesMut;
use serde::{de::DeserializeOwned, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

use crate::{
    AgentTransport, FrameReader, FrameWriter, TransportError, TransportListener, TransportResult,
};

const READ_CHUNK_SIZE: usize = 8192;

/// Buffered, frame-oriented read half of a TCP stream
#[derive(Debug)]
pub struct TcpReadHalf {
    read: OwnedReadHalf,
    recv_buffer: BytesMut,
    closed: bool,
}

impl TcpReadHalf {
    fn new(read: OwnedReadHalf) -> Self {
        Self {
            read,
            recv_buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            closed: false,
        }
    }

    /// Read the next complete frame
    ///
    /// Returns `None` on a clean EOF between frames; EOF in the middle of a
    /// frame is a protocol error.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> TransportResult<Option<T>> {
        if self.closed {
            return Ok(None);
        }

        loop {
            if let Some(frame) = FrameCodec::decode(&mut self.recv_buffer)
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?
            {
                return Ok(Some(frame));
            }

            let n = self.read.read_buf(&mut self.recv_buffer).await?;
            if n == 0 {
                self.closed = true;
                if self.recv_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::ProtocolError(
                    "Incomplete frame in buffer".to_string(),
                ));
            }
            trace!("Read {} bytes from TCP stream", n);
        }
    }
}

/// Frame-oriented write half of a TCP stream
#[derive(Debug)]
pub struct TcpWriteHalf {
    write: OwnedWriteHalf,
}

impl TcpWriteHalf {
    pub async fn write_frame<T: Serialize>(&mut self, frame: &T) -> TransportResult<()> {
        let encoded =
            FrameCodec::encode(frame).map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        self.write.write_all(&encoded).await?;
        self.write.flush().await?;
        Ok(())
    }

    /// Shut down the write direction
    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.write.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl FrameReader for TcpReadHalf {
    async fn recv_frame(&mut self) -> TransportResult<Option<AgentFrame>> {
        self.read_frame().await
    }
}

#[async_trait]
impl FrameWriter for TcpWriteHalf {
    async fn send_frame(&mut self, command: &AgentCommand) -> TransportResult<()> {
        self.write_frame(command).await
    }
}

/// Server side of an accepted agent TCP stream
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    remote_addr: SocketAddr,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        Self {
            stream,
            remote_addr,
        }
    }
}

impl AgentTransport for TcpTransport {
    type Reader = TcpReadHalf;
    type Writer = TcpWriteHalf;

    fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        let (read, write) = self.stream.into_split();
        (TcpReadHalf::new(read), TcpWriteHalf { write })
    }
}

/// TCP listener accepting agent streams
#[derive(Debug)]
pub struct TcpTransportListener {
    listener: TcpListener,
}

impl TcpTransportListener {
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    type Transport = TcpTransport;

    async fn accept(&self) -> TransportResult<(Self::Transport, SocketAddr)> {
        let (stream, remote) = self.listener.accept().await?;
        // Commands are small and latency sensitive
        stream.set_nodelay(true)?;
        debug!("Incoming TCP connection from {}", remote);
        Ok((TcpTransport::new(stream, remote), remote))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.listener.local_addr().map_err(TransportError::IoError)
    }
}

/// Agent side of a TCP stream: sends frames, receives commands
#[derive(Debug)]
pub struct AgentClient {
    reader: TcpReadHalf,
    writer: TcpWriteHalf,
}

impl AgentClient {
    pub async fn connect(addr: SocketAddr) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: TcpReadHalf::new(read),
            writer: TcpWriteHalf { write },
        })
    }

    pub async fn send_frame(&mut self, frame: &AgentFrame) -> TransportResult<()> {
        self.writer.write_frame(frame).await
    }

    /// Receive the next command; `None` once the agent center closed the stream
    pub async fn recv_command(&mut self) -> TransportResult<Option<AgentCommand>> {
        self.reader.read_frame().await
    }

    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.writer.shutdown().await
    }
}
