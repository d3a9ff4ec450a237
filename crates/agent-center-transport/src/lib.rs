//! Transport abstraction layer for agent streams
//!
//! This crate provides transport-agnostic traits that allow the agent center
//! to drive a long-lived duplex stream without coupling to any specific
//! implementation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Transfer Session                         │
//! │        (receiver task, sender task, handshake)           │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │           agent-center-transport (this crate)            │
//! │  - TransportListener    - AgentTransport                 │
//! │  - FrameReader          - FrameWriter                    │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌───────────────────────────┬─────────────────────────────┐
//! │ tcp (length-prefixed      │ memory (in-process, tokio   │
//! │ bincode over TcpStream)   │ channels)                   │
//! └───────────────────────────┴─────────────────────────────┘
//! ```

pub mod memory;
pub mod tcp;

use agent_center_proto::{AgentCommand, AgentFrame};
use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;

pub use memory::{MemoryConnector, MemoryListener, MemoryPeer, MemoryTransport};
pub use tcp::{AgentClient, TcpTransport, TcpTransportListener};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Receive half of an agent stream
#[async_trait]
pub trait FrameReader: Send + Debug {
    /// Receive the next frame sent by the agent
    ///
    /// Returns `None` if the stream has been closed gracefully by the agent.
    async fn recv_frame(&mut self) -> TransportResult<Option<AgentFrame>>;
}

/// Send half of an agent stream
#[async_trait]
pub trait FrameWriter: Send + Debug {
    /// Write a command to the agent
    async fn send_frame(&mut self, command: &AgentCommand) -> TransportResult<()>;
}

/// A duplex stream to a single agent
///
/// The stream is split into independent halves so that receiving and
/// sending can proceed concurrently without a shared lock.
pub trait AgentTransport: Send + Debug + 'static {
    type Reader: FrameReader + 'static;
    type Writer: FrameWriter + 'static;

    /// Get the remote peer address
    fn remote_address(&self) -> SocketAddr;

    /// Split the stream into its receive and send halves
    fn into_split(self) -> (Self::Reader, Self::Writer);
}

/// Server-side: Listens for incoming agent streams
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// The stream type accepted by this listener
    type Transport: AgentTransport;

    /// Accept an incoming stream
    ///
    /// Returns the stream and the remote address of the connecting agent.
    async fn accept(&self) -> TransportResult<(Self::Transport, SocketAddr)>;

    /// Get the local address this listener is bound to
    fn local_addr(&self) -> TransportResult<SocketAddr>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::StreamClosed.to_string(), "Stream closed");
        assert_eq!(
            TransportError::ConnectionError("reset".to_string()).to_string(),
            "Connection error: reset"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: TransportError = io.into();
        assert!(matches!(err, TransportError::IoError(_)));
    }
}
