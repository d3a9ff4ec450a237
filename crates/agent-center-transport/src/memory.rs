//! In-process transport backed by tokio channels
//!
//! Used to embed the agent center in a single process (simulators, tests).
//! The [`MemoryPeer`] plays the agent: it pushes frames, injects receive
//! errors, reads back the commands written by the server and can make
//! subsequent writes fail or hang.

use agent_center_proto::{AgentCommand, AgentFrame};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

use crate::{
    AgentTransport, FrameReader, FrameWriter, TransportError, TransportListener, TransportResult,
};

type InboundItem = TransportResult<AgentFrame>;

/// Create a connected transport/peer pair
pub fn pair(remote_addr: SocketAddr) -> (MemoryTransport, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let fail_sends = Arc::new(AtomicBool::new(false));
    let stalled_writes = Arc::new(AtomicUsize::new(0));
    let (stall_tx, stall_rx) = watch::channel(false);

    let transport = MemoryTransport {
        remote_addr,
        inbound_rx,
        outbound_tx,
        fail_sends: fail_sends.clone(),
        stall_rx,
        stalled_writes: stalled_writes.clone(),
    };
    let peer = MemoryPeer {
        inbound_tx: Some(inbound_tx),
        outbound_rx,
        fail_sends,
        stall_tx,
        stalled_writes,
    };
    (transport, peer)
}

/// Server side of an in-process stream
#[derive(Debug)]
pub struct MemoryTransport {
    remote_addr: SocketAddr,
    inbound_rx: mpsc::UnboundedReceiver<InboundItem>,
    outbound_tx: mpsc::UnboundedSender<AgentCommand>,
    fail_sends: Arc<AtomicBool>,
    stall_rx: watch::Receiver<bool>,
    stalled_writes: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct MemoryReader {
    inbound_rx: mpsc::UnboundedReceiver<InboundItem>,
}

#[derive(Debug)]
pub struct MemoryWriter {
    outbound_tx: mpsc::UnboundedSender<AgentCommand>,
    fail_sends: Arc<AtomicBool>,
    stall_rx: watch::Receiver<bool>,
    stalled_writes: Arc<AtomicUsize>,
}

impl AgentTransport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        (
            MemoryReader {
                inbound_rx: self.inbound_rx,
            },
            MemoryWriter {
                outbound_tx: self.outbound_tx,
                fail_sends: self.fail_sends,
                stall_rx: self.stall_rx,
                stalled_writes: self.stalled_writes,
            },
        )
    }
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv_frame(&mut self) -> TransportResult<Option<AgentFrame>> {
        match self.inbound_rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send_frame(&mut self, command: &AgentCommand) -> TransportResult<()> {
        let stalled = *self.stall_rx.borrow();
        if stalled {
            let _stalled = StalledWrite::enter(&self.stalled_writes);
            if self.stall_rx.wait_for(|stalled| !*stalled).await.is_err() {
                return Err(TransportError::StreamClosed);
            }
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(
                "connection reset by peer".to_string(),
            ));
        }
        self.outbound_tx
            .send(command.clone())
            .map_err(|_| TransportError::StreamClosed)
    }
}

/// Agent side of an in-process stream
/// Counts a hanging write until it resumes or is dropped
struct StalledWrite<'a>(&'a AtomicUsize);

impl<'a> StalledWrite<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for StalledWrite<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MemoryPeer {
    inbound_tx: Option<mpsc::UnboundedSender<InboundItem>>,
    outbound_rx: mpsc::UnboundedReceiver<AgentCommand>,
    fail_sends: Arc<AtomicBool>,
    stall_tx: watch::Sender<bool>,
    stalled_writes: Arc<AtomicUsize>,
}

impl MemoryPeer {
    /// Deliver a frame to the server; false once the server side is gone
    pub fn send_frame(&self, frame: AgentFrame) -> bool {
        self.push(Ok(frame))
    }

    /// Make the server's next receive fail with `error`
    pub fn inject_error(&self, error: TransportError) -> bool {
        self.push(Err(error))
    }

    /// Close the agent's sending direction (server sees an orderly close)
    pub fn close(&mut self) {
        self.inbound_tx = None;
    }

    /// Make every subsequent server write fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make server writes hang until released
    pub fn stall_sends(&self, stall: bool) {
        self.stall_tx.send_replace(stall);
    }

    /// Number of server writes currently hanging
    pub fn stalled_writes(&self) -> usize {
        self.stalled_writes.load(Ordering::SeqCst)
    }

    /// Next command written by the server; `None` once the writer is dropped
    pub async fn recv_command(&mut self) -> Option<AgentCommand> {
        self.outbound_rx.recv().await
    }

    /// Drain commands already written by the server without waiting
    pub fn drain_commands(&mut self) -> Vec<AgentCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.outbound_rx.try_recv() {
            commands.push(command);
        }
        commands
    }

    fn push(&self, item: InboundItem) -> bool {
        match &self.inbound_tx {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

/// Create an in-process listener and the connector that feeds it
pub fn listener(local_addr: SocketAddr) -> (MemoryListener, MemoryConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryListener {
            local_addr,
            incoming: Mutex::new(rx),
        },
        MemoryConnector { tx },
    )
}

/// In-process listener
#[derive(Debug)]
pub struct MemoryListener {
    local_addr: SocketAddr,
    incoming: Mutex<mpsc::UnboundedReceiver<MemoryTransport>>,
}

#[async_trait]
impl TransportListener for MemoryListener {
    type Transport = MemoryTransport;

    async fn accept(&self) -> TransportResult<(Self::Transport, SocketAddr)> {
        match self.incoming.lock().await.recv().await {
            Some(transport) => {
                let remote = transport.remote_address();
                Ok((transport, remote))
            }
            // Every connector dropped
            None => Err(TransportError::StreamClosed),
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }
}

/// Opens in-process streams to a [`MemoryListener`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<MemoryTransport>,
}

impl MemoryConnector {
    pub fn connect(&self, remote_addr: SocketAddr) -> TransportResult<MemoryPeer> {
        let (transport, peer) = pair(remote_addr);
        self.tx
            .send(transport)
            .map_err(|_| TransportError::ConnectionError("Listener dropped".to_string()))?;
        Ok(peer)
    }
}
