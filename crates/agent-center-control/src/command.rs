//! Command dispatch
//!
//! A [`Command`] is a single outbound frame plus a one-shot completion
//! signal. The dispatch caller keeps the [`CommandReceipt`]; the session's
//! sender task consumes the command, writes it and completes it. Because
//! `complete` consumes the command and dropping an uncompleted command
//! resolves the receipt with [`DispatchError::SessionClosed`], the signal
//! fires exactly once whatever happens to the session.

use std::sync::Arc;
use std::time::Duration;

use agent_center_proto::AgentCommand;
use agent_center_transport::TransportError;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::registry::ConnectionRegistry;

/// Default caller-side wait for a command to be written
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors observed by dispatch callers
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Agent {0} is not connected")]
    AgentNotFound(String),

    #[error("Session closed before the command was delivered")]
    SessionClosed,

    #[error("Timed out after {0:?} waiting for delivery")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Message accepted by a session's sender task
#[derive(Debug)]
pub enum SessionMessage {
    /// Write the command to the agent
    Deliver(Command),
    /// Close the session
    Close,
}

/// One outbound frame awaiting delivery
#[derive(Debug)]
pub struct Command {
    payload: AgentCommand,
    ready: oneshot::Sender<Result<(), TransportError>>,
}

impl Command {
    pub fn new(payload: AgentCommand) -> (Self, CommandReceipt) {
        let (ready, rx) = oneshot::channel();
        (Self { payload, ready }, CommandReceipt { rx })
    }

    pub fn payload(&self) -> &AgentCommand {
        &self.payload
    }

    /// Fire the completion signal with the write outcome
    pub fn complete(self, result: Result<(), TransportError>) {
        if self.ready.send(result).is_err() {
            debug!("Command completed after its caller stopped waiting");
        }
    }
}

/// Caller's handle on a dispatched command
#[derive(Debug)]
pub struct CommandReceipt {
    rx: oneshot::Receiver<Result<(), TransportError>>,
}

impl CommandReceipt {
    /// Wait for the completion signal
    ///
    /// `Ok(())` means the transport accepted the frame; it is not an
    /// acknowledgement from the agent itself.
    pub async fn wait(self) -> Result<(), DispatchError> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DispatchError::Transport(e)),
            Err(_) => Err(DispatchError::SessionClosed),
        }
    }
}

/// Caller-facing entry point for sending commands to connected agents
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `payload` to `agent_id` and wait for the write outcome
    ///
    /// The whole exchange, including waiting for a mailbox slot, is bounded
    /// by `timeout`. A timed-out command may still be written later; callers
    /// that need certainty must redispatch after the agent reconnects.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        payload: AgentCommand,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        let connection = self
            .registry
            .get(agent_id)
            .ok_or_else(|| DispatchError::AgentNotFound(agent_id.to_string()))?;

        let delivery = async {
            let receipt = connection.send_command(payload).await?;
            receipt.wait().await
        };

        match tokio::time::timeout(timeout, delivery).await {
            Ok(result) => {
                if let Err(ref e) = result {
                    warn!(agent_id = %agent_id, "Command dispatch failed: {}", e);
                }
                result
            }
            Err(_) => {
                warn!(agent_id = %agent_id, "Command dispatch timed out after {:?}", timeout);
                Err(DispatchError::Timeout(timeout))
            }
        }
    }

    /// Ask the agent's session to close
    pub async fn close(&self, agent_id: &str, timeout: Duration) -> Result<(), DispatchError> {
        let connection = self
            .registry
            .get(agent_id)
            .ok_or_else(|| DispatchError::AgentNotFound(agent_id.to_string()))?;

        tokio::time::timeout(timeout, connection.request_close())
            .await
            .map_err(|_| DispatchError::Timeout(timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_ok() {
        let (command, receipt) = Command::new(AgentCommand::control(1));
        command.complete(Ok(()));
        assert!(receipt.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_complete_with_transport_error() {
        let (command, receipt) = Command::new(AgentCommand::control(1));
        command.complete(Err(TransportError::StreamClosed));
        assert!(matches!(
            receipt.wait().await,
            Err(DispatchError::Transport(TransportError::StreamClosed))
        ));
    }

    #[tokio::test]
    async fn test_dropped_command_resolves_receipt() {
        let (command, receipt) = Command::new(AgentCommand::control(1));
        drop(command);
        assert!(matches!(
            receipt.wait().await,
            Err(DispatchError::SessionClosed)
        ));
    }

    #[test]
    fn test_complete_after_caller_gone_does_not_panic() {
        let (command, receipt) = Command::new(AgentCommand::control(1));
        drop(receipt);
        command.complete(Ok(()));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_agent() {
        let dispatcher = CommandDispatcher::new(Arc::new(ConnectionRegistry::new()));
        let result = dispatcher
            .dispatch("ghost", AgentCommand::control(1), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(DispatchError::AgentNotFound(id)) if id == "ghost"));

        let result = dispatcher.close("ghost", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(DispatchError::AgentNotFound(_))));
    }
}
