//! Single-use WebSocket channel for delivering a cancel command to the agent
//! inside a live sandbox.
//!
//! One call makes at most one round trip: connect, send `{userId, taskId}`,
//! wait for one reply, close. There are no retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use shared_types::{DataIsolation, SandboxStatus};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{HypervisorError, Result};
use crate::gateway::SandboxGateway;

/// The interrupt payload understood by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptCommand {
    pub user_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    AwaitingAck,
    Closed,
}

/// Opens channels to an agent. The WebSocket implementation is [`WsConnector`].
#[async_trait]
pub trait InterruptConnector: Send + Sync {
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Box<dyn InterruptChannel>>;
}

#[async_trait]
pub trait InterruptChannel: Send {
    async fn send(&mut self, payload: String) -> Result<()>;
    /// Next text message, or `None` once the peer has closed.
    async fn receive(&mut self) -> Result<Option<String>>;
    async fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl InterruptConnector for WsConnector {
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Box<dyn InterruptChannel>> {
        let (stream, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| {
                HypervisorError::Transport(format!(
                    "connecting to {url} timed out after {timeout:?}"
                ))
            })??;
        Ok(Box::new(WsChannel { stream }))
    }
}

struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl InterruptChannel for WsChannel {
    async fn send(&mut self, payload: String) -> Result<()> {
        self.stream.send(Message::Text(payload.into())).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                Message::Text(text) => return Ok(Some(text.to_string())),
                Message::Binary(bytes) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

/// One scoped connection to a sandbox.
pub struct InterruptSession {
    sandbox_id: String,
    channel: Option<Box<dyn InterruptChannel>>,
    state: SessionState,
}

impl InterruptSession {
    pub async fn open(
        connector: &dyn InterruptConnector,
        sandbox_id: &str,
        url: &str,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let channel = connector.connect(url, connect_timeout).await.map_err(|e| {
            error!(sandbox_id, url, error = %e, "failed to open interrupt channel");
            e
        })?;
        debug!(sandbox_id, url, "interrupt channel connected");
        Ok(Self {
            sandbox_id: sandbox_id.to_string(),
            channel: Some(channel),
            state: SessionState::Connected,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Send the command and wait up to `ack_timeout` for a single reply.
    pub async fn interrupt(
        &mut self,
        command: &InterruptCommand,
        ack_timeout: Duration,
    ) -> Result<String> {
        let channel = self.channel.as_mut().ok_or_else(|| {
            HypervisorError::IllegalOperation("interrupt session is not connected".to_string())
        })?;

        channel.send(serde_json::to_string(command)?).await?;
        self.state = SessionState::AwaitingAck;

        match tokio::time::timeout(ack_timeout, channel.receive()).await {
            Ok(Ok(Some(reply))) => Ok(reply),
            Ok(Ok(None)) => Err(HypervisorError::Transport(format!(
                "sandbox {} closed the interrupt channel before acknowledging",
                self.sandbox_id
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HypervisorError::InterruptAckTimeout {
                sandbox_id: self.sandbox_id.clone(),
                timeout: ack_timeout,
            }),
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(sandbox_id = %self.sandbox_id, error = %e, "interrupt channel close failed");
            }
        }
        self.state = SessionState::Closed;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// The agent replied to the command.
    Acknowledged { reply: String },
    /// No connection was attempted; the caller should notify the client.
    SandboxNotRunning { status: SandboxStatus },
}

/// Checks sandbox liveness, then runs one [`InterruptSession`].
pub struct InterruptDispatcher {
    gateway: Arc<dyn SandboxGateway>,
    connector: Arc<dyn InterruptConnector>,
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl InterruptDispatcher {
    pub fn new(
        gateway: Arc<dyn SandboxGateway>,
        connector: Arc<dyn InterruptConnector>,
        connect_timeout: Duration,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            connector,
            connect_timeout,
            ack_timeout,
        }
    }

    pub async fn deliver(
        &self,
        isolation: &DataIsolation,
        sandbox_id: &str,
        task_id: &str,
    ) -> Result<InterruptOutcome> {
        let status = self.gateway.get_sandbox_status(sandbox_id).await?;
        if !status.is_running() {
            info!(sandbox_id, task_id, %status, "sandbox not running, skipping interrupt channel");
            return Ok(InterruptOutcome::SandboxNotRunning { status });
        }

        let url = self.gateway.websocket_url(sandbox_id);
        let started = Instant::now();
        let mut session =
            InterruptSession::open(self.connector.as_ref(), sandbox_id, &url, self.connect_timeout)
                .await?;

        let command = InterruptCommand {
            user_id: isolation.user_id.clone(),
            task_id: task_id.to_string(),
        };
        let result = session.interrupt(&command, self.ack_timeout).await;
        session.close().await;

        match result {
            Ok(reply) => {
                info!(
                    sandbox_id,
                    task_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "interrupt acknowledged"
                );
                Ok(InterruptOutcome::Acknowledged { reply })
            }
            Err(e) => {
                warn!(
                    sandbox_id,
                    task_id,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "interrupt delivery failed"
                );
                Err(e)
            }
        }
    }
}
