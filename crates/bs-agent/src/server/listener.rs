//! JSON-lines TCP listener
//!
//! Each accepted stream is one logical connection with a fresh identity.
//! Admission, key issue and queue relinking happen before the first request
//! is read; unregistering and resource cleanup happen when the stream ends.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use bs_core::rpc::{to_line, RpcEvent, RpcRequest, RpcResponse, ServerMessage};
use bs_core::{ConnectionId, ErrorKind};

use super::handler::handle_request;
use crate::state::AgentState;

/// Agent listener for client connections
pub struct AgentServer {
    /// Address to bind
    pub address: String,
    state: Arc<AgentState>,
    shutdown_token: CancellationToken,
    connections: TaskTracker,
}

impl AgentServer {
    pub fn new(address: String, state: Arc<AgentState>) -> Self {
        Self {
            address,
            state,
            shutdown_token: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Set the shutdown token (call before run)
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = token;
        self
    }

    /// Bind and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind agent listener to {}", self.address))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    ///
    /// Returns once every connection has run its disconnect cleanup.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("Listener has no local address")?;
        tracing::info!("Agent listening on {}", local);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let state = Arc::clone(&self.state);
                        let cancel = self.shutdown_token.clone();
                        self.connections.spawn(async move {
                            if let Err(e) = handle_client(stream, peer_addr, state, cancel).await {
                                tracing::warn!("Client {} error: {:#}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                    }
                },
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Agent listener shutting down");
                    break;
                }
            }
        }

        self.connections.close();
        if !self.connections.is_empty() {
            tracing::info!("Waiting for {} connections to close", self.connections.len());
        }
        self.connections.wait().await;
        Ok(())
    }
}

async fn send<T: Serialize>(writer: &mut OwnedWriteHalf, message: &T) -> Result<()> {
    let line = to_line(message)?;
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<AgentState>,
    cancel: CancellationToken,
) -> Result<()> {
    let id = ConnectionId::generate();
    let (reader, mut writer) = stream.into_split();

    if !state.connections.register(&id) {
        tracing::warn!(
            "Rejected connection from {}: {} of {} slots in use",
            peer_addr,
            state.connections.active_count(),
            state.connections.capacity()
        );
        let rejected = RpcEvent::Rejected {
            reason: "Maximum number of connections reached".to_string(),
        };
        send(&mut writer, &rejected).await?;
        writer.shutdown().await?;
        return Ok(());
    }
    tracing::info!("Connection {} admitted from {}", id, peer_addr);

    let result = serve_connection(reader, &mut writer, &state, &id, cancel).await;
    on_disconnected(&state, &id).await;
    result
}

async fn serve_connection(
    reader: tokio::net::tcp::OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    state: &AgentState,
    id: &ConnectionId,
    cancel: CancellationToken,
) -> Result<()> {
    let key = state
        .keys
        .issue(id)
        .with_context(|| format!("Failed to issue key for {}", id))?;

    // Subscribe before relinking so no progress from a resumed queue is missed
    let mut progress_rx = state.installer.subscribe();
    if state.installer.setup_connection_id(id) {
        state.installer.advance();
    }

    send(
        writer,
        &RpcEvent::SetEncryptionKey {
            key: key.to_base64(),
        },
    )
    .await?;

    let max_line_len = state.config.upload.max_request_line_len();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_len));

    loop {
        tokio::select! {
            line = lines.next() => match line {
                None => break,
                Some(Ok(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<RpcRequest>(trimmed) {
                        Ok(request) => handle_request(request, state, id).await,
                        Err(e) => RpcResponse::Error {
                            kind: ErrorKind::ValidationError,
                            message: format!("Invalid request: {}", e),
                        },
                    };
                    send(writer, &ServerMessage::from(response)).await?;
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    let response = RpcResponse::Error {
                        kind: ErrorKind::ValidationError,
                        message: format!("Request exceeds {} bytes", max_line_len),
                    };
                    send(writer, &ServerMessage::from(response)).await?;
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
            },

            event = progress_rx.recv() => match event {
                Ok(progress) => {
                    send(writer, &RpcEvent::ReceiveInstallationStatus(progress)).await?;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Connection {} lagged by {} progress events", id, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = cancel.cancelled() => break,
        }
    }

    Ok(())
}

async fn on_disconnected(state: &AgentState, id: &ConnectionId) {
    state.connections.unregister(id);
    state.uploads.cleanup(id).await;
    state.keys.remove(id);
    state.installer.disconnect(id);
    tracing::info!("Connection {} closed", id);
}
