// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! JSON-lines messaging gateway.
//!
//! Clients send safety signals, shutdown requests and manual overrides, and
//! receive every state-change event the controller emits.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use obs_core::controller::ObservationSnapshot;
use obs_core::ObsMessage;
use obs_protocol::{
    encode_event, message_to_core, parse_line, snapshot_event, GatewayEvent, GatewayMessage,
    Inbound, TokenValidator,
};

/// Everything a client session needs; cloned once per connection.
#[derive(Clone)]
pub struct GatewayContext {
    pub inbox_tx: mpsc::Sender<ObsMessage>,
    pub events_tx: broadcast::Sender<GatewayEvent>,
    pub snapshot_rx: watch::Receiver<ObservationSnapshot>,
    pub validator: Arc<dyn TokenValidator>,
}

/// Accept clients on an already bound listener until the task is aborted.
pub async fn run_gateway(listener: TcpListener, ctx: GatewayContext) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Gateway listening on {}", addr);
    }

    loop {
        let (socket, peer) = listener.accept().await?;
        info!("Gateway client connected: {}", peer);

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, peer, ctx).await {
                error!("Gateway client {} error: {:?}", peer, e);
            }
        });
    }
}

async fn send_event(writer: &mut OwnedWriteHalf, event: &GatewayEvent) -> std::io::Result<()> {
    let line = encode_event(event)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    ctx: GatewayContext,
) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut events_rx = ctx.events_tx.subscribe();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Gateway client {} disconnected", addr);
                    break;
                };
                if let Some(event) = handle_line(line.trim(), addr, &ctx).await {
                    send_event(&mut writer, &event).await?;
                }
            }
            event = events_rx.recv() => match event {
                Ok(event) => send_event(&mut writer, &event).await?,
                Err(RecvError::Lagged(n)) => {
                    warn!("Gateway client {} missed {} events", addr, n);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}

/// Apply one inbound line and return the reply for the sender, if any.
async fn handle_line(
    trimmed: &str,
    addr: SocketAddr,
    ctx: &GatewayContext,
) -> Option<GatewayEvent> {
    if trimmed.is_empty() {
        return None;
    }

    let envelope = match parse_line(trimmed) {
        Ok(Inbound::Message(envelope)) => envelope,
        Ok(Inbound::Unrecognized(kind)) => {
            debug!("Ignoring message of kind '{}' from {}", kind, addr);
            return None;
        }
        Err(e) => {
            debug!("Ignoring malformed line from {}: {} / {}", addr, trimmed, e);
            return None;
        }
    };

    if let Err(err) = ctx.validator.validate(envelope.token.as_deref()) {
        warn!("Rejected message from {}: {}", addr, err);
        return Some(GatewayEvent::Error {
            message: err.to_string(),
        });
    }

    if matches!(envelope.message, GatewayMessage::GetState) {
        let snapshot = ctx.snapshot_rx.borrow().clone();
        return Some(snapshot_event(&snapshot));
    }

    let msg = message_to_core(&envelope.message)?;
    debug!("Gateway {} -> {:?}", addr, msg);
    if let Err(e) = ctx.inbox_tx.send(msg).await {
        error!("Failed to deliver message to controller: {:?}", e);
        return Some(GatewayEvent::Error {
            message: "Internal error: controller not available".to_string(),
        });
    }
    None
}
