//! WebSocket listener for tenants and workers.
//!
//! Each accepted socket gets a reader (decodes frames, posts events to the
//! gateway) and a writer (drains the connection's outbound channel).

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use futures::stream::{SplitSink, SplitStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use zapdos_wire::{DecodeError, Inbound};

use crate::error::Result;
use crate::gateway::GatewayHandle;
use crate::registry::Outbound;
use crate::types::ConnectionId;

/// Accept WebSocket connections on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    gateway: GatewayHandle,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "websocket listener started");

    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            },
        };

        let gateway = gateway.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            handle_socket(stream, addr, gateway, cancel).await;
        });
    }

    info!("websocket listener stopped");
    Ok(())
}

async fn handle_socket(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: GatewayHandle,
    cancel: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %addr, "websocket handshake failed: {}", e);
            return;
        }
    };

    let id = ConnectionId::new();
    let (write, read) = ws.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    if gateway.open(id.clone(), out_tx).is_err() {
        return;
    }
    debug!(connection = %id, peer = %addr, "socket accepted");

    let writer = tokio::spawn(write_loop(write, out_rx));
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = read_loop(read, &id, &gateway) => {}
    }

    let _ = gateway.close(id);
    // The writer ends once the gateway drops the connection's sender.
    let _ = writer.await;
}

async fn write_loop(
    mut write: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Text(text) => {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    debug!("write error: {}", e);
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = write.send(Message::Close(Some(frame))).await;
                let _ = write.close().await;
                break;
            }
        }
    }
}

async fn read_loop(
    mut read: SplitStream<WebSocketStream<TcpStream>>,
    id: &ConnectionId,
    gateway: &GatewayHandle,
) {
    while let Some(result) = read.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                debug!(connection = %id, "read error: {}", e);
                break;
            }
        };

        let decoded = match &msg {
            Message::Text(text) => decode_text(text.as_str()),
            Message::Binary(data) => decode_binary(data),
            Message::Close(_) => break,
            _ => continue,
        };

        match decoded {
            Ok(message) => {
                trace!(connection = %id, kind = message.kind(), "message received");
                if gateway.message(id.clone(), message).is_err() {
                    break;
                }
            }
            Err(e) => warn!(connection = %id, "undecodable message dropped: {}", e),
        }
    }
}

fn decode_text(text: &str) -> std::result::Result<Inbound, DecodeError> {
    Inbound::from_frame(zapdos_wire::decode_text(text)?)
}

fn decode_binary(data: &[u8]) -> std::result::Result<Inbound, DecodeError> {
    Inbound::from_frame(zapdos_wire::decode_binary(data)?)
}
