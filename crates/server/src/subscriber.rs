//! Per-subscriber transport task.
//!
//! Each WebSocket connection gets one task that drains the fabric queue
//! into the socket, reads client messages, and keeps the connection alive
//! with periodic pings. The fabric never touches the socket: all I/O lives
//! here, behind the bounded queue.
//!
//! Keepalive: a ping goes out every `ping_interval_ms`; a subscriber that
//! has not ponged by the next interval is forcibly closed.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use furlong_wire::{decode_client_message, ClientMessage, WireMessage};

use crate::broadcast::Encoding;
use crate::Engine;

/// Connection parameters negotiated via the query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    pub mode: Encoding,
    pub binary: bool,
}

impl ConnectParams {
    /// Parse `mode` and `binary` query values; anything unrecognized falls
    /// back to plain text.
    pub fn from_query(mode: Option<&str>, binary: Option<&str>) -> Self {
        let mode = match mode {
            Some("delta") => Encoding::Delta,
            _ => Encoding::Plain,
        };
        let binary = matches!(binary, Some("1") | Some("true"));
        Self { mode, binary }
    }
}

/// Drive one subscriber connection until it drops.
pub async fn serve_socket(socket: WebSocket, engine: Arc<Engine>, params: ConnectParams) {
    let (handle, mut outbound) = engine.fabric.subscribe(params.mode, params.binary);
    let buffered = handle.buffered_bytes();
    let subscriber_id = handle.id;

    let (mut sink, mut stream) = socket.split();

    let mut ping = tokio::time::interval(Duration::from_millis(engine.options.ping_interval_ms));
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first interval tick fires immediately; skip it so the pong window
    // starts one full period out.
    ping.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(message) = queued else {
                    // Fabric dropped us (critical-frame overflow or engine
                    // shutdown).
                    break;
                };
                let len = message.len();
                let ws_message = match message {
                    WireMessage::Text(text) => Message::Text(text),
                    WireMessage::Binary(bytes) => Message::Binary(bytes),
                };
                let sent = sink.send(ws_message).await;
                buffered.fetch_sub(len, Ordering::Relaxed);
                if sent.is_err() {
                    break;
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_text(&engine, &handle, &text);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        // Clients have no binary upstream surface.
                    }
                    Some(Err(e)) => {
                        debug!(subscriber = subscriber_id, error = %e, "socket error");
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if awaiting_pong {
                    warn!(subscriber = subscriber_id, "pong timeout, closing");
                    break;
                }
                awaiting_pong = true;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    engine.fabric.unsubscribe(subscriber_id);
}

fn handle_client_text(
    engine: &Engine,
    handle: &crate::broadcast::SubscriberHandle,
    text: &str,
) {
    match decode_client_message(text) {
        Ok(ClientMessage::SyncRequest { race_id, from_tick }) => {
            engine
                .fabric
                .handle_sync_request(handle, &race_id, from_tick, std::time::Instant::now());
        }
        Err(e) => {
            debug!(subscriber = handle.id, error = %e, "unparseable client message");
        }
    }
}
