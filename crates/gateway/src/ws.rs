//! `GET /ws?token=…` — WebSocket transport for [`Connection`].
//!
//! The socket is split: a writer task drains the connection's outbound
//! channel, and this task reads client frames into the state machine.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::Connection;
use crate::context::ServerContext;
use crate::protocol::Outbound;

const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(ctx): State<Arc<ServerContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, ctx, params.token))
}

async fn serve_socket(socket: WebSocket, ctx: Arc<ServerContext>, token: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let frame = match out {
                Outbound::Message(message) => WsMessage::Text(message.to_json().into()),
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let Ok(conn) = Connection::open(ctx, token.as_deref(), tx).await else {
        let _ = writer.await;
        return;
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => conn.handle_frame(text.as_str()).await,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue, // binary, ping, pong
            Err(e) => {
                debug!(connection_id = %conn.id(), error = %e, "Socket read failed");
                break;
            }
        }
    }

    conn.close().await;
    let _ = writer.await;
}
