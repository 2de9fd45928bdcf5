//! WebSocket upgrade endpoints and the per-connection socket loops.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use marquee_protocol::{Opcode, Packet, SUBPROTOCOLS};
use tokio::sync::mpsc;

use crate::AppState;

use super::handler::handle_logon;
use super::room::RoomKind;
use super::session::{run_keepalive, CloseReason, Session};
use super::Gateway;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/user", get(user_upgrade))
        .route("/theater", get(theater_upgrade))
}

async fn user_upgrade(ws: WebSocketUpgrade, headers: HeaderMap, State(state): State<AppState>) -> Response {
    upgrade(ws, &headers, state, RoomKind::User)
}

async fn theater_upgrade(ws: WebSocketUpgrade, headers: HeaderMap, State(state): State<AppState>) -> Response {
    upgrade(ws, &headers, state, RoomKind::Theater)
}

fn upgrade(ws: WebSocketUpgrade, headers: &HeaderMap, state: AppState, kind: RoomKind) -> Response {
    let Some(protocol) = negotiate(headers) else {
        tracing::debug!(?kind, "rejecting upgrade without a supported subprotocol");
        return (StatusCode::BAD_REQUEST, "unsupported websocket subprotocol").into_response();
    };

    let gateway = state.gateway.clone();
    ws.protocols([protocol])
        .on_upgrade(move |socket| handle_connection(socket, gateway, kind))
}

/// First subprotocol the client offered that we speak.
fn negotiate(headers: &HeaderMap) -> Option<&'static str> {
    headers
        .get_all("sec-websocket-protocol")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .find_map(|offered| SUBPROTOCOLS.iter().copied().find(|p| *p == offered))
}

async fn handle_connection(socket: WebSocket, gateway: Arc<Gateway>, kind: RoomKind) {
    let (sink, stream) = socket.split();
    let settings = &gateway.settings;
    let (session, outbound) = Session::new(
        gateway.next_session_id(),
        kind,
        settings.instance_id.clone(),
        &gateway.shutdown,
        settings.outbound_capacity,
        settings.event_capacity,
    );
    tracing::debug!(session_id = session.id(), ?kind, "connection accepted");

    let writer = tokio::spawn(write_frames(sink, outbound, session.clone()));
    tokio::spawn(run_keepalive(
        session.clone(),
        settings.idle_timeout,
        settings.keepalive_check,
    ));

    read_frames(&gateway, &session, stream).await;

    let reason = if gateway.shutdown.is_cancelled() {
        CloseReason::Shutdown
    } else {
        CloseReason::ClientGone
    };
    session.close(reason);
    let _ = writer.await;

    tracing::debug!(
        session_id = session.id(),
        reason = session.close_reason().map(CloseReason::as_str).unwrap_or("unknown"),
        "connection ended"
    );
}

async fn read_frames(gateway: &Arc<Gateway>, session: &Arc<Session>, mut stream: SplitStream<WebSocket>) {
    let mut logon_started = false;
    loop {
        let msg = tokio::select! {
            _ = session.lifetime().cancelled() => break,
            msg = stream.next() => msg,
        };

        match msg {
            Some(Ok(Message::Binary(data))) => {
                on_frame(gateway, session, data, &mut logon_started).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                tracing::debug!(%err, session_id = session.id(), "ws read error");
                break;
            }
        }
    }
}

/// The handshake runs on its own task so keepalives are answered while it
/// waits on the data service. Only the first LOGON starts one.
async fn on_frame(gateway: &Arc<Gateway>, session: &Arc<Session>, data: Bytes, logon_started: &mut bool) {
    let packet = match Packet::decode(data) {
        Ok(packet) => packet,
        Err(err) => {
            tracing::debug!(%err, session_id = session.id(), "dropping malformed frame");
            return;
        }
    };
    if !packet.is_structured() {
        tracing::debug!(session_id = session.id(), opcode = %packet.opcode(), "dropping unstructured frame");
        return;
    }

    match packet.opcode() {
        Opcode::PING => {
            session.touch();
            session.send_empty(Opcode::PONG);
        }
        Opcode::LOGON if !*logon_started => {
            *logon_started = true;
            let gateway = gateway.clone();
            let session = session.clone();
            tokio::spawn(async move { handle_logon(&gateway, &session, &packet).await });
        }
        opcode if session.is_joined() => {
            if !session.push_event(packet).await {
                tracing::trace!(session_id = session.id(), %opcode, "event dropped on closing session");
            }
        }
        opcode => {
            tracing::debug!(session_id = session.id(), %opcode, "dropping frame before join");
        }
    }
}

/// Drain the outbound queue into the socket, then send the close frame.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Bytes>,
    session: Arc<Session>,
) {
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if sink.send(Message::Binary(frame)).await.is_err() {
                        session.close(CloseReason::ClientGone);
                        return;
                    }
                }
                None => break,
            },
            _ = session.lifetime().cancelled() => break,
        }
    }

    let reason = session.close_reason().unwrap_or(CloseReason::Shutdown);
    let close = Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: reason.as_str().into(),
    }));
    let _ = sink.send(close).await;
    let _ = sink.close().await;
}
