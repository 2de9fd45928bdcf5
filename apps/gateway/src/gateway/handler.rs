//! Logon handshake: authenticate once, then resolve and enter the room.

use std::sync::Arc;

use marquee_protocol::{Opcode, Packet};
use thiserror::Error;

use super::auth::{authenticate, AuthOutcome, AuthResult, LogOn};
use super::room::{JoinedRoom, RoomKind};
use super::session::{CloseReason, Session};
use super::theater_room::TheaterRoom;
use super::user_room::UserRoom;
use super::Gateway;
use crate::services::ServiceError;

/// Attempts to find an open room before giving up. A room only closes when
/// it empties, so losing this race more than a couple of times means heavy
/// join/leave churn on one key.
const JOIN_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("session has no identity")]
    NotAuthenticated,

    #[error("theater unavailable: {0}")]
    Theater(#[from] ServiceError),

    #[error("room kept closing under the join")]
    Contended,
}

/// Handle the first LOGON of a session. Any failure closes the session with
/// the matching reason; the caller just keeps reading until the socket ends.
pub async fn handle_logon(gateway: &Arc<Gateway>, session: &Arc<Session>, packet: &Packet) {
    let kind = session.kind();
    let logon = match LogOn::read(kind, packet) {
        Ok(logon) => logon,
        Err(err) => {
            tracing::debug!(%err, session_id = session.id(), "unreadable logon");
            session.close(CloseReason::HandshakeFailed);
            return;
        }
    };
    if let LogOn::Theater(ev) = &logon {
        if ev.room.is_empty() {
            tracing::debug!(session_id = session.id(), "theater logon without a room");
            session.close(CloseReason::HandshakeFailed);
            return;
        }
    }

    let limit = gateway.settings.rpc_timeout;
    let result = match authenticate(gateway.data.as_ref(), limit, kind, &logon).await {
        AuthOutcome::Authenticated(user) => AuthResult::identified(user, logon),
        AuthOutcome::Guest => AuthResult::guest(logon),
        AuthOutcome::Rejected(err) => {
            tracing::info!(%err, session_id = session.id(), "logon rejected");
            session.send_empty(Opcode::UNAUTHORIZED);
            session.close(CloseReason::Unauthorized);
            return;
        }
    };
    if !session.set_auth(result) {
        tracing::warn!(session_id = session.id(), "duplicate logon ignored");
        return;
    }

    if let Err(err) = join_room(gateway, session).await {
        tracing::warn!(%err, session_id = session.id(), "could not join room");
        session.close(CloseReason::RoomUnavailable);
        return;
    }

    tracing::info!(
        session_id = session.id(),
        user_id = session.identity().map(|u| u.id.as_str()).unwrap_or("guest"),
        room = ?kind,
        "session established"
    );
}

async fn join_room(gateway: &Arc<Gateway>, session: &Arc<Session>) -> Result<(), JoinError> {
    for _ in 0..JOIN_ATTEMPTS {
        let room = resolve(gateway, session).await?;
        if session.enter(room).await.is_ok() {
            return Ok(());
        }
        tracing::debug!(session_id = session.id(), "room closed under join, retrying");
    }
    Err(JoinError::Contended)
}

/// Find or create the room this session belongs in.
async fn resolve(gateway: &Arc<Gateway>, session: &Session) -> Result<JoinedRoom, JoinError> {
    let auth = session.auth().ok_or(JoinError::NotAuthenticated)?;

    match (session.kind(), auth.logon()) {
        (RoomKind::Theater, LogOn::Theater(ev)) => {
            let token = auth.token().map(str::to_string);
            let room = gateway
                .theaters
                .get_or_create(&ev.room, || {
                    TheaterRoom::open(gateway.clone(), ev.room.clone(), token.clone())
                })
                .await?;
            Ok(JoinedRoom::Theater(room))
        }
        _ => {
            let user = auth.identity().ok_or(JoinError::NotAuthenticated)?;
            let room = gateway
                .users
                .get_or_create(&user.id, || {
                    let room = UserRoom::new(gateway.clone(), user.clone());
                    async move { Ok::<_, JoinError>(room) }
                })
                .await?;
            Ok(JoinedRoom::User(room))
        }
    }
}
