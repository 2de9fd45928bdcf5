//! Logon parsing and the one-shot authentication step.

use std::time::Duration;

use marquee_protocol::pb::{LogOnEvent, TheaterLogOnEvent, User};
use marquee_protocol::{FrameError, Packet};
use thiserror::Error;

use super::room::RoomKind;
use crate::services::{bounded, DataService, ServiceError};

/// The logon body, typed by the endpoint the client connected to.
#[derive(Debug, Clone)]
pub enum LogOn {
    User(LogOnEvent),
    Theater(TheaterLogOnEvent),
}

impl LogOn {
    pub fn read(kind: RoomKind, packet: &Packet) -> Result<Self, FrameError> {
        Ok(match kind {
            RoomKind::User => Self::User(packet.read_body()?),
            RoomKind::Theater => Self::Theater(packet.read_body()?),
        })
    }

    pub fn token(&self) -> &str {
        match self {
            Self::User(ev) => &ev.token,
            Self::Theater(ev) => &ev.token,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("logon carried no token")]
    MissingToken,

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Result of checking a logon's credentials.
#[derive(Debug)]
pub enum AuthOutcome {
    Authenticated(User),
    Guest,
    Rejected(AuthError),
}

/// Resolve the identity behind `logon`.
///
/// An empty token means guest access, which only theater rooms allow.
pub async fn authenticate(
    data: &dyn DataService,
    limit: Duration,
    kind: RoomKind,
    logon: &LogOn,
) -> AuthOutcome {
    let token = logon.token();
    if token.is_empty() {
        return if kind.allows_guests() {
            AuthOutcome::Guest
        } else {
            AuthOutcome::Rejected(AuthError::MissingToken)
        };
    }

    match bounded(limit, data.authenticate(token)).await {
        Ok(user) => AuthOutcome::Authenticated(user),
        Err(err) => AuthOutcome::Rejected(err.into()),
    }
}

/// What a session proved about itself during the handshake. Set once, never
/// changed.
#[derive(Debug, Clone)]
pub struct AuthResult {
    identity: Option<User>,
    logon: LogOn,
}

impl AuthResult {
    pub fn identified(user: User, logon: LogOn) -> Self {
        Self {
            identity: Some(user),
            logon,
        }
    }

    pub fn guest(logon: LogOn) -> Self {
        Self {
            identity: None,
            logon,
        }
    }

    pub fn identity(&self) -> Option<&User> {
        self.identity.as_ref()
    }

    /// Credential to present to the data service. `None` for guests.
    pub fn token(&self) -> Option<&str> {
        self.identity.as_ref().map(|_| self.logon.token())
    }

    pub fn logon(&self) -> &LogOn {
        &self.logon
    }

    pub fn is_guest(&self) -> bool {
        self.identity.is_none()
    }
}
