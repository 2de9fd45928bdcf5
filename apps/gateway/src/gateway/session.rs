//! One physical client connection.
//!
//! A session owns its socket through the reader and writer tasks spawned by
//! the server. Everything else talks to it through this handle: rooms push
//! frames with [`Session::send`], the read loop hands packets to the room with
//! [`Session::push_event`], and any task may call [`Session::close`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use marquee_common::InstanceId;
use marquee_protocol::pb::{SessionHeader, User};
use marquee_protocol::{Opcode, Packet};
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::auth::AuthResult;
use super::room::{JoinedRoom, RoomClosed, RoomKind};

/// Why a session ended. Maps onto the WebSocket close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientGone,
    IdleTimeout,
    HandshakeFailed,
    Unauthorized,
    RoomUnavailable,
    Shutdown,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            Self::ClientGone => 1000,
            Self::Shutdown => 1001,
            Self::HandshakeFailed => 4002,
            Self::Unauthorized => 4004,
            Self::RoomUnavailable => 4008,
            Self::IdleTimeout => 4009,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientGone => "Session closed",
            Self::Shutdown => "Server shutting down",
            Self::HandshakeFailed => "Invalid logon",
            Self::Unauthorized => "Unauthorized",
            Self::RoomUnavailable => "Room unavailable",
            Self::IdleTimeout => "Heartbeat timeout",
        }
    }
}

pub struct Session {
    id: u64,
    kind: RoomKind,
    origin: InstanceId,
    lifetime: CancellationToken,
    outbound: mpsc::Sender<Bytes>,
    events_tx: Mutex<Option<mpsc::Sender<Packet>>>,
    events_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    auth: OnceLock<AuthResult>,
    room: OnceLock<JoinedRoom>,
    joined: AtomicBool,
    left: AtomicBool,
    closed: AtomicBool,
    close_reason: OnceLock<CloseReason>,
    last_seen: Mutex<Instant>,
}

impl Session {
    /// Create a session whose lifetime is a child of `parent`.
    ///
    /// Returns the receiving end of the outbound queue; whoever owns the
    /// socket drains it.
    pub fn new(
        id: u64,
        kind: RoomKind,
        origin: InstanceId,
        parent: &CancellationToken,
        outbound_capacity: usize,
        event_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (outbound, outbound_rx) = mpsc::channel(outbound_capacity);
        let (events_tx, events_rx) = mpsc::channel(event_capacity);

        let session = Arc::new(Self {
            id,
            kind,
            origin,
            lifetime: parent.child_token(),
            outbound,
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            auth: OnceLock::new(),
            room: OnceLock::new(),
            joined: AtomicBool::new(false),
            left: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            last_seen: Mutex::new(Instant::now()),
        });
        (session, outbound_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    /// Instance this session is connected to.
    pub fn origin(&self) -> &InstanceId {
        &self.origin
    }

    /// Cancelled when the session closes or the server shuts down.
    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.lifetime.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn auth(&self) -> Option<&AuthResult> {
        self.auth.get()
    }

    /// Record the handshake result. Returns `false` if one was already set.
    pub fn set_auth(&self, result: AuthResult) -> bool {
        self.auth.set(result).is_ok()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.get().is_some()
    }

    pub fn identity(&self) -> Option<&User> {
        self.auth.get().and_then(|a| a.identity())
    }

    /// Data-service credential of an identified session.
    pub fn credential(&self) -> Option<&str> {
        self.auth.get().and_then(|a| a.token())
    }

    pub fn is_guest(&self) -> bool {
        self.auth.get().is_some_and(|a| a.is_guest())
    }

    pub fn room(&self) -> Option<&JoinedRoom> {
        self.room.get()
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    /// Record an inbound keepalive.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Queue a frame for the socket. Never blocks: when the peer is not
    /// keeping up the frame is dropped.
    pub fn send(&self, frame: Bytes) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session_id = self.id, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn server_header(&self) -> SessionHeader {
        SessionHeader {
            session_client_id: 0,
            ip_addr: Vec::new(),
            origin: self.origin.to_string(),
        }
    }

    pub fn send_empty(&self, opcode: Opcode) -> bool {
        match marquee_protocol::encode_empty(opcode, &self.server_header()) {
            Ok(frame) => self.send(frame),
            Err(err) => {
                tracing::error!(%err, %opcode, "failed to encode frame");
                false
            }
        }
    }

    pub fn send_message<M: Message>(&self, opcode: Opcode, body: &M) -> bool {
        match marquee_protocol::encode(opcode, &self.server_header(), body) {
            Ok(frame) => self.send(frame),
            Err(err) => {
                tracing::error!(%err, %opcode, "failed to encode frame");
                false
            }
        }
    }

    /// Hand an inbound packet to the room's event loop, in arrival order.
    ///
    /// Waits while the room is busy but gives up as soon as the session is
    /// cancelled, so a closing session never wedges its read loop.
    pub async fn push_event(&self, packet: Packet) -> bool {
        let Some(tx) = self.events_tx.lock().clone() else {
            return false;
        };
        tokio::select! {
            _ = self.lifetime.cancelled() => false,
            sent = tx.send(packet) => sent.is_ok(),
        }
    }

    /// Join `room` and start its event loop for this session.
    ///
    /// `Err(RoomClosed)` means the room emptied out while we were resolving
    /// it; the caller should resolve a fresh one.
    ///
    /// A session that closed mid-handshake still joins and then leaves at
    /// once, so a room created on its behalf is torn down normally.
    pub async fn enter(self: &Arc<Self>, room: JoinedRoom) -> Result<(), RoomClosed> {
        room.join(self).await?;

        if self.room.set(room.clone()).is_err() {
            tracing::error!(session_id = self.id, "session joined a second room");
            room.leave(self).await;
            return Ok(());
        }

        if let Some(events) = self.events_rx.lock().take() {
            room.spawn_event_loop(self.clone(), events);
        }

        self.joined.store(true, Ordering::SeqCst);
        // close() may have run while join was in flight and seen joined=false.
        if self.closed.load(Ordering::SeqCst) {
            self.leave_room();
        }
        Ok(())
    }

    /// Idempotent teardown. Cancels the lifetime (stopping every task derived
    /// from it), closes the event channel and leaves the room exactly once.
    pub fn close(self: &Arc<Self>, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.close_reason.set(reason);
        tracing::debug!(session_id = self.id, ?reason, "closing session");

        self.lifetime.cancel();
        self.events_tx.lock().take();

        if self.joined.load(Ordering::SeqCst) {
            self.leave_room();
        }
    }

    fn leave_room(self: &Arc<Self>) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(room) = self.room.get().cloned() {
            let session = self.clone();
            tokio::spawn(async move {
                room.leave(&session).await;
            });
        }
    }
}

/// Close `session` once it has gone `idle_timeout` without a keepalive.
pub async fn run_keepalive(session: Arc<Session>, idle_timeout: Duration, check_every: Duration) {
    let mut ticker = time::interval(check_every);
    ticker.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            _ = session.lifetime().cancelled() => break,
            _ = ticker.tick() => {
                if session.idle_for() > idle_timeout {
                    tracing::info!(session_id = session.id(), "keepalive timeout, closing session");
                    session.close(CloseReason::IdleTimeout);
                    break;
                }
            }
        }
    }
}
