//! Watch-party room: membership, playback control and chat.
//!
//! The room's [`PlaybackClock`] is the local truth for position and run
//! state. Control events from identified members are applied and delivered
//! locally, then republished on the theater channel; a room-scoped follower
//! applies control events published by other instances, so every instance
//! converges on the last write it observed.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use chrono::Utc;
use marquee_common::prefixed_ulid;
use marquee_protocol::pb::{
    ChatMsgEvent, MediaSourceChangedEvent, PersonalState, PersonalStateMsgEvent, TheaterMembers,
    TheaterVideoPlayer, User,
};
use marquee_protocol::{Opcode, Packet};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::fanout::{theater_channel, Subscription};
use super::playback::{ClockSnapshot, PlaybackClock};
use super::presence::ViewerRegistry;
use super::registry::HubRoom;
use super::room::{forward_subscription, Members, RoomClosed};
use super::session::Session;
use super::Gateway;
use crate::services::{bounded, timestamp, ServiceError, Theater};

pub struct TheaterRoom {
    gateway: Arc<Gateway>,
    theater_id: String,
    theater: Mutex<Theater>,
    members: Members,
    viewers: ViewerRegistry,
    clock: PlaybackClock,
    /// Serializes set-position + toggle pairs so each control event applies
    /// atomically.
    control: Mutex<()>,
    /// Cancelled when the room closes; parent of the clock ticker and the
    /// channel follower.
    lifetime: CancellationToken,
}

impl HubRoom for TheaterRoom {
    fn is_closed(&self) -> bool {
        self.members.is_closed()
    }

    fn retirement(&self) -> &CancellationToken {
        self.members.retirement()
    }
}

impl TheaterRoom {
    /// Fetch the theater and build its room. Called at most once per
    /// creation by the hub.
    pub async fn open(
        gateway: Arc<Gateway>,
        theater_id: String,
        token: Option<String>,
    ) -> Result<Arc<Self>, ServiceError> {
        let limit = gateway.settings.rpc_timeout;
        let theater = bounded(limit, gateway.data.get_theater(&theater_id, token.as_deref())).await?;

        let lifetime = gateway.shutdown.child_token();
        let clock = PlaybackClock::new(lifetime.clone(), gateway.settings.clock_tick);
        let room = Arc::new(Self {
            gateway: gateway.clone(),
            theater_id,
            theater: Mutex::new(theater),
            members: Members::new(),
            viewers: ViewerRegistry::new(),
            clock,
            control: Mutex::new(()),
            lifetime: lifetime.clone(),
        });

        match gateway.bus.subscribe(&theater_channel(&room.theater_id)).await {
            Ok(subscription) => {
                tokio::spawn(follow(Arc::downgrade(&room), subscription, lifetime));
            }
            Err(err) => {
                tracing::warn!(%err, theater_id = %room.theater_id, "theater follower subscribe failed");
            }
        }

        tracing::info!(theater_id = %room.theater_id, "theater room opened");
        Ok(room)
    }

    pub fn theater_id(&self) -> &str {
        &self.theater_id
    }

    pub fn theater(&self) -> Theater {
        self.theater.lock().clone()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.members.sessions()
    }

    /// Identified members, one entry per user.
    pub fn viewers(&self) -> Vec<User> {
        self.viewers.members()
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        self.clock.snapshot()
    }

    pub fn broadcast(&self, frame: &Bytes) -> usize {
        self.members.broadcast(frame, None)
    }

    /// Viewer transitions and their activity updates run under the member
    /// lifecycle lock, so they land in the same order as joins and leaves.
    pub async fn join(&self, session: &Arc<Session>) -> Result<(), RoomClosed> {
        let admission = self.members.admit(session).await?;
        let identity = session.identity().cloned();
        if let Some(user) = &identity {
            match self.gateway.bus.subscribe(&theater_channel(&self.theater_id)).await {
                Ok(subscription) => forward_subscription(session.clone(), subscription),
                Err(err) => {
                    tracing::warn!(%err, theater_id = %self.theater_id, "theater channel subscribe failed");
                }
            }
            if self.viewers.add(user) {
                self.announce_member(user, PersonalState::Online, Some(session.id()));
                self.set_watching(session, user, true).await;
            }
        }
        drop(admission);

        session.send_empty(Opcode::AUTHORIZED);
        session.send_message(
            Opcode::THEATER_MEMBERS,
            &TheaterMembers {
                members: self.viewers.members(),
            },
        );
        tracing::debug!(
            session_id = session.id(),
            theater_id = %self.theater_id,
            guest = identity.is_none(),
            "joined theater room"
        );
        Ok(())
    }

    pub async fn leave(self: &Arc<Self>, session: &Arc<Session>) {
        let departure = self.members.depart(session.id()).await;
        if !departure.was_member {
            return;
        }

        if let Some(user) = session.identity() {
            if self.viewers.remove(&user.id) {
                self.announce_member(user, PersonalState::Offline, None);
                self.set_watching(session, user, false).await;
            }
        }

        if departure.last {
            self.clock.pause();
            self.lifetime.cancel();
            self.gateway.theaters.remove(&self.theater_id, self);
            self.members.retire();
            tracing::info!(theater_id = %self.theater_id, "theater room closed");
        }
    }

    pub async fn handle_events(self: Arc<Self>, session: Arc<Session>, mut events: mpsc::Receiver<Packet>) {
        loop {
            let packet = tokio::select! {
                _ = session.lifetime().cancelled() => break,
                packet = events.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };

            match packet.opcode() {
                Opcode::THEATER_PLAY | Opcode::THEATER_PAUSE | Opcode::THEATER_SEEK => {
                    self.control(&session, &packet).await;
                }
                Opcode::SYNC_ME => {
                    session.send_message(Opcode::SYNCED, &self.clock.snapshot().to_player());
                }
                Opcode::NEW_CHAT_MESSAGE => self.chat(&session, &packet).await,
                other => {
                    tracing::trace!(session_id = session.id(), opcode = %other, "ignoring opcode in theater room");
                }
            }
        }
    }

    /// Re-fetch the theater after its media source changed, rewind the clock
    /// and tell local sessions.
    pub async fn change_media_source(&self, token: Option<&str>) -> Result<usize, ServiceError> {
        let limit = self.gateway.settings.rpc_timeout;
        let theater = bounded(limit, self.gateway.data.get_theater(&self.theater_id, token)).await?;
        let event = MediaSourceChangedEvent {
            theater_id: self.theater_id.clone(),
            media_source_id: theater.media_source_id.clone().unwrap_or_default(),
        };
        *self.theater.lock() = theater;
        self.clock.end();

        let delivered = self
            .gateway
            .encode(Opcode::THEATER_MEDIA_SOURCE_CHANGED, 0, &event)
            .map(|frame| self.broadcast(&frame))
            .unwrap_or(0);
        tracing::info!(theater_id = %self.theater_id, media_source_id = %event.media_source_id, "media source changed");
        Ok(delivered)
    }

    /// Apply one control event to the clock and return the resulting state.
    fn apply_control(&self, opcode: Opcode, position: f64) -> ClockSnapshot {
        let _ordered = self.control.lock();
        match opcode {
            Opcode::THEATER_PLAY => {
                self.clock.set_position(position);
                self.clock.play();
            }
            Opcode::THEATER_PAUSE => {
                // Stop the ticker first so it cannot advance past `position`.
                self.clock.pause();
                self.clock.set_position(position);
            }
            _ => self.clock.set_position(position),
        }
        self.clock.snapshot()
    }

    async fn control(&self, session: &Session, packet: &Packet) {
        let player: TheaterVideoPlayer = match packet.read_body() {
            Ok(player) => player,
            Err(err) => {
                tracing::debug!(%err, session_id = session.id(), "dropping unreadable control event");
                return;
            }
        };

        if session.identity().is_none() {
            tracing::debug!(session_id = session.id(), "guests cannot control playback");
            return;
        }

        let opcode = packet.opcode();
        let snapshot = self.apply_control(opcode, player.current_time);
        tracing::debug!(
            theater_id = %self.theater_id,
            %opcode,
            position = snapshot.position,
            running = snapshot.running,
            "playback control"
        );

        if let Some(frame) = self.gateway.encode(opcode, session.id(), &snapshot.to_player()) {
            self.fan_out(frame).await;
        }
    }

    async fn chat(&self, session: &Session, packet: &Packet) {
        let Some(user) = session.identity() else {
            tracing::debug!(session_id = session.id(), "guests cannot chat");
            return;
        };
        let mut msg: ChatMsgEvent = match packet.read_body() {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%err, session_id = session.id(), "dropping unreadable chat message");
                return;
            }
        };
        if msg.message.is_empty() {
            return;
        }

        msg.id = prefixed_ulid("tmsg");
        msg.recipient_id = self.theater_id.clone();
        msg.sender = Some(user.clone());
        msg.created_at = Some(timestamp(Utc::now()));

        if let Some(frame) = self.gateway.encode(Opcode::CHAT_MESSAGES, session.id(), &msg) {
            self.fan_out(frame).await;
        }
    }

    /// Deliver to every local member, then publish for other instances.
    async fn fan_out(&self, frame: Bytes) {
        self.members.broadcast(&frame, None);
        self.gateway
            .publish(&theater_channel(&self.theater_id), frame)
            .await;
    }

    fn announce_member(&self, user: &User, state: PersonalState, except: Option<u64>) {
        let event = PersonalStateMsgEvent::new(user.clone(), state);
        if let Some(frame) = self.gateway.encode(Opcode::MEMBER_STATE_CHANGED, 0, &event) {
            self.members.broadcast(&frame, except);
        }
    }

    /// Persist the "currently watching" activity and tell the user's friends
    /// when their user room lives on this instance.
    async fn set_watching(&self, session: &Session, user: &User, watching: bool) {
        let Some(token) = session.credential() else {
            return;
        };
        let limit = self.gateway.settings.rpc_timeout;
        let data = &self.gateway.data;

        let activity = self.theater.lock().activity();
        let result = if watching {
            bounded(limit, data.update_activity(token, &activity)).await
        } else {
            bounded(limit, data.remove_activity(token)).await
        };
        if let Err(err) = result {
            tracing::warn!(%err, user_id = %user.id, watching, "failed to update activity");
        }

        if let Some(user_room) = self.gateway.users.find(&user.id) {
            user_room
                .announce_activity(watching.then_some(activity))
                .await;
        }
    }

    /// Handle one frame from the theater channel.
    fn on_channel_frame(&self, frame: Bytes) {
        let packet = match Packet::decode(frame.clone()) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::debug!(%err, theater_id = %self.theater_id, "ignoring malformed channel frame");
                return;
            }
        };
        if self.gateway.is_local(packet.header()) {
            return;
        }

        // Guests have no subscription of their own.
        for session in self.members.sessions() {
            if session.is_guest() {
                session.send(frame.clone());
            }
        }

        let opcode = packet.opcode();
        if matches!(
            opcode,
            Opcode::THEATER_PLAY | Opcode::THEATER_PAUSE | Opcode::THEATER_SEEK
        ) {
            match packet.read_body::<TheaterVideoPlayer>() {
                Ok(player) => {
                    self.apply_control(opcode, player.current_time);
                }
                Err(err) => {
                    tracing::debug!(%err, theater_id = %self.theater_id, "ignoring unreadable remote control");
                }
            }
        }
    }
}

async fn follow(room: Weak<TheaterRoom>, mut subscription: Subscription, lifetime: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = lifetime.cancelled() => break,
            frame = subscription.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let Some(room) = room.upgrade() else {
            break;
        };
        room.on_channel_frame(frame);
    }
}
