//! Per-identity room: presence, friend-state fan-out and direct chat.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use marquee_protocol::pb::{
    Activity, ChatMsgEvent, FriendRequestAcceptedMsgEvent, PersonalActivityMsgEvent, PersonalState,
    PersonalStateMsgEvent, User,
};
use marquee_protocol::{Opcode, Packet};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::fanout::user_channel;
use super::registry::HubRoom;
use super::room::{forward_subscription, Members, RoomClosed};
use super::session::Session;
use super::Gateway;
use crate::services::{bounded, Friend};

/// All sessions of one identity on this instance.
///
/// Presence flips to online on the first session and to offline on the last;
/// the room closes and evicts itself from the hub at that point.
pub struct UserRoom {
    gateway: Arc<Gateway>,
    user_id: String,
    user: Mutex<User>,
    members: Members,
    friends: Mutex<HashMap<String, User>>,
}

impl HubRoom for UserRoom {
    fn is_closed(&self) -> bool {
        self.members.is_closed()
    }

    fn retirement(&self) -> &CancellationToken {
        self.members.retirement()
    }
}

impl UserRoom {
    pub fn new(gateway: Arc<Gateway>, user: User) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            user_id: user.id.clone(),
            user: Mutex::new(user),
            members: Members::new(),
            friends: Mutex::new(HashMap::new()),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn user(&self) -> User {
        self.user.lock().clone()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.members.sessions()
    }

    pub fn friend_ids(&self) -> Vec<String> {
        self.friends.lock().keys().cloned().collect()
    }

    /// Track a new friend. Returns `false` if already known.
    pub fn add_friend(&self, friend: User) -> bool {
        self.friends.lock().insert(friend.id.clone(), friend).is_none()
    }

    /// Queue `frame` on every local session of this identity.
    pub fn broadcast(&self, frame: &Bytes) -> usize {
        self.members.broadcast(frame, None)
    }

    /// Deliver `frame` to every friend, here and on other instances.
    pub async fn publish_to_friends(&self, frame: Bytes) {
        for friend_id in self.friend_ids() {
            self.gateway.deliver_to_user(&friend_id, frame.clone()).await;
        }
    }

    pub async fn join(&self, session: &Arc<Session>) -> Result<(), RoomClosed> {
        let token = session.credential().unwrap_or_default().to_string();
        let admission = self.members.admit(session).await?;

        let friends = self.load_friends(&token).await;
        send_friend_states(session, &friends);

        if admission.first {
            self.set_presence(&token, PersonalState::Online).await;
        }
        drop(admission);

        match self.gateway.bus.subscribe(&user_channel(&self.user_id)).await {
            Ok(subscription) => forward_subscription(session.clone(), subscription),
            Err(err) => {
                tracing::warn!(%err, user_id = %self.user_id, "user channel subscribe failed");
            }
        }

        session.send_empty(Opcode::AUTHORIZED);
        tracing::debug!(session_id = session.id(), user_id = %self.user_id, "joined user room");
        Ok(())
    }

    pub async fn leave(self: &Arc<Self>, session: &Arc<Session>) {
        let departure = self.members.depart(session.id()).await;
        if !departure.last {
            return;
        }

        let token = session.credential().unwrap_or_default();
        self.set_presence(token, PersonalState::Offline).await;
        self.gateway.users.remove(&self.user_id, self);
        self.members.retire();
        drop(departure);
        tracing::debug!(user_id = %self.user_id, "user room closed");
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
                Opcode::NEW_CHAT_MESSAGE => self.relay_chat(&session, &packet).await,
                Opcode::FRIEND_REQUEST_ACCEPTED => self.accept_friend(&session, &packet),
                other => {
                    tracing::trace!(session_id = session.id(), opcode = %other, "ignoring opcode in user room");
                }
            }
        }
    }

    /// Replace the cached profile, tell local sessions and every friend.
    pub async fn update_user(&self, user: User) {
        *self.user.lock() = user.clone();

        let Some(frame) = self.gateway.encode(Opcode::USER_UPDATED, 0, &user) else {
            return;
        };
        self.broadcast(&frame);
        self.publish_to_friends(frame).await;
    }

    /// Tell friends what this user is doing now. `None` clears the activity.
    pub async fn announce_activity(&self, activity: Option<Activity>) {
        let event = PersonalActivityMsgEvent {
            user: Some(self.user()),
            activity,
        };
        if let Some(frame) = self
            .gateway
            .encode(Opcode::PERSONAL_ACTIVITY_CHANGED, 0, &event)
        {
            self.publish_to_friends(frame).await;
        }
    }

    async fn load_friends(&self, token: &str) -> Vec<Friend> {
        let limit = self.gateway.settings.rpc_timeout;
        match bounded(limit, self.gateway.data.get_friends(token)).await {
            Ok(friends) => {
                let mut known = self.friends.lock();
                known.clear();
                known.extend(friends.iter().map(|f| (f.user.id.clone(), f.user.clone())));
                friends
            }
            Err(err) => {
                tracing::warn!(%err, user_id = %self.user_id, "failed to fetch friends");
                Vec::new()
            }
        }
    }

    async fn set_presence(&self, token: &str, state: PersonalState) {
        let limit = self.gateway.settings.rpc_timeout;
        if let Err(err) = bounded(limit, self.gateway.data.update_presence(token, state)).await {
            tracing::warn!(%err, user_id = %self.user_id, ?state, "failed to persist presence");
        }

        let event = PersonalStateMsgEvent::new(self.user(), state);
        if let Some(frame) = self
            .gateway
            .encode(Opcode::PERSONAL_STATE_CHANGED, 0, &event)
        {
            self.publish_to_friends(frame).await;
        }
        tracing::info!(user_id = %self.user_id, ?state, "presence changed");
    }

    async fn relay_chat(&self, session: &Session, packet: &Packet) {
        let msg: ChatMsgEvent = match packet.read_body() {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%err, session_id = session.id(), "dropping unreadable chat message");
                return;
            }
        };
        if msg.recipient_id.is_empty() || msg.message.is_empty() {
            tracing::debug!(session_id = session.id(), "dropping chat message without recipient or content");
            return;
        }

        let token = session.credential().unwrap_or_default();
        let limit = self.gateway.settings.rpc_timeout;
        let persisted = match bounded(
            limit,
            self.gateway
                .data
                .create_message(token, &msg.recipient_id, &msg.message),
        )
        .await
        {
            Ok(persisted) => persisted,
            Err(err) => {
                tracing::warn!(%err, user_id = %self.user_id, "failed to persist chat message");
                return;
            }
        };

        let recipient_id = persisted.recipient_id.clone();
        let event = ChatMsgEvent::from(persisted);
        if let Some(frame) = self
            .gateway
            .encode(Opcode::CHAT_MESSAGES, session.id(), &event)
        {
            self.gateway.deliver_to_user(&recipient_id, frame).await;
        }
    }

    fn accept_friend(&self, session: &Session, packet: &Packet) {
        match packet.read_body::<FriendRequestAcceptedMsgEvent>() {
            Ok(FriendRequestAcceptedMsgEvent { friend: Some(friend) }) => {
                self.add_friend(friend);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(%err, session_id = session.id(), "dropping unreadable friend event");
            }
        }
    }
}

/// Send each friend's current non-offline state to `session` only.
fn send_friend_states(session: &Session, friends: &[Friend]) {
    for friend in friends {
        if friend.state == PersonalState::Offline {
            continue;
        }
        session.send_message(
            Opcode::PERSONAL_STATE_CHANGED,
            &PersonalStateMsgEvent::new(friend.user.clone(), friend.state),
        );
        if let Some(activity) = &friend.activity {
            session.send_message(
                Opcode::PERSONAL_ACTIVITY_CHANGED,
                &PersonalActivityMsgEvent {
                    user: Some(friend.user.clone()),
                    activity: Some(activity.clone()),
                },
            );
        }
    }
}
