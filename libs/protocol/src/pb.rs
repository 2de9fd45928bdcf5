//! Structured message bodies.
//!
//! Field tags are part of the wire contract; never renumber them.

use serde::{Deserialize, Serialize};

/// Metadata carried by every frame, structured or not.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionHeader {
    /// Id of the session that produced the frame, 0 when server-originated.
    #[prost(uint64, tag = "1")]
    pub session_client_id: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub ip_addr: Vec<u8>,
    /// Gateway instance that encoded the frame.
    #[prost(string, tag = "3")]
    pub origin: String,
}

/// LOGON body on user connections.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogOnEvent {
    #[prost(string, tag = "1")]
    pub token: String,
}

/// LOGON body on theater connections. An empty token requests guest access.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TheaterLogOnEvent {
    #[prost(string, tag = "1")]
    pub room: String,
    #[prost(string, tag = "2")]
    pub token: String,
}

#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub username: String,
    #[prost(string, tag = "3")]
    pub avatar: String,
}

/// What a user is currently doing; today that is only watching a theater.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Activity {
    #[prost(string, tag = "1")]
    pub theater_id: String,
    #[prost(string, tag = "2")]
    pub title: String,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum PersonalState {
    Offline = 0,
    Online = 1,
    Idle = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PersonalStateMsgEvent {
    #[prost(message, optional, tag = "1")]
    pub user: Option<User>,
    #[prost(enumeration = "PersonalState", tag = "2")]
    pub state: i32,
}

/// `activity` is `None` when the user stopped the activity.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PersonalActivityMsgEvent {
    #[prost(message, optional, tag = "1")]
    pub user: Option<User>,
    #[prost(message, optional, tag = "2")]
    pub activity: Option<Activity>,
}

/// Chat payload. Clients fill `message` and `recipient_id`; the gateway
/// stamps the rest before relaying.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMsgEvent {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(string, tag = "3")]
    pub recipient_id: String,
    #[prost(message, optional, tag = "4")]
    pub sender: Option<User>,
    #[prost(message, optional, tag = "5")]
    pub created_at: Option<::prost_types::Timestamp>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FriendRequestAcceptedMsgEvent {
    #[prost(message, optional, tag = "1")]
    pub friend: Option<User>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PlayerState {
    Paused = 0,
    Playing = 1,
}

/// Playback position in seconds plus run state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TheaterVideoPlayer {
    #[prost(double, tag = "1")]
    pub current_time: f64,
    #[prost(enumeration = "PlayerState", tag = "2")]
    pub state: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TheaterMembers {
    #[prost(message, repeated, tag = "1")]
    pub members: Vec<User>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MediaSourceChangedEvent {
    #[prost(string, tag = "1")]
    pub theater_id: String,
    #[prost(string, tag = "2")]
    pub media_source_id: String,
}

impl PersonalStateMsgEvent {
    pub fn new(user: User, state: PersonalState) -> Self {
        Self {
            user: Some(user),
            state: state.into(),
        }
    }
}

impl TheaterVideoPlayer {
    pub fn new(current_time: f64, state: PlayerState) -> Self {
        Self {
            current_time,
            state: state.into(),
        }
    }
}
