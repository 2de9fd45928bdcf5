//! Client side of the identity/data service.
//!
//! The gateway never stores users, friends, messages or theaters itself. Every
//! call goes through [`DataService`] and is bounded by [`bounded`].

mod http;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marquee_protocol::pb::{Activity, ChatMsgEvent, PersonalState, User};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpDataService;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("data service call timed out after {0:?}")]
    Timeout(Duration),

    #[error("data service transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("data service rejected the credentials")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("data service returned {status}: {message}")]
    Status { status: u16, message: String },
}

/// A friend as reported by the data service, with their last known presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Friend {
    pub user: User,
    #[serde(default = "offline")]
    pub state: PersonalState,
    #[serde(default)]
    pub activity: Option<Activity>,
}

fn offline() -> PersonalState {
    PersonalState::Offline
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theater {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub media_source_id: Option<String>,
}

impl Theater {
    /// The activity a viewer of this theater advertises to friends.
    pub fn activity(&self) -> Activity {
        Activity {
            theater_id: self.id.clone(),
            title: self.title.clone(),
        }
    }
}

/// A chat message after the data service accepted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub id: String,
    pub content: String,
    pub sender: User,
    pub recipient_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<PersistedMessage> for ChatMsgEvent {
    fn from(msg: PersistedMessage) -> Self {
        ChatMsgEvent {
            id: msg.id,
            message: msg.content,
            recipient_id: msg.recipient_id,
            sender: Some(msg.sender),
            created_at: Some(timestamp(msg.created_at)),
        }
    }
}

pub fn timestamp(at: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

/// Identity/data collaborator.
///
/// Backed by [`HttpDataService`] in production and an in-memory fake in tests.
#[async_trait]
pub trait DataService: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<User, ServiceError>;
    async fn get_friends(&self, token: &str) -> Result<Vec<Friend>, ServiceError>;
    async fn update_presence(&self, token: &str, state: PersonalState) -> Result<(), ServiceError>;
    async fn update_activity(&self, token: &str, activity: &Activity) -> Result<(), ServiceError>;
    async fn remove_activity(&self, token: &str) -> Result<(), ServiceError>;
    async fn create_message(
        &self,
        token: &str,
        recipient_id: &str,
        content: &str,
    ) -> Result<PersistedMessage, ServiceError>;
    async fn get_theater(&self, theater_id: &str, token: Option<&str>) -> Result<Theater, ServiceError>;
}

/// Run a collaborator call with an upper bound on how long it may take.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| ServiceError::Timeout(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bounded_reports_timeout() {
        let limit = Duration::from_secs(10);
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, ServiceError>(())
        };

        let err = bounded(limit, slow).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(d) if d == limit));
    }

    #[test]
    fn friend_defaults_to_offline_without_activity() {
        let friend: Friend = serde_json::from_str(r#"{"user":{"id":"u2","username":"bo"}}"#).unwrap();
        assert_eq!(friend.state, PersonalState::Offline);
        assert!(friend.activity.is_none());
    }

    #[test]
    fn persisted_message_becomes_chat_event() {
        let created_at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let event: ChatMsgEvent = PersistedMessage {
            id: "m1".to_string(),
            content: "hi".to_string(),
            sender: User {
                id: "u1".to_string(),
                ..Default::default()
            },
            recipient_id: "u2".to_string(),
            created_at,
        }
        .into();

        assert_eq!(event.message, "hi");
        assert_eq!(event.sender.unwrap().id, "u1");
        let ts = event.created_at.unwrap();
        assert_eq!(ts.seconds, created_at.timestamp());
        assert_eq!(ts.nanos, 500_000_000);
    }
}
