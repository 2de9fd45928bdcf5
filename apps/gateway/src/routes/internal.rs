//! Control-plane endpoints the rest of the platform calls to push events into
//! rooms hosted on this instance.

use axum::extract::{FromRequestParts, Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::routing::post;
use axum::{Json, Router};
use marquee_protocol::pb::{FriendRequestAcceptedMsgEvent, User};
use marquee_protocol::Opcode;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::services::bounded;
use crate::AppState;

const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users/{user_id}/notifications", post(notify_user))
        .route("/users/{user_id}/friends", post(friend_accepted))
        .route("/users/{user_id}/updated", post(user_updated))
        .route("/theaters/{theater_id}/updated", post(theater_updated))
        .route("/theaters/{theater_id}/media-source", post(media_source_changed))
}

/// Caller that presented the shared internal token, or any caller when no
/// token is configured.
pub struct InternalCaller;

impl FromRequestParts<AppState> for InternalCaller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.internal_token.as_deref() else {
            return Ok(InternalCaller);
        };
        let presented = parts
            .headers
            .get(INTERNAL_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented == Some(expected) {
            Ok(InternalCaller)
        } else {
            Err(ApiError::unauthorized("Missing or invalid internal token"))
        }
    }
}

/// Optional end-user credential forwarded from the `Authorization` header.
/// Accepts both `Bearer <token>` and a bare token.
pub struct Credential(pub Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for Credential {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        Ok(Credential(token))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Delivered {
    /// Local sessions the event was queued on.
    pub delivered: usize,
}

#[derive(Debug, Deserialize)]
pub struct FriendAccepted {
    pub friend: User,
}

#[derive(Debug, Default, Deserialize)]
pub struct MediaSourceChange {
    #[serde(default)]
    pub media_source_id: Option<String>,
}

// ---------------------------------------------------------------------------
// POST /internal/users/:user_id/notifications
// ---------------------------------------------------------------------------

async fn notify_user(
    _caller: InternalCaller,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Delivered>, ApiError> {
    let gateway = &state.gateway;
    let room = gateway
        .users
        .find(&user_id)
        .ok_or_else(|| ApiError::not_found("User is not connected here"))?;

    let frame = gateway
        .encode_empty(Opcode::NEW_NOTIFICATION)
        .ok_or_else(|| ApiError::internal("Failed to encode notification"))?;
    let delivered = room.broadcast(&frame);

    tracing::debug!(%user_id, delivered, "notification pushed");
    Ok(Json(Delivered { delivered }))
}

// ---------------------------------------------------------------------------
// POST /internal/users/:user_id/friends
// ---------------------------------------------------------------------------

async fn friend_accepted(
    _caller: InternalCaller,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<FriendAccepted>,
) -> Result<Json<Delivered>, ApiError> {
    if body.friend.id.is_empty() {
        return Err(ApiError::bad_request("friend.id is required"));
    }

    let gateway = &state.gateway;
    let room = gateway
        .users
        .find(&user_id)
        .ok_or_else(|| ApiError::not_found("User is not connected here"))?;

    let event = FriendRequestAcceptedMsgEvent {
        friend: Some(body.friend.clone()),
    };
    room.add_friend(body.friend);
    let frame = gateway
        .encode(Opcode::FRIEND_REQUEST_ACCEPTED, 0, &event)
        .ok_or_else(|| ApiError::internal("Failed to encode event"))?;
    let delivered = room.broadcast(&frame);

    Ok(Json(Delivered { delivered }))
}

// ---------------------------------------------------------------------------
// POST /internal/users/:user_id/updated
// ---------------------------------------------------------------------------

async fn user_updated(
    _caller: InternalCaller,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Credential(token): Credential,
) -> Result<Json<Delivered>, ApiError> {
    let token = token.ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?;

    let gateway = &state.gateway;
    let room = gateway
        .users
        .find(&user_id)
        .ok_or_else(|| ApiError::not_found("User is not connected here"))?;

    let user = bounded(gateway.settings.rpc_timeout, gateway.data.authenticate(&token)).await?;
    if user.id != user_id {
        return Err(ApiError::bad_request("Token does not belong to this user"));
    }

    room.update_user(user).await;
    let delivered = room.sessions().len();
    Ok(Json(Delivered { delivered }))
}

// ---------------------------------------------------------------------------
// POST /internal/theaters/:theater_id/updated
// ---------------------------------------------------------------------------

async fn theater_updated(
    _caller: InternalCaller,
    State(state): State<AppState>,
    Path(theater_id): Path<String>,
) -> Result<Json<Delivered>, ApiError> {
    let gateway = &state.gateway;
    let room = gateway
        .theaters
        .find(&theater_id)
        .ok_or_else(|| ApiError::not_found("Theater is not hosted here"))?;

    let frame = gateway
        .encode_empty(Opcode::THEATER_UPDATED)
        .ok_or_else(|| ApiError::internal("Failed to encode event"))?;
    let delivered = room.broadcast(&frame);

    Ok(Json(Delivered { delivered }))
}

// ---------------------------------------------------------------------------
// POST /internal/theaters/:theater_id/media-source
// ---------------------------------------------------------------------------

async fn media_source_changed(
    _caller: InternalCaller,
    State(state): State<AppState>,
    Path(theater_id): Path<String>,
    Credential(token): Credential,
    Json(body): Json<MediaSourceChange>,
) -> Result<Json<Delivered>, ApiError> {
    let room = state
        .gateway
        .theaters
        .find(&theater_id)
        .ok_or_else(|| ApiError::not_found("Theater is not hosted here"))?;

    let delivered = room.change_media_source(token.as_deref()).await?;
    let current = room.theater().media_source_id;
    if body.media_source_id.is_some() && body.media_source_id != current {
        tracing::warn!(
            %theater_id,
            announced = ?body.media_source_id,
            fetched = ?current,
            "media source differs from data service"
        );
    }

    Ok(Json(Delivered { delivered }))
}
