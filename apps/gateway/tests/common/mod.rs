#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use marquee_gateway::config::GatewaySettings;
use marquee_gateway::gateway::fanout::{FanoutBus, FanoutError, MemoryBus, Subscription};
use marquee_gateway::gateway::Gateway;
use marquee_gateway::services::{DataService, Friend, PersistedMessage, ServiceError, Theater};
use marquee_gateway::AppState;
use marquee_protocol::pb::{Activity, PersonalState, SessionHeader, User};
use marquee_protocol::{Opcode, Packet};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A side effect the gateway asked the data service to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Presence { user_id: String, state: PersonalState },
    Activity { user_id: String, theater_id: Option<String> },
    Message { sender_id: String, recipient_id: String, content: String },
}

/// In-memory data service that records every mutating call.
#[derive(Default)]
pub struct FakeDataService {
    users: Mutex<HashMap<String, User>>,
    friends: Mutex<HashMap<String, Vec<Friend>>>,
    theaters: Mutex<HashMap<String, Theater>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeDataService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `token` as a credential for a user named after `user_id`.
    pub fn add_user(&self, token: &str, user_id: &str) -> User {
        let user = User {
            id: user_id.to_string(),
            username: format!("{user_id}_name"),
            avatar: String::new(),
        };
        self.users.lock().insert(token.to_string(), user.clone());
        user
    }

    pub fn set_friends(&self, user_id: &str, friends: Vec<Friend>) {
        self.friends.lock().insert(user_id.to_string(), friends);
    }

    pub fn set_theater(&self, theater: Theater) {
        self.theaters.lock().insert(theater.id.clone(), theater);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn presence_calls(&self, user_id: &str) -> Vec<PersonalState> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Presence { user_id: id, state } if id == user_id => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn activity_calls(&self, user_id: &str) -> Vec<Option<String>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Activity { user_id: id, theater_id } if id == user_id => Some(theater_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn user_for(&self, token: &str) -> Result<User, ServiceError> {
        self.users
            .lock()
            .get(token)
            .cloned()
            .ok_or(ServiceError::Unauthorized)
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl DataService for FakeDataService {
    async fn authenticate(&self, token: &str) -> Result<User, ServiceError> {
        self.user_for(token)
    }

    async fn get_friends(&self, token: &str) -> Result<Vec<Friend>, ServiceError> {
        let user = self.user_for(token)?;
        Ok(self.friends.lock().get(&user.id).cloned().unwrap_or_default())
    }

    async fn update_presence(&self, token: &str, state: PersonalState) -> Result<(), ServiceError> {
        let user = self.user_for(token)?;
        self.record(Call::Presence {
            user_id: user.id,
            state,
        });
        Ok(())
    }

    async fn update_activity(&self, token: &str, activity: &Activity) -> Result<(), ServiceError> {
        let user = self.user_for(token)?;
        self.record(Call::Activity {
            user_id: user.id,
            theater_id: Some(activity.theater_id.clone()),
        });
        Ok(())
    }

    async fn remove_activity(&self, token: &str) -> Result<(), ServiceError> {
        let user = self.user_for(token)?;
        self.record(Call::Activity {
            user_id: user.id,
            theater_id: None,
        });
        Ok(())
    }

    async fn create_message(
        &self,
        token: &str,
        recipient_id: &str,
        content: &str,
    ) -> Result<PersistedMessage, ServiceError> {
        let sender = self.user_for(token)?;
        self.record(Call::Message {
            sender_id: sender.id.clone(),
            recipient_id: recipient_id.to_string(),
            content: content.to_string(),
        });
        Ok(PersistedMessage {
            id: marquee_common::prefixed_ulid("msg"),
            content: content.to_string(),
            sender,
            recipient_id: recipient_id.to_string(),
            created_at: Utc::now(),
        })
    }

    async fn get_theater(&self, theater_id: &str, _token: Option<&str>) -> Result<Theater, ServiceError> {
        if theater_id.starts_with("missing") {
            return Err(ServiceError::NotFound);
        }
        Ok(self
            .theaters
            .lock()
            .get(theater_id)
            .cloned()
            .unwrap_or_else(|| Theater {
                id: theater_id.to_string(),
                title: format!("Theater {theater_id}"),
                media_source_id: None,
            }))
    }
}

/// Data service that stalls selected calls before handing them to a
/// [`FakeDataService`].
pub struct SlowDataService {
    pub inner: Arc<FakeDataService>,
    /// Delay before an offline presence write is recorded.
    pub offline_delay: Duration,
    pub friends_delay: Duration,
}

impl SlowDataService {
    pub fn new(inner: Arc<FakeDataService>) -> Self {
        Self {
            inner,
            offline_delay: Duration::ZERO,
            friends_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl DataService for SlowDataService {
    async fn authenticate(&self, token: &str) -> Result<User, ServiceError> {
        self.inner.authenticate(token).await
    }

    async fn get_friends(&self, token: &str) -> Result<Vec<Friend>, ServiceError> {
        time::sleep(self.friends_delay).await;
        self.inner.get_friends(token).await
    }

    async fn update_presence(&self, token: &str, state: PersonalState) -> Result<(), ServiceError> {
        if state == PersonalState::Offline {
            time::sleep(self.offline_delay).await;
        }
        self.inner.update_presence(token, state).await
    }

    async fn update_activity(&self, token: &str, activity: &Activity) -> Result<(), ServiceError> {
        self.inner.update_activity(token, activity).await
    }

    async fn remove_activity(&self, token: &str) -> Result<(), ServiceError> {
        self.inner.remove_activity(token).await
    }

    async fn create_message(
        &self,
        token: &str,
        recipient_id: &str,
        content: &str,
    ) -> Result<PersistedMessage, ServiceError> {
        self.inner.create_message(token, recipient_id, content).await
    }

    async fn get_theater(&self, theater_id: &str, token: Option<&str>) -> Result<Theater, ServiceError> {
        self.inner.get_theater(theater_id, token).await
    }
}

/// Bus whose publishes always fail. Subscriptions still work, so only the
/// cross-instance path is lost.
#[derive(Default)]
pub struct UnreachableBus {
    inner: MemoryBus,
}

#[async_trait]
impl FanoutBus for UnreachableBus {
    async fn publish(&self, _channel: &str, _payload: Bytes) -> Result<(), FanoutError> {
        Err(FanoutError::Redis(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        ))))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, FanoutError> {
        self.inner.subscribe(channel).await
    }
}

/// Settings with timers short enough for tests.
pub fn test_settings() -> GatewaySettings {
    GatewaySettings {
        keepalive_check: Duration::from_millis(50),
        rpc_timeout: Duration::from_secs(2),
        ..GatewaySettings::default()
    }
}

/// One gateway instance backed by the given collaborators.
pub fn test_state(
    settings: GatewaySettings,
    data: Arc<FakeDataService>,
    bus: Arc<MemoryBus>,
) -> AppState {
    test_state_with(settings, data, bus)
}

/// One gateway instance over arbitrary collaborators.
pub fn test_state_with(
    settings: GatewaySettings,
    data: Arc<dyn DataService>,
    bus: Arc<dyn FanoutBus>,
) -> AppState {
    let gateway = Gateway::new(settings, data, bus);
    AppState::new(gateway, None)
}

/// Serve `state` on an ephemeral port in the background.
pub async fn start_server(state: AppState) -> SocketAddr {
    let app = marquee_gateway::routes::router().with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Open a socket on `path` offering the `cp0` subprotocol.
pub async fn connect(addr: SocketAddr, path: &str) -> Ws {
    let mut request = format!("ws://{addr}{path}")
        .into_client_request()
        .expect("client request");
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("cp0"));

    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");
    ws
}

pub fn client_header() -> SessionHeader {
    SessionHeader::default()
}

pub async fn send<M: prost::Message>(ws: &mut Ws, opcode: Opcode, body: &M) {
    let frame = marquee_protocol::encode(opcode, &client_header(), body).expect("encode");
    ws.send(Message::Binary(frame)).await.expect("send frame");
}

pub async fn send_empty(ws: &mut Ws, opcode: Opcode) {
    let frame = marquee_protocol::encode_empty(opcode, &client_header()).expect("encode");
    ws.send(Message::Binary(frame)).await.expect("send frame");
}

/// Next binary frame from the server, decoded.
pub async fn recv(ws: &mut Ws) -> Packet {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            Message::Binary(data) => return Packet::decode(data).expect("decode frame"),
            Message::Close(frame) => panic!("socket closed while waiting for a frame: {frame:?}"),
            _ => continue,
        }
    }
}

/// Skip frames until one with `opcode` arrives.
pub async fn recv_op(ws: &mut Ws, opcode: Opcode) -> Packet {
    loop {
        let packet = recv(ws).await;
        if packet.opcode() == opcode {
            return packet;
        }
    }
}

/// Wait for the server's close frame and return its code.
pub async fn recv_close(ws: &mut Ws) -> Option<u16> {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close");
        match msg {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Log on to `/user` and wait for AUTHORIZED.
pub async fn user_logon(addr: SocketAddr, token: &str) -> Ws {
    let mut ws = connect(addr, "/user").await;
    let logon = marquee_protocol::pb::LogOnEvent {
        token: token.to_string(),
    };
    send(&mut ws, Opcode::LOGON, &logon).await;
    recv_op(&mut ws, Opcode::AUTHORIZED).await;
    ws
}

/// Log on to `/theater` (empty token for a guest) and wait for the member
/// list that follows AUTHORIZED.
pub async fn theater_logon(addr: SocketAddr, room: &str, token: &str) -> Ws {
    let mut ws = connect(addr, "/theater").await;
    let logon = marquee_protocol::pb::TheaterLogOnEvent {
        room: room.to_string(),
        token: token.to_string(),
    };
    send(&mut ws, Opcode::LOGON, &logon).await;
    recv_op(&mut ws, Opcode::AUTHORIZED).await;
    recv_op(&mut ws, Opcode::THEATER_MEMBERS).await;
    ws
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        time::sleep(Duration::from_millis(20)).await;
    }
}

/// Raw frame bytes for a message, for tests that poke the bus directly.
pub fn frame<M: prost::Message>(opcode: Opcode, header: &SessionHeader, body: &M) -> Bytes {
    marquee_protocol::encode(opcode, header, body).expect("encode")
}
