//! Real-time connection gateway: sessions, rooms and the fan-out bridge.

pub mod auth;
pub mod fanout;
pub mod handler;
pub mod playback;
pub mod presence;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod theater_room;
pub mod user_room;

use std::sync::Arc;

use bytes::Bytes;
use marquee_common::SnowflakeGenerator;
use marquee_protocol::pb::SessionHeader;
use marquee_protocol::Opcode;
use prost::Message;
use tokio_util::sync::CancellationToken;

use crate::config::GatewaySettings;
use crate::services::DataService;
use fanout::FanoutBus;
use registry::RoomHub;
use theater_room::TheaterRoom;
use user_room::UserRoom;

/// Process-wide gateway core, constructed once at startup.
///
/// Holds both room hubs and every collaborator a room or session needs.
pub struct Gateway {
    pub settings: GatewaySettings,
    pub data: Arc<dyn DataService>,
    pub bus: Arc<dyn FanoutBus>,
    pub users: RoomHub<UserRoom>,
    pub theaters: RoomHub<TheaterRoom>,
    /// Cancelled on server shutdown; parent of every session and room token.
    pub shutdown: CancellationToken,
    session_ids: SnowflakeGenerator,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        data: Arc<dyn DataService>,
        bus: Arc<dyn FanoutBus>,
    ) -> Arc<Self> {
        let session_ids = SnowflakeGenerator::new(settings.worker_id);
        Arc::new(Self {
            settings,
            data,
            bus,
            users: RoomHub::new(),
            theaters: RoomHub::new(),
            shutdown: CancellationToken::new(),
            session_ids,
        })
    }

    pub fn next_session_id(&self) -> u64 {
        self.session_ids.generate()
    }

    /// Header for frames this instance produces. `sender` is the originating
    /// session id, or 0 for server-originated frames.
    pub fn header(&self, sender: u64) -> SessionHeader {
        SessionHeader {
            session_client_id: sender,
            ip_addr: Vec::new(),
            origin: self.settings.instance_id.to_string(),
        }
    }

    pub fn is_local(&self, header: &SessionHeader) -> bool {
        header.origin == self.settings.instance_id.as_str()
    }

    pub fn encode<M: Message>(&self, opcode: Opcode, sender: u64, body: &M) -> Option<Bytes> {
        match marquee_protocol::encode(opcode, &self.header(sender), body) {
            Ok(frame) => Some(frame),
            Err(err) => {
                tracing::error!(%err, %opcode, "failed to encode frame");
                None
            }
        }
    }

    pub fn encode_empty(&self, opcode: Opcode) -> Option<Bytes> {
        match marquee_protocol::encode_empty(opcode, &self.header(0)) {
            Ok(frame) => Some(frame),
            Err(err) => {
                tracing::error!(%err, %opcode, "failed to encode frame");
                None
            }
        }
    }

    /// Publish to the bus. Failures are logged; local delivery never depends
    /// on the bus.
    pub async fn publish(&self, channel: &str, frame: Bytes) {
        if let Err(err) = self.bus.publish(channel, frame).await {
            tracing::warn!(%err, %channel, "fan-out publish failed");
        }
    }

    /// Queue `frame` on `user_id`'s sessions on this instance, then publish
    /// it for the rest. Subscribers here skip the published copy.
    pub async fn deliver_to_user(&self, user_id: &str, frame: Bytes) {
        if let Some(room) = self.users.find(user_id) {
            room.broadcast(&frame);
        }
        self.publish(&fanout::user_channel(user_id), frame).await;
    }
}
