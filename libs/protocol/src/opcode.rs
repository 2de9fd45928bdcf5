use std::fmt;

/// High bit of the wire opcode: set when the body is a protobuf message.
pub const STRUCTURED_FLAG: u32 = 0x8000_0000;

/// Message-type discriminant carried in every frame.
///
/// Unknown values are representable so that newer clients can talk to older
/// gateways; rooms ignore opcodes they do not handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(u32);

impl Opcode {
    pub const INVALID: Self = Self(0);
    pub const PING: Self = Self(1);
    pub const PONG: Self = Self(2);
    pub const LOGON: Self = Self(3);
    pub const AUTHORIZED: Self = Self(4);
    pub const UNAUTHORIZED: Self = Self(5);
    pub const PERSONAL_STATE_CHANGED: Self = Self(6);
    pub const PERSONAL_ACTIVITY_CHANGED: Self = Self(7);
    pub const NEW_CHAT_MESSAGE: Self = Self(8);
    pub const CHAT_MESSAGES: Self = Self(9);
    pub const FRIEND_REQUEST_ACCEPTED: Self = Self(10);
    pub const NEW_NOTIFICATION: Self = Self(11);
    pub const USER_UPDATED: Self = Self(12);
    pub const THEATER_PLAY: Self = Self(13);
    pub const THEATER_PAUSE: Self = Self(14);
    pub const SYNC_ME: Self = Self(15);
    pub const SYNCED: Self = Self(16);
    pub const THEATER_MEMBERS: Self = Self(17);
    pub const MEMBER_STATE_CHANGED: Self = Self(18);
    pub const THEATER_UPDATED: Self = Self(19);
    pub const THEATER_MEDIA_SOURCE_CHANGED: Self = Self(20);
    pub const THEATER_SEEK: Self = Self(21);

    /// Build an opcode from a message-type value. The structured bit is
    /// stripped if present.
    pub const fn new(value: u32) -> Self {
        Self(value & !STRUCTURED_FLAG)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Wire representation with the structured bit set.
    pub const fn to_structured(self) -> u32 {
        self.0 | STRUCTURED_FLAG
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::INVALID => "INVALID",
            Self::PING => "PING",
            Self::PONG => "PONG",
            Self::LOGON => "LOGON",
            Self::AUTHORIZED => "AUTHORIZED",
            Self::UNAUTHORIZED => "UNAUTHORIZED",
            Self::PERSONAL_STATE_CHANGED => "PERSONAL_STATE_CHANGED",
            Self::PERSONAL_ACTIVITY_CHANGED => "PERSONAL_ACTIVITY_CHANGED",
            Self::NEW_CHAT_MESSAGE => "NEW_CHAT_MESSAGE",
            Self::CHAT_MESSAGES => "CHAT_MESSAGES",
            Self::FRIEND_REQUEST_ACCEPTED => "FRIEND_REQUEST_ACCEPTED",
            Self::NEW_NOTIFICATION => "NEW_NOTIFICATION",
            Self::USER_UPDATED => "USER_UPDATED",
            Self::THEATER_PLAY => "THEATER_PLAY",
            Self::THEATER_PAUSE => "THEATER_PAUSE",
            Self::SYNC_ME => "SYNC_ME",
            Self::SYNCED => "SYNCED",
            Self::THEATER_MEMBERS => "THEATER_MEMBERS",
            Self::MEMBER_STATE_CHANGED => "MEMBER_STATE_CHANGED",
            Self::THEATER_UPDATED => "THEATER_UPDATED",
            Self::THEATER_MEDIA_SOURCE_CHANGED => "THEATER_MEDIA_SOURCE_CHANGED",
            Self::THEATER_SEEK => "THEATER_SEEK",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "UNKNOWN({})", self.0),
        }
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
