#![forbid(unsafe_code)]

//! Binary framing shared by every gateway connection.
//!
//! A frame is `opcode:u32-LE ‖ headerLen:i32-LE ‖ header ‖ body`. The top bit
//! of the opcode marks a protobuf body; the header is always a protobuf
//! [`pb::SessionHeader`], even for frames without a body.

pub mod opcode;
pub mod packet;
pub mod pb;

pub use opcode::{Opcode, STRUCTURED_FLAG};
pub use packet::{encode, encode_empty, encode_raw, FrameError, MalformedFrame, Packet, PREAMBLE_LEN};

/// WebSocket subprotocols a client may offer, in preference order.
pub const SUBPROTOCOLS: [&str; 2] = ["cp0", "cp1"];
