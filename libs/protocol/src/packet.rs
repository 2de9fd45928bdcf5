use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

use crate::opcode::{Opcode, STRUCTURED_FLAG};
use crate::pb::SessionHeader;

/// Opcode plus header length.
pub const PREAMBLE_LEN: usize = 8;

/// A frame that cannot be split into opcode, header and body.
#[derive(Debug, Error)]
pub enum MalformedFrame {
    #[error("insufficient data: need={need} have={have}")]
    InsufficientData { need: usize, have: usize },

    #[error("negative header length: {0}")]
    NegativeHeaderLength(i32),

    #[error("header length {declared} exceeds remaining {remaining} bytes")]
    HeaderOverrun { declared: usize, remaining: usize },

    #[error("session header decode error: {0}")]
    Header(#[source] prost::DecodeError),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Malformed(#[from] MalformedFrame),

    #[error("{0} frame does not carry a structured body")]
    NotStructured(Opcode),

    #[error("session header too large: {0} bytes")]
    HeaderTooLarge(usize),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Immutable view over one inbound frame.
///
/// Decoding only validates the preamble and the session header. The body
/// stays as bytes until [`Packet::read_body`] is called with the type the
/// caller expects for this opcode.
#[derive(Debug, Clone)]
pub struct Packet {
    opcode: Opcode,
    structured: bool,
    header: SessionHeader,
    frame: Bytes,
}

impl Packet {
    pub fn decode(frame: impl Into<Bytes>) -> Result<Self, MalformedFrame> {
        let frame = frame.into();
        let (raw, header, _) = split(&frame)?;
        Ok(Self {
            opcode: Opcode::new(raw),
            structured: raw & STRUCTURED_FLAG != 0,
            header,
            frame,
        })
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn is_structured(&self) -> bool {
        self.structured
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    /// The frame exactly as received, suitable for verbatim relay.
    pub fn as_bytes(&self) -> &Bytes {
        &self.frame
    }

    /// Decode the body as `M`.
    ///
    /// Re-parses the preamble to locate the body, so a packet can be read as
    /// several candidate types. A zero-length body decodes to `M::default()`.
    pub fn read_body<M: Message + Default>(&self) -> Result<M, FrameError> {
        if !self.structured {
            return Err(FrameError::NotStructured(self.opcode));
        }
        let (_, _, offset) = split(&self.frame)?;
        Ok(M::decode(&self.frame[offset..])?)
    }
}

/// Returns the raw opcode word, the decoded header and the body offset.
fn split(frame: &[u8]) -> Result<(u32, SessionHeader, usize), MalformedFrame> {
    if frame.len() < PREAMBLE_LEN {
        return Err(MalformedFrame::InsufficientData {
            need: PREAMBLE_LEN,
            have: frame.len(),
        });
    }

    let mut preamble = &frame[..PREAMBLE_LEN];
    let raw = preamble.get_u32_le();
    let declared = preamble.get_i32_le();
    let header_len =
        usize::try_from(declared).map_err(|_| MalformedFrame::NegativeHeaderLength(declared))?;

    let remaining = frame.len() - PREAMBLE_LEN;
    if header_len > remaining {
        return Err(MalformedFrame::HeaderOverrun {
            declared: header_len,
            remaining,
        });
    }

    let end = PREAMBLE_LEN + header_len;
    let header = SessionHeader::decode(&frame[PREAMBLE_LEN..end]).map_err(MalformedFrame::Header)?;
    Ok((raw, header, end))
}

fn preamble(raw: u32, header: &SessionHeader, body_len: usize) -> Result<BytesMut, FrameError> {
    let header_len = header.encoded_len();
    let declared = i32::try_from(header_len).map_err(|_| FrameError::HeaderTooLarge(header_len))?;

    let mut buf = BytesMut::with_capacity(PREAMBLE_LEN + header_len + body_len);
    buf.put_u32_le(raw);
    buf.put_i32_le(declared);
    header.encode(&mut buf)?;
    Ok(buf)
}

/// Encode a structured frame carrying `body`.
pub fn encode<M: Message>(opcode: Opcode, header: &SessionHeader, body: &M) -> Result<Bytes, FrameError> {
    let mut buf = preamble(opcode.to_structured(), header, body.encoded_len())?;
    body.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Encode a structured frame with no body (pings, pongs, bare acks).
pub fn encode_empty(opcode: Opcode, header: &SessionHeader) -> Result<Bytes, FrameError> {
    Ok(preamble(opcode.to_structured(), header, 0)?.freeze())
}

/// Encode a frame with the structured bit cleared and an opaque body.
pub fn encode_raw(opcode: Opcode, header: &SessionHeader, payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut buf = preamble(opcode.value(), header, payload.len())?;
    buf.put_slice(payload);
    Ok(buf.freeze())
}
