// Binary wire format for framing messages on the network.
//
// Each frame is `version:u8 | length:u32-be | payload`; the payload is a
// varint stream ID followed by the encoded message. These frames are the
// only means of communication between clients, pilots and control towers.
use bytes::{BufMut, Bytes, BytesMut};
use cascade_common::{Status, StreamId};

pub mod coding;
pub mod message;

pub use message::{
    Ack, AckStatus, Cursor, DataMessage, FillResult, GoodbyeCode, Message, MessageDeliverData,
    MessageType, OriginKind, PingKind, UnsubscribeReason,
};

/// Version byte leading every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size (in octets) of an encoded frame header.
pub const FRAME_HEADER_LEN: usize = 1 + 4;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("truncated input")]
    Truncated,
    #[error("bad varint")]
    BadVarint,
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("bad {0}")]
    BadField(&'static str),
}

impl From<Error> for Status {
    fn from(err: Error) -> Status {
        // Any wire-level failure is fatal to the connection it arrived on.
        Status::Corruption(err.to_string())
    }
}

/// Encodes a complete frame carrying `message` on `stream`.
pub fn encode_frame(stream: StreamId, message: &Message) -> Bytes {
    let mut payload = BytesMut::new();
    coding::put_varint64(&mut payload, stream);
    message.encode_into(&mut payload);

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u8(PROTOCOL_VERSION);
    frame.put_u32(payload.len() as u32);
    frame.extend_from_slice(&payload);
    frame.freeze()
}

/// Decodes a frame header, returning the payload length.
pub fn decode_frame_header(header: &[u8; FRAME_HEADER_LEN], max_frame_bytes: usize) -> Result<usize> {
    let version = header[0];
    if version != PROTOCOL_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if length > max_frame_bytes {
        return Err(Error::FrameTooLarge(length));
    }
    Ok(length)
}

/// Decodes a frame payload into the stream ID and message it carries.
pub fn decode_payload(mut payload: Bytes) -> Result<(StreamId, Message)> {
    let stream = coding::get_varint64(&mut payload)?;
    let message = Message::decode(&mut payload)?;
    Ok((stream, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let message = Message::Ping {
            tenant: 7,
            ping: PingKind::Request,
            cookie: Bytes::from_static(b"cookie"),
        };
        let frame = encode_frame(42, &message);

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
        let length = decode_frame_header(&header, 1024).expect("header");
        assert_eq!(length, frame.len() - FRAME_HEADER_LEN);

        let (stream, decoded) = decode_payload(frame.slice(FRAME_HEADER_LEN..)).expect("payload");
        assert_eq!(stream, 42);
        assert_eq!(decoded, message);
    }

    #[test]
    fn header_rejects_unknown_version() {
        let header = [9u8, 0, 0, 0, 4];
        let err = decode_frame_header(&header, 1024).expect_err("version");
        assert_eq!(err, Error::UnsupportedVersion(9));
    }

    #[test]
    fn header_rejects_oversized_frame() {
        let header = [PROTOCOL_VERSION, 0, 1, 0, 0];
        let err = decode_frame_header(&header, 1024).expect_err("too large");
        assert!(matches!(err, Error::FrameTooLarge(_)));
    }

    #[test]
    fn wire_errors_map_to_corruption() {
        let status: Status = Error::BadVarint.into();
        assert!(matches!(status, Status::Corruption(_)));
    }
}
