//! # Wire Protocol Messages
//!
//! Every session carries a sequence of length-prefixed frames:
//!
//! ```text
//! +----------------+------------------------------------------+
//! | len: u32 (BE)  | bincode(P2pMessage)                      |
//! +----------------+------------------------------------------+
//! ```
//!
//! A [`P2pMessage`] names the module it belongs to ([`PacketType`]), whether
//! it is one-way, a request or a response ([`FrameKind`]), and a sequence
//! number that correlates a response with its request. Topic routing messages
//! travel as bincode-encoded [`AmopMessage`] values inside the payload.
//!
//! | Message | Kind | Payload |
//! |---------|------|---------|
//! | Heartbeat | one-way | 4-byte big-endian status sequence |
//! | `TopicSeq` | one-way | local topic sequence |
//! | `RequestTopics` | request | - |
//! | `ResponseTopics` | response | sequence + topic names |
//! | `Request` | request | topic + data |
//! | `Broadcast` | one-way | topic + data |
//! | `Response` | response | status + data |
//!
//! ## Security Limits
//!
//! - `MAX_FRAME_SIZE`: frames above this are rejected before the body is read
//! - All deserialization uses `deserialize_bounded()`

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::NetworkError;

/// Maximum encoded size of one frame body (4 MiB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    Heartbeat,
    Amop,
    /// Free for other modules sharing the transport.
    Custom(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    OneWay,
    Request,
    Response,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pMessage {
    pub packet_type: PacketType,
    pub kind: FrameKind,
    /// Correlation id; assigned by the session for requests, echoed by responses.
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl P2pMessage {
    pub fn oneway(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            kind: FrameKind::OneWay,
            seq: 0,
            payload,
        }
    }

    pub fn request(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            kind: FrameKind::Request,
            seq: 0,
            payload,
        }
    }

    pub fn response(packet_type: PacketType, seq: u32, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            kind: FrameKind::Response,
            seq,
            payload,
        }
    }

    pub fn heartbeat(status_seq: u32) -> Self {
        Self::oneway(PacketType::Heartbeat, status_seq.to_be_bytes().to_vec())
    }

    /// Status sequence carried by a heartbeat, if the payload is well formed.
    pub fn heartbeat_status(&self) -> Option<u32> {
        if self.packet_type != PacketType::Heartbeat {
            return None;
        }
        let bytes: [u8; 4] = self.payload.as_slice().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn expects_response(&self) -> bool {
        self.kind == FrameKind::Request
    }
}

/// Encode a message as a length-prefixed frame ready to be written.
pub fn encode_frame(message: &P2pMessage) -> Result<Vec<u8>, NetworkError> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::Codec(format!(
            "frame of {} bytes exceeds limit of {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one frame. `Ok(None)` means the stream ended cleanly.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<P2pMessage>, NetworkError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(NetworkError::TransportClosed),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::Codec(format!(
            "peer announced {} byte frame, limit is {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| NetworkError::TransportClosed)?;

    Ok(Some(deserialize_bounded(&body)?))
}

/// Outcome reported in an AMOP response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmopStatus {
    Ok,
    NoSubscriber,
    Timeout,
    ClientGone,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmopMessage {
    TopicSeq { seq: u32 },
    RequestTopics,
    ResponseTopics { seq: u32, topics: Vec<String> },
    Request { topic: String, data: Vec<u8> },
    Broadcast { topic: String, data: Vec<u8> },
    Response { status: AmopStatus, data: Vec<u8> },
}

impl AmopMessage {
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NetworkError> {
        Ok(deserialize_bounded(bytes)?)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            AmopMessage::TopicSeq { .. } => "topic_seq",
            AmopMessage::RequestTopics => "request_topics",
            AmopMessage::ResponseTopics { .. } => "response_topics",
            AmopMessage::Request { .. } => "request",
            AmopMessage::Broadcast { .. } => "broadcast",
            AmopMessage::Response { .. } => "response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn heartbeat_carries_big_endian_status() {
        let hb = P2pMessage::heartbeat(0x0102_0304);
        assert_eq!(hb.payload, vec![1, 2, 3, 4]);
        assert_eq!(hb.heartbeat_status(), Some(0x0102_0304));
        assert!(!hb.expects_response());

        let short = P2pMessage::oneway(PacketType::Heartbeat, vec![1, 2]);
        assert_eq!(short.heartbeat_status(), None);
    }

    #[tokio::test]
    async fn frames_survive_a_byte_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let first = P2pMessage::request(PacketType::Amop, b"hello".to_vec());
        let second = P2pMessage::response(PacketType::Custom(9), 42, vec![0xAB; 300]);

        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend(encode_frame(&second).unwrap());
        client.write_all(&bytes).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(first));
        assert_eq!(read_frame(&mut server).await.unwrap(), Some(second));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_header_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, NetworkError::Codec(_)));
    }

    #[tokio::test]
    async fn truncated_body_is_transport_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&16u32.to_be_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        assert_eq!(
            read_frame(&mut server).await.unwrap_err(),
            NetworkError::TransportClosed
        );
    }

    #[test]
    fn oversized_message_not_encoded() {
        let big = P2pMessage::oneway(PacketType::Amop, vec![0; MAX_FRAME_SIZE + 1]);
        assert!(matches!(encode_frame(&big), Err(NetworkError::Codec(_))));
    }

    #[test]
    fn amop_payload_rejects_garbage() {
        assert!(AmopMessage::decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
        let encoded = AmopMessage::ResponseTopics {
            seq: 3,
            topics: vec!["chain.block".into()],
        }
        .encode()
        .unwrap();
        assert!(matches!(
            AmopMessage::decode(&encoded).unwrap(),
            AmopMessage::ResponseTopics { seq: 3, .. }
        ));
    }
}
