//! Wire protocol: message taxonomy and framed codec.
//!
//! One stream carries one request and its response. Frames are a u32
//! big-endian length followed by a JSON body, capped at 1 MiB. Message types
//! are numeric on the wire; a response's type is its request's type plus one.

use crate::error::DhtError;
use crate::types::NodeId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol id for DHT streams.
pub const PROTOCOL_ID: &str = "/meshnet/dht/1.0.0";

/// Maximum frame body size.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Request/response kinds. Even values are requests; `request + 1` is the
/// matching response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    FindNode = 0,
    FindNodeResponse = 1,
    FindValue = 2,
    FindValueResponse = 3,
    Store = 4,
    StoreResponse = 5,
    Ping = 6,
    Pong = 7,
    AddProvider = 8,
    AddProviderResponse = 9,
    GetProviders = 10,
    GetProvidersResponse = 11,
    RemoveProvider = 12,
    RemoveProviderResponse = 13,
    PutPeerRecord = 14,
    PutPeerRecordResponse = 15,
    GetPeerRecord = 16,
    GetPeerRecordResponse = 17,
}

impl MessageType {
    pub fn is_request(self) -> bool {
        (self as u8) % 2 == 0
    }

    /// The response kind paired with this request kind.
    pub fn response(self) -> MessageType {
        if self.is_request() {
            MessageType::try_from(self as u8 + 1).unwrap_or(self)
        } else {
            self
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = DhtError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageType::*;
        Ok(match value {
            0 => FindNode,
            1 => FindNodeResponse,
            2 => FindValue,
            3 => FindValueResponse,
            4 => Store,
            5 => StoreResponse,
            6 => Ping,
            7 => Pong,
            8 => AddProvider,
            9 => AddProviderResponse,
            10 => GetProviders,
            11 => GetProvidersResponse,
            12 => RemoveProvider,
            13 => RemoveProviderResponse,
            14 => PutPeerRecord,
            15 => PutPeerRecordResponse,
            16 => GetPeerRecord,
            17 => GetPeerRecordResponse,
            other => return Err(DhtError::Codec(format!("unknown message type {}", other))),
        })
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        MessageType::try_from(value).map_err(serde::de::Error::custom)
    }
}

/// A peer reference carried in `closer_peers` / `providers` lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePeer {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addrs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl MessagePeer {
    pub fn new(id: NodeId, addrs: Vec<String>) -> Self {
        MessagePeer {
            id,
            addrs,
            timestamp_ns: None,
            ttl_ms: None,
        }
    }
}

/// The single wire message, a tagged union keyed by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub request_id: String,
    pub sender: NodeId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sender_addrs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub closer_peers: Vec<MessagePeer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<MessagePeer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_record: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// A fresh request with a random request id.
    pub fn request(msg_type: MessageType, sender: NodeId, sender_addrs: Vec<String>) -> Self {
        Message {
            msg_type,
            request_id: uuid::Uuid::new_v4().to_string(),
            sender,
            sender_addrs,
            target: None,
            key: None,
            value: None,
            ttl_ms: None,
            closer_peers: Vec::new(),
            providers: Vec::new(),
            signed_record: None,
            success: None,
            error: None,
        }
    }

    /// A successful response paired to `request`.
    pub fn response_to(request: &Message, sender: NodeId) -> Self {
        Message {
            msg_type: request.msg_type.response(),
            request_id: request.request_id.clone(),
            sender,
            sender_addrs: Vec::new(),
            target: None,
            key: request.key.clone(),
            value: None,
            ttl_ms: None,
            closer_peers: Vec::new(),
            providers: Vec::new(),
            signed_record: None,
            success: Some(true),
            error: None,
        }
    }

    /// An error response paired to `request`.
    pub fn error_response(request: &Message, sender: NodeId, reason: impl Into<String>) -> Self {
        let mut response = Message::response_to(request, sender);
        response.success = Some(false);
        response.error = Some(reason.into());
        response
    }

    pub fn is_success(&self) -> bool {
        self.success.unwrap_or(false)
    }
}

/// Write one length-prefixed frame.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), DhtError> {
    let body = serde_json::to_vec(message).map_err(|e| DhtError::Codec(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(DhtError::Codec(format!(
            "frame of {} bytes exceeds {} byte cap",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, DhtError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(DhtError::Codec(format!(
            "incoming frame of {} bytes exceeds {} byte cap",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| DhtError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_pairing_arithmetic() {
        let requests = [
            MessageType::FindNode,
            MessageType::FindValue,
            MessageType::Store,
            MessageType::Ping,
            MessageType::AddProvider,
            MessageType::GetProviders,
            MessageType::RemoveProvider,
            MessageType::PutPeerRecord,
            MessageType::GetPeerRecord,
        ];
        for request in requests {
            assert!(request.is_request());
            let response = request.response();
            assert!(!response.is_request());
            assert_eq!(response as u8, request as u8 + 1);
        }
        // A response maps to itself.
        assert_eq!(MessageType::Pong.response(), MessageType::Pong);
    }

    #[test]
    fn test_message_type_codec_rejects_unknown() {
        assert!(MessageType::try_from(17).is_ok());
        assert!(MessageType::try_from(18).is_err());
    }

    #[test]
    fn test_message_json_round_trip() {
        let mut message = Message::request(
            MessageType::FindValue,
            NodeId::random(),
            vec!["/ip4/1.2.3.4/tcp/4001".to_string()],
        );
        message.key = Some("/meshnet/v2/sys/value/k".to_string());
        message.value = Some(b"payload".to_vec());
        message.closer_peers = vec![MessagePeer::new(NodeId::random(), vec![])];

        let json = serde_json::to_vec(&message).unwrap();
        let decoded: Message = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_error_response_shape() {
        let request = Message::request(MessageType::PutPeerRecord, NodeId::random(), vec![]);
        let local = NodeId::random();
        let response = Message::error_response(&request, local, "rate limit exceeded");
        assert_eq!(response.msg_type, MessageType::PutPeerRecordResponse);
        assert_eq!(response.request_id, request.request_id);
        assert_eq!(response.success, Some(false));
        assert_eq!(response.error.as_deref(), Some("rate limit exceeded"));
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_framed_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let message = Message::request(MessageType::Ping, NodeId::random(), vec![]);
        write_message(&mut a, &message).await.unwrap();
        let decoded = read_message(&mut b).await.unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Advertise an oversized frame; the reader must bail before reading it.
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        a.write_all(&len).await.unwrap();
        let result = read_message(&mut b).await;
        assert!(matches!(result, Err(DhtError::Codec(_))));
    }

    #[tokio::test]
    async fn test_oversize_body_refused_on_write() {
        let mut message = Message::request(MessageType::Store, NodeId::random(), vec![]);
        message.value = Some(vec![0u8; MAX_FRAME_SIZE + 1]);
        let (mut a, _b) = tokio::io::duplex(64);
        assert!(matches!(
            write_message(&mut a, &message).await,
            Err(DhtError::Codec(_))
        ));
    }
}
