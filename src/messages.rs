//! # Stream and Control Messages
//!
//! This module defines the decoded message types the pipeline consumes and
//! the request records it produces. Byte-level encoding of these records is
//! the transport's concern; the derives here exist so transports can pick any
//! serde format.
//!
//! ## Message Types
//!
//! | Type | Direction | Purpose |
//! |------|-----------|---------|
//! | [`StreamMessage`] | inbound | Signed data or key-exchange message in a lineage |
//! | [`ControlMessage`] | inbound | Broadcast/unicast wrapper and typed responses |
//! | [`ControlRequest`] | outbound | Subscribe, unsubscribe and resend requests |
//!
//! ## Ordering Identity
//!
//! A message belongs to the lineage `(publisher_id, msg_chain_id)` within its
//! `(stream_id, stream_partition)`. Its position is its [`MessageRef`] and it
//! declares its predecessor through `prev_ref`.
//!
//! ## Message IDs
//!
//! `message_id()` is `blake3(payload_to_sign())`, used for log correlation.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::Identity;

/// Maximum size of a message payload (1 MiB).
pub const MAX_CONTENT_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for payload deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_CONTENT_SIZE as u64) + 4096;

/// Stream id prefix of key-exchange streams: `SYSTEM/keyexchange/{address}`.
pub const KEY_EXCHANGE_STREAM_PREFIX: &str = "SYSTEM/keyexchange/";

pub type MessageId = [u8; 32];

/// Correlates a request with its unicast responses.
pub type RequestId = String;

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Encode a value as message content, using the same options as
/// [`StreamMessage::parsed_content`].
pub fn encode_content<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Returns true if `stream_id` names a key-exchange stream.
pub fn is_key_exchange_stream(stream_id: &str) -> bool {
    stream_id.starts_with(KEY_EXCHANGE_STREAM_PREFIX)
}

/// Position of a message in its chain.
///
/// Ordered by timestamp, then sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub timestamp: u64,
    pub sequence_number: u32,
}

impl MessageRef {
    pub const fn new(timestamp: u64, sequence_number: u32) -> Self {
        Self { timestamp, sequence_number }
    }

    /// The first position that can follow this one.
    pub fn successor(&self) -> Self {
        match self.sequence_number.checked_add(1) {
            Some(sequence_number) => Self { timestamp: self.timestamp, sequence_number },
            None => Self { timestamp: self.timestamp.saturating_add(1), sequence_number: 0 },
        }
    }
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.timestamp, self.sequence_number)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionType {
    #[default]
    None,
    Aes,
    Rsa,
}

impl EncryptionType {
    fn tag(self) -> u8 {
        match self {
            EncryptionType::None => 0,
            EncryptionType::Aes => 2,
            EncryptionType::Rsa => 3,
        }
    }
}

/// Kind of a stream message.
///
/// Key-exchange kinds carry the id of the stream whose keys are being
/// exchanged; the stream they travel on is the key-exchange stream itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Data,
    GroupKeyRequest { stream_id: String },
    GroupKeyResponse { stream_id: String },
    GroupKeyAnnounce { stream_id: String },
    GroupKeyErrorResponse { stream_id: String },
    /// A kind this client does not understand. Always fails validation.
    Unknown(u8),
}

impl MessageKind {
    pub fn tag(&self) -> u8 {
        match self {
            MessageKind::Data => 27,
            MessageKind::GroupKeyRequest { .. } => 28,
            MessageKind::GroupKeyResponse { .. } => 29,
            MessageKind::GroupKeyAnnounce { .. } => 30,
            MessageKind::GroupKeyErrorResponse { .. } => 31,
            MessageKind::Unknown(tag) => *tag,
        }
    }

    /// Stream the key exchange refers to, for key-exchange kinds.
    pub fn target_stream(&self) -> Option<&str> {
        match self {
            MessageKind::GroupKeyRequest { stream_id }
            | MessageKind::GroupKeyResponse { stream_id }
            | MessageKind::GroupKeyAnnounce { stream_id }
            | MessageKind::GroupKeyErrorResponse { stream_id } => Some(stream_id),
            MessageKind::Data | MessageKind::Unknown(_) => None,
        }
    }

    pub fn is_key_exchange(&self) -> bool {
        self.target_stream().is_some()
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Data => "data",
            MessageKind::GroupKeyRequest { .. } => "group key request",
            MessageKind::GroupKeyResponse { .. } => "group key response",
            MessageKind::GroupKeyAnnounce { .. } => "group key announce",
            MessageKind::GroupKeyErrorResponse { .. } => "group key error response",
            MessageKind::Unknown(_) => "unknown",
        }
    }
}

/// Identity of a lineage within one stream partition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineageKey {
    pub publisher_id: Identity,
    pub msg_chain_id: String,
}

impl std::fmt::Display for LineageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.publisher_id.short(), self.msg_chain_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub stream_id: String,
    pub stream_partition: u32,
    pub message_ref: MessageRef,
    pub publisher_id: Identity,
    pub msg_chain_id: String,
    /// Declared predecessor in the chain. None at chain start.
    pub prev_ref: Option<MessageRef>,
    pub kind: MessageKind,
    pub encryption: EncryptionType,
    pub content: Vec<u8>,
    pub signature: Option<Vec<u8>>,
    /// Terminal marker: the subscription ends once this message is delivered.
    pub bye: bool,
}

impl StreamMessage {
    /// Create an unsigned, unencrypted data message.
    pub fn new(
        stream_id: impl Into<String>,
        stream_partition: u32,
        message_ref: MessageRef,
        prev_ref: Option<MessageRef>,
        publisher_id: Identity,
        msg_chain_id: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            stream_partition,
            message_ref,
            publisher_id,
            msg_chain_id: msg_chain_id.into(),
            prev_ref,
            kind: MessageKind::Data,
            encryption: EncryptionType::None,
            content,
            signature: None,
            bye: false,
        }
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_encryption(mut self, encryption: EncryptionType) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_bye(mut self) -> Self {
        self.bye = true;
        self
    }

    pub fn lineage(&self) -> LineageKey {
        LineageKey {
            publisher_id: self.publisher_id,
            msg_chain_id: self.msg_chain_id.clone(),
        }
    }

    pub fn is_signed(&self) -> bool {
        self.signature.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// Build the canonical byte representation covered by the signature.
    ///
    /// Format: stream_id_len(4) || stream_id || partition(4) || timestamp(8) ||
    /// seqno(4) || publisher(32) || chain_len(4) || chain || prev_flag(1) ||
    /// [prev_timestamp(8) || prev_seqno(4)] || kind(1) || [target_len(4) || target] ||
    /// encryption(1) || bye(1) || content_len(4) || content
    pub fn payload_to_sign(&self) -> Vec<u8> {
        let stream_bytes = self.stream_id.as_bytes();
        let chain_bytes = self.msg_chain_id.as_bytes();
        let mut payload = Vec::with_capacity(
            4 + stream_bytes.len() + 4 + 12 + 32 + 4 + chain_bytes.len() + 13 + 3 + 4 + self.content.len(),
        );

        payload.extend_from_slice(&(stream_bytes.len() as u32).to_le_bytes());
        payload.extend_from_slice(stream_bytes);
        payload.extend_from_slice(&self.stream_partition.to_le_bytes());

        payload.extend_from_slice(&self.message_ref.timestamp.to_le_bytes());
        payload.extend_from_slice(&self.message_ref.sequence_number.to_le_bytes());

        // Publisher identity binds the signature to the declared address
        payload.extend_from_slice(self.publisher_id.as_bytes());
        payload.extend_from_slice(&(chain_bytes.len() as u32).to_le_bytes());
        payload.extend_from_slice(chain_bytes);

        match self.prev_ref {
            Some(prev) => {
                payload.push(1);
                payload.extend_from_slice(&prev.timestamp.to_le_bytes());
                payload.extend_from_slice(&prev.sequence_number.to_le_bytes());
            }
            None => payload.push(0),
        }

        payload.push(self.kind.tag());
        if let Some(target) = self.kind.target_stream() {
            payload.extend_from_slice(&(target.len() as u32).to_le_bytes());
            payload.extend_from_slice(target.as_bytes());
        }
        payload.push(self.encryption.tag());
        payload.push(u8::from(self.bye));

        payload.extend_from_slice(&(self.content.len() as u32).to_le_bytes());
        payload.extend_from_slice(&self.content);

        payload
    }

    pub fn message_id(&self) -> MessageId {
        *blake3::hash(&self.payload_to_sign()).as_bytes()
    }

    /// Decode the content with size bounds enforced.
    pub fn parsed_content<T: DeserializeOwned>(&self) -> Result<T, bincode::Error> {
        deserialize_bounded(&self.content)
    }
}

/// Tag of a [`ControlMessage`], used to register handlers by type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlKind {
    BroadcastMessage,
    UnicastMessage,
    SubscribeResponse,
    UnsubscribeResponse,
    ResendResponseResending,
    ResendResponseResent,
    ResendResponseNoResend,
    ErrorResponse,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Live message fanned out to all subscribers of a stream partition.
    BroadcastMessage {
        message: StreamMessage,
    },
    /// Message addressed to one requester, e.g. part of a resend.
    UnicastMessage {
        request_id: RequestId,
        message: StreamMessage,
    },
    SubscribeResponse {
        request_id: RequestId,
        stream_id: String,
        stream_partition: u32,
    },
    UnsubscribeResponse {
        request_id: RequestId,
        stream_id: String,
        stream_partition: u32,
    },
    /// Resend accepted; unicast messages follow.
    ResendResponseResending {
        request_id: RequestId,
        stream_id: String,
        stream_partition: u32,
    },
    /// Resend finished; all requested messages were sent.
    ResendResponseResent {
        request_id: RequestId,
        stream_id: String,
        stream_partition: u32,
    },
    /// Resend finished without data.
    ResendResponseNoResend {
        request_id: RequestId,
        stream_id: String,
        stream_partition: u32,
    },
    ErrorResponse {
        request_id: RequestId,
        error_message: String,
    },
}

impl ControlMessage {
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::BroadcastMessage { .. } => ControlKind::BroadcastMessage,
            ControlMessage::UnicastMessage { .. } => ControlKind::UnicastMessage,
            ControlMessage::SubscribeResponse { .. } => ControlKind::SubscribeResponse,
            ControlMessage::UnsubscribeResponse { .. } => ControlKind::UnsubscribeResponse,
            ControlMessage::ResendResponseResending { .. } => ControlKind::ResendResponseResending,
            ControlMessage::ResendResponseResent { .. } => ControlKind::ResendResponseResent,
            ControlMessage::ResendResponseNoResend { .. } => ControlKind::ResendResponseNoResend,
            ControlMessage::ErrorResponse { .. } => ControlKind::ErrorResponse,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            ControlMessage::BroadcastMessage { .. } => None,
            ControlMessage::UnicastMessage { request_id, .. }
            | ControlMessage::SubscribeResponse { request_id, .. }
            | ControlMessage::UnsubscribeResponse { request_id, .. }
            | ControlMessage::ResendResponseResending { request_id, .. }
            | ControlMessage::ResendResponseResent { request_id, .. }
            | ControlMessage::ResendResponseNoResend { request_id, .. }
            | ControlMessage::ErrorResponse { request_id, .. } => Some(request_id),
        }
    }

    pub fn stream_message(&self) -> Option<&StreamMessage> {
        match self {
            ControlMessage::BroadcastMessage { message }
            | ControlMessage::UnicastMessage { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn into_stream_message(self) -> Option<StreamMessage> {
        match self {
            ControlMessage::BroadcastMessage { message }
            | ControlMessage::UnicastMessage { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    Subscribe {
        request_id: RequestId,
        stream_id: String,
        stream_partition: u32,
    },
    Unsubscribe {
        request_id: RequestId,
        stream_id: String,
        stream_partition: u32,
    },
    /// Request the messages of one lineage in the inclusive range `from..=to`.
    ResendRange {
        request_id: RequestId,
        stream_id: String,
        stream_partition: u32,
        from: MessageRef,
        to: MessageRef,
        publisher_id: Identity,
        msg_chain_id: String,
    },
}

impl ControlRequest {
    pub fn request_id(&self) -> &str {
        match self {
            ControlRequest::Subscribe { request_id, .. }
            | ControlRequest::Unsubscribe { request_id, .. }
            | ControlRequest::ResendRange { request_id, .. } => request_id,
        }
    }
}
