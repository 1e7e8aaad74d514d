//! Typed plaintext payloads, one struct per envelope kind.
//!
//! These are what the AEAD layer encrypts. Serialization is bincode; a
//! payload that fails to deserialize after successful decryption is a codec
//! error and the envelope is dropped.

use super::envelope::MsgId;
use crate::error::{Error, Result};
use crate::identity::NodeId;
use serde::{Deserialize, Serialize};

macro_rules! payload_codec {
    ($ty:ty) => {
        impl $ty {
            /// Serialize to bytes.
            pub fn to_bytes(&self) -> Result<Vec<u8>> {
                bincode::serialize(self).map_err(|e| Error::Codec(e.to_string()))
            }

            /// Deserialize from bytes.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))
            }
        }
    };
}

/// `TEXT` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPayload {
    /// The message body.
    pub body: String,
    /// Message this one replies to, if any.
    pub reply_to: Option<MsgId>,
}

payload_codec!(TextPayload);

/// `FILE_CHUNK` payload. Chunk data is base64 so the whole payload stays
/// printable in debug output and exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkPayload {
    /// Identifies the file this chunk belongs to.
    pub file_id: [u8; 16],
    /// Zero-based chunk index.
    pub chunk_idx: u32,
    /// Total number of chunks in the file.
    pub total_chunks: u32,
    /// Original file name.
    pub name: String,
    /// MIME type.
    pub mime: String,
    /// Base64-encoded chunk bytes.
    pub data: String,
}

payload_codec!(FileChunkPayload);

/// `HANDSHAKE_INIT` / `HANDSHAKE_RESP` payload: one cleartext ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Ephemeral X25519 public key.
    pub public_key: [u8; 32],
}

payload_codec!(HandshakePayload);

/// `REACTION` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionPayload {
    /// The message being reacted to.
    pub reply_to: MsgId,
    /// Reaction emoji, UTF-8.
    pub emoji: String,
    /// True to add, false to retract.
    pub add: bool,
}

payload_codec!(ReactionPayload);

/// `TYPING` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    /// Chat the indicator applies to.
    pub chat_id: NodeId,
    /// Whether the sender is currently typing.
    pub typing: bool,
}

payload_codec!(TypingPayload);

/// `ACK` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// The message being acknowledged.
    pub ack_of: MsgId,
}

payload_codec!(AckPayload);

/// `PRESENCE` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    /// Sender wall clock, milliseconds since epoch.
    pub ts_ms: u64,
}

payload_codec!(PresencePayload);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_roundtrip() {
        let payload = TextPayload {
            body: "hi".into(),
            reply_to: Some(MsgId::generate()),
        };
        let parsed = TextPayload::from_bytes(&payload.to_bytes().expect("ser")).expect("de");
        assert_eq!(payload, parsed);
    }

    #[test]
    fn file_chunk_roundtrip() {
        let payload = FileChunkPayload {
            file_id: [7u8; 16],
            chunk_idx: 3,
            total_chunks: 9,
            name: "cat.png".into(),
            mime: "image/png".into(),
            data: "aGVsbG8=".into(),
        };
        let parsed = FileChunkPayload::from_bytes(&payload.to_bytes().expect("ser")).expect("de");
        assert_eq!(payload, parsed);
    }

    #[test]
    fn garbage_is_codec_error() {
        assert!(TextPayload::from_bytes(&[0xFF; 3]).is_err());
        assert!(HandshakePayload::from_bytes(b"short").is_err());
    }
}
