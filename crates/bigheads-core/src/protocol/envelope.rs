//! Envelope codec: the fixed-header binary layout and strict parsing.

use super::{validate_version, MAGIC, PROTOCOL_VERSION};
use crate::crypto::{Nonce, NONCE_SIZE};
use crate::error::{Error, Result};
use crate::identity::{NodeId, NODE_ID_SIZE};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the fixed envelope header in bytes.
pub const FIXED_HEADER_LEN: usize = 2 + 1 + 1 + 1 + 1 + NODE_ID_SIZE * 3 + 8 + 8 + NONCE_SIZE + 4;

/// Hard sanity cap on ciphertext length, independent of configuration.
pub const MAX_CIPHERTEXT_HARD: usize = 64 * 1024;

/// Size of a message identifier in bytes.
pub const MSG_ID_SIZE: usize = 16;

/// Globally unique message identifier, generated by the originator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgId([u8; MSG_ID_SIZE]);

impl MsgId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(crate::crypto::random_bytes::<MSG_ID_SIZE>())
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; MSG_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice of exactly [`MSG_ID_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; MSG_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::Codec("invalid message id length".into()))?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; MSG_ID_SIZE] {
        &self.0
    }

    /// Hex rendering, used as DB key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from the hex rendering.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::Codec("invalid message id hex".into()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgId({})", self)
    }
}

/// Envelope kinds. Unknown bytes are a codec error (dropped, counted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Kind {
    /// Chat text.
    Text = 0x01,
    /// One piece of an inline file transfer.
    FileChunk = 0x02,
    /// Handshake opener carrying a cleartext ephemeral public key.
    HandshakeInit = 0x03,
    /// Handshake answer carrying a cleartext ephemeral public key.
    HandshakeResp = 0x04,
    /// Emoji reaction to an earlier message.
    Reaction = 0x05,
    /// Typing indicator.
    Typing = 0x06,
    /// Delivery acknowledgment.
    Ack = 0x07,
    /// Periodic liveness beacon.
    Presence = 0x08,
}

impl Kind {
    /// Parse from byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::Text),
            0x02 => Ok(Self::FileChunk),
            0x03 => Ok(Self::HandshakeInit),
            0x04 => Ok(Self::HandshakeResp),
            0x05 => Ok(Self::Reaction),
            0x06 => Ok(Self::Typing),
            0x07 => Ok(Self::Ack),
            0x08 => Ok(Self::Presence),
            _ => Err(Error::Codec(format!("unknown kind: {:#04x}", byte))),
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Handshake envelopes carry cleartext payloads.
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::HandshakeInit | Self::HandshakeResp)
    }
}

/// The unit of transmission on the mesh. Immutable once emitted; a relay
/// produces a new envelope via [`Envelope::relayed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Unique dedupe key, assigned by the originator.
    pub msg_id: MsgId,
    /// Originating node.
    pub origin: NodeId,
    /// Destination node, or the broadcast sentinel.
    pub dest: NodeId,
    /// Payload kind.
    pub kind: Kind,
    /// Hops remaining; decremented before each relay, dropped at zero.
    pub ttl: u8,
    /// Hops taken so far. Diagnostic only.
    pub hop: u8,
    /// Originator-assigned stream counter, per kind.
    pub seq: u64,
    /// Originator wall clock, milliseconds since epoch. Advisory.
    pub ts: u64,
    /// AEAD nonce (all zero for cleartext handshake payloads).
    pub nonce: Nonce,
    /// AEAD output, or the raw handshake payload.
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Associated data binding routing metadata to the ciphertext:
    /// `msg_id ‖ origin ‖ dest ‖ kind ‖ seq`.
    pub fn aad(msg_id: &MsgId, origin: &NodeId, dest: &NodeId, kind: Kind, seq: u64) -> Vec<u8> {
        let mut aad = Vec::with_capacity(MSG_ID_SIZE + NODE_ID_SIZE * 2 + 1 + 8);
        aad.extend_from_slice(msg_id.as_bytes());
        aad.extend_from_slice(origin.as_bytes());
        aad.extend_from_slice(dest.as_bytes());
        aad.push(kind.to_byte());
        aad.extend_from_slice(&seq.to_be_bytes());
        aad
    }

    /// This envelope's associated data.
    pub fn own_aad(&self) -> Vec<u8> {
        Self::aad(&self.msg_id, &self.origin, &self.dest, self.kind, self.seq)
    }

    /// Serialize for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_HEADER_LEN + self.ciphertext.len());
        out.extend_from_slice(&MAGIC);
        out.push(PROTOCOL_VERSION);
        out.push(self.kind.to_byte());
        out.push(self.ttl);
        out.push(self.hop);
        out.extend_from_slice(self.msg_id.as_bytes());
        out.extend_from_slice(self.origin.as_bytes());
        out.extend_from_slice(self.dest.as_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ts.to_be_bytes());
        out.extend_from_slice(self.nonce.as_bytes());
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse an envelope. Any deviation from the layout is a codec error.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FIXED_HEADER_LEN {
            return Err(Error::Codec("envelope too short".into()));
        }
        if bytes[0..2] != MAGIC {
            return Err(Error::Codec("bad magic".into()));
        }
        validate_version(bytes[2])?;
        let kind = Kind::from_byte(bytes[3])?;
        let ttl = bytes[4];
        let hop = bytes[5];

        let mut offset = 6;
        let msg_id = MsgId::from_slice(&bytes[offset..offset + MSG_ID_SIZE])?;
        offset += MSG_ID_SIZE;
        let origin = NodeId::from_slice(&bytes[offset..offset + NODE_ID_SIZE])?;
        offset += NODE_ID_SIZE;
        let dest = NodeId::from_slice(&bytes[offset..offset + NODE_ID_SIZE])?;
        offset += NODE_ID_SIZE;

        let seq = u64::from_be_bytes(
            bytes[offset..offset + 8]
                .try_into()
                .map_err(|_| Error::Codec("invalid seq".into()))?,
        );
        offset += 8;
        let ts = u64::from_be_bytes(
            bytes[offset..offset + 8]
                .try_into()
                .map_err(|_| Error::Codec("invalid ts".into()))?,
        );
        offset += 8;

        let nonce_bytes: [u8; NONCE_SIZE] = bytes[offset..offset + NONCE_SIZE]
            .try_into()
            .map_err(|_| Error::Codec("invalid nonce".into()))?;
        offset += NONCE_SIZE;

        let ct_len = u32::from_be_bytes(
            bytes[offset..offset + 4]
                .try_into()
                .map_err(|_| Error::Codec("invalid length field".into()))?,
        ) as usize;
        offset += 4;

        if ct_len > MAX_CIPHERTEXT_HARD {
            return Err(Error::Codec("ciphertext too large".into()));
        }
        if bytes.len() != offset + ct_len {
            return Err(Error::Codec("length mismatch".into()));
        }

        Ok(Self {
            msg_id,
            origin,
            dest,
            kind,
            ttl,
            hop,
            seq,
            ts,
            nonce: Nonce::from_bytes(nonce_bytes),
            ciphertext: bytes[offset..].to_vec(),
        })
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.ciphertext.len()
    }

    /// Produce the relay copy: TTL down one, hop up one.
    ///
    /// Returns `None` when the envelope must not travel further; a relayed
    /// copy is never emitted with `ttl == 0`.
    pub fn relayed(&self) -> Option<Self> {
        if self.ttl <= 1 {
            return None;
        }
        let mut copy = self.clone();
        copy.ttl -= 1;
        copy.hop = copy.hop.saturating_add(1);
        Some(copy)
    }
}
