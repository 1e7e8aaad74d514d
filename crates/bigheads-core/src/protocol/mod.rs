//! Wire protocol for the BigHeads mesh.
//!
//! One envelope is one logical message. The header is a strict binary,
//! versioned, big-endian layout; everything after it is AEAD ciphertext.
//! Malformed envelopes are dropped silently.
//!
//! ## Envelope layout
//!
//! ```text
//! magic(2) | version(1) | kind(1) | ttl(1) | hop(1)
//! msg_id(16) | origin(16) | dest(16) | seq(8) | ts(8)
//! nonce(12) | ct_len(4) | ciphertext(ct_len)
//! ```
//!
//! Fixed header: 86 bytes. Multi-byte integers are big-endian.

mod envelope;
mod payload;

pub use envelope::{Envelope, Kind, MsgId, FIXED_HEADER_LEN, MAX_CIPHERTEXT_HARD};
pub use payload::{
    AckPayload, FileChunkPayload, HandshakePayload, PresencePayload, ReactionPayload, TextPayload,
    TypingPayload,
};

use crate::error::{Error, Result};

/// Magic bytes opening every envelope.
pub const MAGIC: [u8; 2] = *b"BH";

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Minimum supported protocol version.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Validate that a protocol version is supported.
pub fn validate_version(version: u8) -> Result<()> {
    if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
        return Err(Error::Codec(format!(
            "unsupported protocol version: {}",
            version
        )));
    }
    Ok(())
}
