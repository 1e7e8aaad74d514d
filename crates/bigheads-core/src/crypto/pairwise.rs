//! Pairwise chat sessions: NN-style handshake and per-message key chains.
//!
//! Two ephemeral X25519 keys are exchanged in cleartext (the exchange is
//! unauthenticated); both sides derive a root key and two directional chain
//! keys. Each
//! message uses a key derived from the chain and the message counter, and the
//! chain is stepped forward so a captured chain key never decrypts earlier
//! traffic on that chain.
//!
//! Receivers tolerate reordering within a window of [`SKIP_WINDOW`] messages
//! by caching skipped message keys; anything outside the window is dropped.

use super::aead::{self, counter_nonce};
use super::keys::{EphemeralKeypair, X25519PublicKey};
use super::{hkdf_derive, KEY_SIZE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use zeroize::Zeroizing;

/// Domain label for the handshake root key.
const ROOT_INFO: &[u8] = b"bigheads/nn/v1";

/// Chain label for traffic from the initiator to the responder.
const CHAIN_A_TO_B: &[u8] = b"a->b";

/// Chain label for traffic from the responder to the initiator.
const CHAIN_B_TO_A: &[u8] = b"b->a";

/// How far ahead of the expected counter a message may arrive.
pub const SKIP_WINDOW: u64 = 32;

/// Which side of the handshake we played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeRole {
    /// We sent the first handshake envelope.
    Initiator,
    /// We answered one.
    Responder,
}

/// Handshake progress for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Initiator: sent our ephemeral key, waiting for the response.
    InitSent,
    /// Responder: computed keys, response envelope not yet on the wire.
    RespSent,
    /// Both chains are live.
    Established,
}

/// Per-peer session state. Owned by the dispatcher; nothing else mutates it.
pub struct PairwiseSession {
    role: HandshakeRole,
    state: HandshakeState,
    /// Initiator's ephemeral half, held until the response arrives.
    ephemeral: Option<EphemeralKeypair>,
    tx_chain: Zeroizing<[u8; KEY_SIZE]>,
    rx_chain: Zeroizing<[u8; KEY_SIZE]>,
    tx_counter: u64,
    /// Next expected inbound counter.
    rx_counter: u64,
    /// Message keys derived for counters that arrived out of order.
    skipped: HashMap<u64, Zeroizing<[u8; KEY_SIZE]>>,
}

/// Serializable form of an established session, for the `sessions` table.
/// Skipped-key cache is intentionally not persisted; messages in flight
/// across a restart fall outside the reorder guarantee anyway.
#[derive(Serialize, Deserialize)]
pub struct SessionSnapshot {
    role: HandshakeRole,
    tx_chain: [u8; KEY_SIZE],
    rx_chain: [u8; KEY_SIZE],
    tx_counter: u64,
    rx_counter: u64,
}

fn chain_message_key(chain: &[u8; KEY_SIZE], counter: u64) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let mut info = Vec::with_capacity(11);
    info.extend_from_slice(b"msg");
    info.extend_from_slice(&counter.to_be_bytes());
    hkdf_derive(None, chain, &info)
}

fn chain_step(chain: &[u8; KEY_SIZE]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    hkdf_derive(None, chain, b"step")
}

impl PairwiseSession {
    /// Start a handshake. Returns the session (state `InitSent`) and the
    /// ephemeral public key to put on the wire.
    pub fn initiate() -> (Self, X25519PublicKey) {
        let ephemeral = EphemeralKeypair::generate();
        let public = *ephemeral.public_key();
        let session = Self {
            role: HandshakeRole::Initiator,
            state: HandshakeState::InitSent,
            ephemeral: Some(ephemeral),
            tx_chain: Zeroizing::new([0u8; KEY_SIZE]),
            rx_chain: Zeroizing::new([0u8; KEY_SIZE]),
            tx_counter: 0,
            rx_counter: 0,
            skipped: HashMap::new(),
        };
        (session, public)
    }

    /// Answer a handshake. Returns the session (state `RespSent`) and our
    /// ephemeral public key for the response envelope.
    pub fn respond(initiator_public: &X25519PublicKey) -> Result<(Self, X25519PublicKey)> {
        let ephemeral = EphemeralKeypair::generate();
        let public = *ephemeral.public_key();
        let shared = ephemeral.diffie_hellman(initiator_public);
        let (tx_chain, rx_chain) = derive_chains(shared.as_bytes(), HandshakeRole::Responder)?;

        Ok((
            Self {
                role: HandshakeRole::Responder,
                state: HandshakeState::RespSent,
                ephemeral: None,
                tx_chain,
                rx_chain,
                tx_counter: 0,
                rx_counter: 0,
                skipped: HashMap::new(),
            },
            public,
        ))
    }

    /// Initiator: finish the handshake with the responder's public key.
    pub fn complete(&mut self, responder_public: &X25519PublicKey) -> Result<()> {
        if self.state != HandshakeState::InitSent {
            return Err(Error::Handshake("unexpected handshake response".into()));
        }
        let ephemeral = self
            .ephemeral
            .take()
            .ok_or_else(|| Error::Handshake("handshake state lost".into()))?;
        let shared = ephemeral.diffie_hellman(responder_public);
        let (tx_chain, rx_chain) = derive_chains(shared.as_bytes(), HandshakeRole::Initiator)?;
        self.tx_chain = tx_chain;
        self.rx_chain = rx_chain;
        self.state = HandshakeState::Established;
        Ok(())
    }

    /// Responder: mark the session live once the response envelope has been
    /// handed to the transport.
    pub fn establish(&mut self) {
        if self.state == HandshakeState::RespSent {
            self.state = HandshakeState::Established;
        }
    }

    /// Current handshake state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Which side we played.
    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Whether both chains are live.
    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// Encrypt the next outgoing message on this chain.
    ///
    /// Returns the counter the receiver needs (it doubles as the nonce seed)
    /// and the ciphertext. Advances the send chain.
    pub fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<(u64, Vec<u8>)> {
        if !self.is_established() {
            return Err(Error::Handshake("session not established".into()));
        }
        let counter = self.tx_counter;
        let key = chain_message_key(&self.tx_chain, counter)?;
        let ciphertext = aead::encrypt(&key, &counter_nonce(counter), plaintext, aad)?;
        self.tx_chain = chain_step(&self.tx_chain)?;
        self.tx_counter += 1;
        Ok((counter, ciphertext))
    }

    /// Decrypt an inbound message with the given chain counter.
    ///
    /// State only advances when authentication succeeds, so a forged or
    /// corrupted envelope cannot desynchronize the chain.
    pub fn decrypt(
        &mut self,
        counter: u64,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        if !self.is_established() {
            return Err(Error::Handshake("session not established".into()));
        }

        // Late arrival: only decryptable if we cached its key.
        if counter < self.rx_counter {
            let key = self
                .skipped
                .get(&counter)
                .ok_or_else(|| Error::Crypto("counter below receive window".into()))?;
            let plaintext = aead::decrypt(key, &counter_nonce(counter), ciphertext, aad)?;
            self.skipped.remove(&counter);
            return Ok(plaintext);
        }

        if counter - self.rx_counter > SKIP_WINDOW {
            return Err(Error::Crypto("counter beyond receive window".into()));
        }

        // Derive forward on scratch state; commit only after auth succeeds.
        let mut chain = self.rx_chain.clone();
        let mut newly_skipped = Vec::new();
        for skipped_counter in self.rx_counter..counter {
            newly_skipped.push((skipped_counter, chain_message_key(&chain, skipped_counter)?));
            chain = chain_step(&chain)?;
        }
        let key = chain_message_key(&chain, counter)?;
        let plaintext = aead::decrypt(&key, &counter_nonce(counter), ciphertext, aad)?;

        self.rx_chain = chain_step(&chain)?;
        self.rx_counter = counter + 1;
        for (skipped_counter, skipped_key) in newly_skipped {
            self.skipped.insert(skipped_counter, skipped_key);
        }
        // Keep the cache bounded; old entries are unreachable anyway.
        if self.skipped.len() as u64 > SKIP_WINDOW {
            let min_live = self.rx_counter.saturating_sub(SKIP_WINDOW);
            self.skipped.retain(|&c, _| c >= min_live);
        }
        Ok(plaintext)
    }

    /// Snapshot an established session for persistence.
    pub fn snapshot(&self) -> Result<SessionSnapshot> {
        if !self.is_established() {
            return Err(Error::Handshake("cannot persist unestablished session".into()));
        }
        Ok(SessionSnapshot {
            role: self.role,
            tx_chain: *self.tx_chain,
            rx_chain: *self.rx_chain,
            tx_counter: self.tx_counter,
            rx_counter: self.rx_counter,
        })
    }

    /// Restore a session from a persisted snapshot.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            role: snapshot.role,
            state: HandshakeState::Established,
            ephemeral: None,
            tx_chain: Zeroizing::new(snapshot.tx_chain),
            rx_chain: Zeroizing::new(snapshot.rx_chain),
            tx_counter: snapshot.tx_counter,
            rx_counter: snapshot.rx_counter,
            skipped: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for PairwiseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairwiseSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("tx_counter", &self.tx_counter)
            .field("rx_counter", &self.rx_counter)
            .finish()
    }
}

/// Derive the directional chain keys from the raw shared secret.
fn derive_chains(
    shared: &[u8; KEY_SIZE],
    role: HandshakeRole,
) -> Result<(Zeroizing<[u8; KEY_SIZE]>, Zeroizing<[u8; KEY_SIZE]>)> {
    let root = hkdf_derive(None, shared, ROOT_INFO)?;
    let a_to_b = hkdf_derive(None, &root[..], CHAIN_A_TO_B)?;
    let b_to_a = hkdf_derive(None, &root[..], CHAIN_B_TO_A)?;
    Ok(match role {
        HandshakeRole::Initiator => (a_to_b, b_to_a),
        HandshakeRole::Responder => (b_to_a, a_to_b),
    })
}
