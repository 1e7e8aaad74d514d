//! The mesh dispatcher: inbound pipeline, outbound pipeline, outbox flushes
//! and handshake orchestration.
//!
//! One dispatcher task owns all envelope processing, so "first sight of a
//! message" and the relay decision are serialized per node. The radios (or a
//! test fabric) feed it through a bounded queue; overflow drops envelopes and
//! counts them, which flooding redundancy absorbs.

use super::files::{chunk_file, CompletedFile, FileAssembler};
use crate::bus::{Bus, Event};
use crate::config::Config;
use crate::crypto::{GroupCipher, HandshakeState, Nonce, PairwiseSession, TAG_SIZE};
use crate::error::{Error, Result};
use crate::identity::{NodeId, BROADCAST};
use crate::protocol::{
    AckPayload, Envelope, FileChunkPayload, HandshakePayload, Kind, MsgId, PresencePayload,
    ReactionPayload, TextPayload, TypingPayload,
};
use crate::storage::{MessageRecord, MessageState, ReactionRecord, Store};
use crate::transport::{LinkAddr, LinkState, TransportCommand, TransportEvent};
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Envelopes with a TTL above this are policy violations.
pub const MAX_TTL: u8 = 32;

/// Inbound queue depth. Overflow drops envelopes; they are redundant by
/// design.
const INBOUND_QUEUE: usize = 1024;

/// Outbox entries older than this are age-expired as failed (7 days).
pub const OUTBOX_MAX_AGE_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Seconds without a handshake response before a retransmit.
const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Failed handshake rounds before giving up.
const HANDSHAKE_MAX_FAILURES: u32 = 3;

/// Routing hints older than this are ignored (24 h).
const ROUTE_STALENESS_MS: u64 = 24 * 60 * 60 * 1000;

/// In-process front of the durable seen table.
const SEEN_CACHE_SIZE: usize = 4096;

/// Wall clock in milliseconds since epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Input to the dispatcher.
#[derive(Debug)]
pub enum Inbound {
    /// A reassembled frame from a link.
    Frame {
        /// Link it arrived on.
        addr: LinkAddr,
        /// Encoded envelope.
        bytes: Vec<u8>,
    },
    /// A link came up.
    Connected {
        /// The link.
        addr: LinkAddr,
    },
    /// A link went down.
    Disconnected {
        /// The link.
        addr: LinkAddr,
    },
}

/// Pipeline counters. Inbound errors never propagate; they land here.
#[derive(Default)]
pub struct Counters {
    /// Envelopes dropped as already seen.
    pub duplicates: AtomicU64,
    /// Envelopes dropped because their origin is blocked.
    pub blocked: AtomicU64,
    /// Malformed envelopes or payloads.
    pub codec_errors: AtomicU64,
    /// Decrypt/auth failures.
    pub crypto_errors: AtomicU64,
    /// Protocol invariant violations.
    pub policy_drops: AtomicU64,
    /// Frames lost to inbound queue overflow.
    pub inbound_overflow: AtomicU64,
    /// Envelopes relayed onward.
    pub relayed: AtomicU64,
    /// Envelopes delivered to this node's bus.
    pub delivered: AtomicU64,
    /// Envelopes dropped because we originated them.
    pub self_origin: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    /// See [`Counters::duplicates`].
    pub duplicates: u64,
    /// See [`Counters::blocked`].
    pub blocked: u64,
    /// See [`Counters::codec_errors`].
    pub codec_errors: u64,
    /// See [`Counters::crypto_errors`].
    pub crypto_errors: u64,
    /// See [`Counters::policy_drops`].
    pub policy_drops: u64,
    /// See [`Counters::inbound_overflow`].
    pub inbound_overflow: u64,
    /// See [`Counters::relayed`].
    pub relayed: u64,
    /// See [`Counters::delivered`].
    pub delivered: u64,
    /// See [`Counters::self_origin`].
    pub self_origin: u64,
}

impl Counters {
    fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            duplicates: self.duplicates.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            codec_errors: self.codec_errors.load(Ordering::Relaxed),
            crypto_errors: self.crypto_errors.load(Ordering::Relaxed),
            policy_drops: self.policy_drops.load(Ordering::Relaxed),
            inbound_overflow: self.inbound_overflow.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            self_origin: self.self_origin.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Links {
    connected: HashSet<LinkAddr>,
    addr_to_node: HashMap<LinkAddr, NodeId>,
    node_to_addr: HashMap<NodeId, LinkAddr>,
}

struct PendingSend {
    msg_id: MsgId,
    kind: Kind,
    payload: Vec<u8>,
}

struct HandshakeAttempt {
    started: Instant,
    resent: bool,
    failures: u32,
}

/// Chat export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Machine-readable JSON.
    Json,
    /// A minimal standalone HTML page.
    Html,
}

struct Inner {
    node_id: NodeId,
    config: Config,
    store: Arc<Store>,
    group: GroupCipher,
    bus: Arc<Bus>,
    cmd_tx: mpsc::Sender<TransportCommand>,
    inbound_tx: mpsc::Sender<Inbound>,
    sessions: Mutex<HashMap<NodeId, PairwiseSession>>,
    pending: Mutex<HashMap<NodeId, Vec<PendingSend>>>,
    handshakes: Mutex<HashMap<NodeId, HandshakeAttempt>>,
    links: Mutex<Links>,
    assembler: Mutex<FileAssembler>,
    seen_cache: Mutex<LruCache<MsgId, ()>>,
    counters: Counters,
}

/// The mesh service. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct MeshService {
    inner: Arc<Inner>,
}

impl MeshService {
    /// Build the service. Returns the dispatcher's inbound receiver; hand it
    /// to [`MeshService::spawn_dispatcher`].
    pub fn new(
        node_id: NodeId,
        config: Config,
        store: Arc<Store>,
        group: GroupCipher,
        bus: Arc<Bus>,
        cmd_tx: mpsc::Sender<TransportCommand>,
    ) -> (Self, mpsc::Receiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let max_file = config.max_inline_file_bytes as usize;
        let service = Self {
            inner: Arc::new(Inner {
                node_id,
                config,
                store,
                group,
                bus,
                cmd_tx,
                inbound_tx,
                sessions: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                handshakes: Mutex::new(HashMap::new()),
                links: Mutex::new(Links::default()),
                assembler: Mutex::new(FileAssembler::new(max_file)),
                seen_cache: Mutex::new(LruCache::new(
                    NonZeroUsize::new(SEEN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
                )),
                counters: Counters::default(),
            }),
        };
        (service, inbound_rx)
    }

    /// This node's identifier.
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    /// Current pipeline counters.
    pub fn counters(&self) -> CountersSnapshot {
        self.inner.counters.snapshot()
    }

    /// Restore persisted pairwise sessions.
    pub async fn load_sessions(&self) -> Result<()> {
        let stored = self.inner.store.session_load_all()?;
        let mut sessions = self.inner.sessions.lock().await;
        for (peer, blob) in stored {
            match bincode::deserialize(&blob) {
                Ok(snapshot) => {
                    sessions.insert(peer, PairwiseSession::from_snapshot(snapshot));
                }
                Err(e) => warn!(peer = %peer, error = %e, "discarding corrupt session snapshot"),
            }
        }
        info!(count = sessions.len(), "pairwise sessions restored");
        Ok(())
    }

    // ------------------------------------------------------------------
    // task entry points
    // ------------------------------------------------------------------

    /// Pump transport events into the dispatcher queue and the bus.
    ///
    /// Frames use a non-blocking enqueue: a full dispatcher queue drops the
    /// frame and counts it. Lifecycle events always get through.
    pub fn spawn_event_pump(
        &self,
        mut event_rx: mpsc::Receiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        service.on_transport_event(event).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerDiscovered { addr, rssi } => {
                self.inner
                    .bus
                    .publish(Event::TransportNotice {
                        addr: addr.clone(),
                        detail: format!("discovered (rssi {:?})", rssi),
                    })
                    .await;
            }
            TransportEvent::PeerConnected { addr } => {
                let _ = self.inner.inbound_tx.send(Inbound::Connected { addr }).await;
            }
            TransportEvent::PeerDisconnected { addr } => {
                let _ = self
                    .inner
                    .inbound_tx
                    .send(Inbound::Disconnected { addr })
                    .await;
            }
            TransportEvent::FrameReceived { addr, frame } => {
                if self
                    .inner
                    .inbound_tx
                    .try_send(Inbound::Frame { addr, bytes: frame })
                    .is_err()
                {
                    self.inner
                        .counters
                        .inbound_overflow
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Run the dispatcher until shutdown. Inbound errors become counters;
    /// only a failed seen-cache write terminates the pipeline.
    pub fn spawn_dispatcher(
        &self,
        mut inbound_rx: mpsc::Receiver<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = inbound_rx.recv() => {
                        let Some(item) = item else { break };
                        match item {
                            Inbound::Frame { addr, bytes } => {
                                if let Err(e) = service.process_frame(&addr, &bytes).await {
                                    if matches!(e, Error::Storage(_)) {
                                        error!(error = %e, "seen-cache write failed; stopping dispatcher");
                                        break;
                                    }
                                    service.count_error(&e);
                                    if !e.should_silent_drop() {
                                        warn!(error = %e, "envelope dropped");
                                    } else {
                                        debug!(error = %e, "envelope dropped");
                                    }
                                }
                            }
                            Inbound::Connected { addr } => service.on_link_up(addr).await,
                            Inbound::Disconnected { addr } => service.on_link_down(addr).await,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("dispatcher stopped");
        })
    }

    fn count_error(&self, e: &Error) {
        let counters = &self.inner.counters;
        match e {
            Error::Codec(_) => counters.codec_errors.fetch_add(1, Ordering::Relaxed),
            Error::Crypto(_) => counters.crypto_errors.fetch_add(1, Ordering::Relaxed),
            Error::Policy(_) => counters.policy_drops.fetch_add(1, Ordering::Relaxed),
            _ => counters.policy_drops.fetch_add(1, Ordering::Relaxed),
        };
    }

    // ------------------------------------------------------------------
    // link lifecycle
    // ------------------------------------------------------------------

    async fn on_link_up(&self, addr: LinkAddr) {
        let known_node = {
            let mut links = self.inner.links.lock().await;
            links.connected.insert(addr.clone());
            links.addr_to_node.get(&addr).copied()
        };
        self.inner
            .bus
            .publish(Event::PeerState {
                node: known_node,
                addr: addr.clone(),
                state: LinkState::Connected,
            })
            .await;
        if let Some(node) = known_node {
            self.flush_outbox_for(node, Some(&addr)).await;
        }
    }

    async fn on_link_down(&self, addr: LinkAddr) {
        let known_node = {
            let mut links = self.inner.links.lock().await;
            links.connected.remove(&addr);
            links.addr_to_node.get(&addr).copied()
        };
        self.inner
            .bus
            .publish(Event::PeerState {
                node: known_node,
                addr,
                state: LinkState::Disconnected,
            })
            .await;
    }

    // ------------------------------------------------------------------
    // inbound pipeline
    // ------------------------------------------------------------------

    async fn process_frame(&self, addr: &str, bytes: &[u8]) -> Result<()> {
        let env = Envelope::decode(bytes)?;

        if env.ttl > MAX_TTL {
            return Err(Error::Policy(format!("ttl {} above cap", env.ttl)));
        }
        if env.encoded_len() > self.inner.config.packet_size_limit as usize {
            return Err(Error::Policy("envelope above packet size limit".into()));
        }
        if env.origin == self.inner.node_id {
            self.inner
                .counters
                .self_origin
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Dedupe is the very first stateful step; everything after it runs
        // at most once per msg_id, even with concurrent radios.
        if !self.seen_first_sight(&env.msg_id).await? {
            self.inner
                .counters
                .duplicates
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let now = now_ms();

        // hop == 0 means the envelope came straight from its originator, so
        // the link address maps to that node.
        if env.hop == 0 {
            {
                let mut links = self.inner.links.lock().await;
                links.addr_to_node.insert(addr.to_string(), env.origin);
                links.node_to_addr.insert(env.origin, addr.to_string());
            }
            if let Err(e) = self
                .inner
                .store
                .peer_observe_radio(&env.origin, addr, None, Some(now))
            {
                warn!(error = %e, "peer radio record failed");
            }
        }
        let via_node = {
            let links = self.inner.links.lock().await;
            links.addr_to_node.get(addr).copied()
        };
        if let Some(via) = via_node {
            if let Err(e) = self.inner.store.route_observe(&env.origin, &via, now) {
                warn!(error = %e, "route hint write failed");
            }
        }
        if let Err(e) = self.inner.store.peer_upsert(&env.origin, now) {
            warn!(error = %e, "peer upsert failed");
        }

        // Blocked origins are dropped after the seen bookkeeping so their
        // traffic is never re-flooded either.
        if self.inner.store.is_blocked(&env.origin).unwrap_or(false) {
            self.inner.counters.blocked.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Delivery runs before the relay decision: a broadcast that fails
        // authentication has already burned its msg_id in the seen set and
        // is not propagated further.
        let for_us = env.dest == self.inner.node_id || env.dest.is_broadcast();
        if for_us {
            self.deliver(&env, addr).await?;
        }

        if env.dest != self.inner.node_id {
            if let Some(relayed) = env.relayed() {
                self.inner.counters.relayed.fetch_add(1, Ordering::Relaxed);
                let _ = self
                    .inner
                    .cmd_tx
                    .send(TransportCommand::Broadcast {
                        frame: relayed.encode(),
                        exclude: Some(addr.to_string()),
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// Atomic first-sight test: LRU fast path, then the durable table.
    async fn seen_first_sight(&self, msg_id: &MsgId) -> Result<bool> {
        {
            let mut cache = self.inner.seen_cache.lock().await;
            if cache.contains(msg_id) {
                return Ok(false);
            }
        }
        let fresh = self.inner.store.seen_add(
            msg_id,
            self.inner.config.seen_lru_limit,
            now_ms(),
        )?;
        if fresh {
            let mut cache = self.inner.seen_cache.lock().await;
            cache.put(*msg_id, ());
        }
        Ok(fresh)
    }

    /// Decrypt and dispatch an envelope addressed to us (or broadcast).
    async fn deliver(&self, env: &Envelope, addr: &str) -> Result<()> {
        let aad = env.own_aad();

        if env.kind.is_handshake() {
            if env.dest.is_broadcast() {
                return Err(Error::Policy("broadcast handshake".into()));
            }
            return self.handle_handshake(env).await;
        }

        let plaintext: Vec<u8> = if env.dest.is_broadcast() {
            self.inner
                .group
                .open(&env.nonce, &env.ciphertext, &aad)?
                .to_vec()
        } else {
            let counter = chain_counter_from_nonce(&env.nonce);
            let mut sessions = self.inner.sessions.lock().await;
            let session = sessions
                .get_mut(&env.origin)
                .ok_or_else(|| Error::Crypto("no session for pairwise envelope".into()))?;
            let plaintext = session.decrypt(counter, &env.ciphertext, &aad)?.to_vec();
            drop(sessions);
            self.persist_session(env.origin).await;
            plaintext
        };

        self.dispatch_plaintext(env, &plaintext, addr).await
    }

    async fn dispatch_plaintext(&self, env: &Envelope, plaintext: &[u8], addr: &str) -> Result<()> {
        let chat_id = if env.dest.is_broadcast() {
            BROADCAST
        } else {
            env.origin
        };
        let now = now_ms();

        match env.kind {
            Kind::Text => {
                let payload = TextPayload::from_bytes(plaintext)?;
                let record = MessageRecord {
                    msg_id: env.msg_id,
                    chat_id,
                    origin: env.origin,
                    dest: env.dest,
                    kind: Kind::Text,
                    body: payload.body,
                    ts: env.ts,
                    seq: env.seq,
                    outgoing: false,
                    state: MessageState::Delivered,
                };
                if let Err(e) = self.inner.store.message_put(&record) {
                    warn!(error = %e, "message archive write failed");
                }
                self.inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
                self.inner.bus.publish(Event::Message { record }).await;

                // Unicast text answers with a delivery ack.
                if env.dest == self.inner.node_id {
                    if let Err(e) = self.send_ack(env.origin, env.msg_id).await {
                        debug!(error = %e, "ack send failed");
                    }
                }
            }
            Kind::FileChunk => {
                let payload = FileChunkPayload::from_bytes(plaintext)?;
                let completed = {
                    let mut assembler = self.inner.assembler.lock().await;
                    assembler.push(payload, env.origin, chat_id)?
                };
                if let Some(file) = completed {
                    self.on_file_complete(file, env, now).await;
                }
            }
            Kind::Reaction => {
                let payload = ReactionPayload::from_bytes(plaintext)?;
                if let Err(e) = self.inner.store.reaction_add(&ReactionRecord {
                    msg_id: payload.reply_to,
                    reactor: env.origin,
                    emoji: payload.emoji.clone(),
                    ts: now,
                }) {
                    warn!(error = %e, "reaction write failed");
                }
                self.inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .bus
                    .publish(Event::Reaction {
                        msg_id: payload.reply_to,
                        reactor: env.origin,
                        emoji: payload.emoji,
                        add: payload.add,
                    })
                    .await;
            }
            Kind::Typing => {
                let payload = TypingPayload::from_bytes(plaintext)?;
                self.inner
                    .bus
                    .publish(Event::Typing {
                        chat_id: payload.chat_id,
                        node: env.origin,
                        typing: payload.typing,
                    })
                    .await;
            }
            Kind::Ack => {
                let payload = AckPayload::from_bytes(plaintext)?;
                if let Err(e) = self
                    .inner
                    .store
                    .message_update_state(&payload.ack_of, MessageState::Delivered)
                {
                    warn!(error = %e, "ack state update failed");
                }
                let _ = self.inner.store.outbox_delete(&payload.ack_of);
                self.inner
                    .bus
                    .publish(Event::MessageState {
                        msg_id: payload.ack_of,
                        state: MessageState::Delivered,
                    })
                    .await;
            }
            Kind::Presence => {
                let _ = PresencePayload::from_bytes(plaintext)?;
                self.inner
                    .bus
                    .publish(Event::PeerState {
                        node: Some(env.origin),
                        addr: addr.to_string(),
                        state: LinkState::Connected,
                    })
                    .await;
                // A reachable origin is the moment to drain its queue.
                self.flush_outbox_for(env.origin, Some(addr)).await;
            }
            Kind::HandshakeInit | Kind::HandshakeResp => unreachable!("handled in deliver"),
        }
        Ok(())
    }

    async fn on_file_complete(&self, file: CompletedFile, env: &Envelope, now: u64) {
        let record = MessageRecord {
            msg_id: env.msg_id,
            chat_id: file.chat_id,
            origin: file.origin,
            dest: env.dest,
            kind: Kind::FileChunk,
            body: format!("{} ({}, {} bytes)", file.name, file.mime, file.bytes.len()),
            ts: now,
            seq: env.seq,
            outgoing: false,
            state: MessageState::Delivered,
        };
        if let Err(e) = self.inner.store.message_put(&record) {
            warn!(error = %e, "file record write failed");
        }
        self.inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bus
            .publish(Event::FileComplete {
                file_id: file.file_id,
                name: file.name,
                mime: file.mime,
                bytes: file.bytes,
                origin: file.origin,
                chat_id: file.chat_id,
            })
            .await;
    }

    // ------------------------------------------------------------------
    // handshake
    // ------------------------------------------------------------------

    async fn handle_handshake(&self, env: &Envelope) -> Result<()> {
        let payload = HandshakePayload::from_bytes(&env.ciphertext)?;
        let peer_public = crate::crypto::X25519PublicKey::from_bytes(payload.public_key);

        match env.kind {
            Kind::HandshakeInit => {
                // Simultaneous open: both sides sent an init. The node with
                // the higher id keeps the initiator role and ignores the
                // peer's init; the other adopts the responder role.
                let keep_initiator = {
                    let sessions = self.inner.sessions.lock().await;
                    matches!(
                        sessions.get(&env.origin),
                        Some(s) if s.state() == HandshakeState::InitSent
                    ) && self.inner.node_id > env.origin
                };
                if keep_initiator {
                    return Ok(());
                }
                self.inner.handshakes.lock().await.remove(&env.origin);

                let (mut session, our_public) = PairwiseSession::respond(&peer_public)?;
                let resp = HandshakePayload {
                    public_key: *our_public.as_bytes(),
                };
                // A storage hiccup here must not take the dispatcher down
                // the way a failed seen write does.
                let resp_env = self
                    .originate(env.origin, Kind::HandshakeResp, resp.to_bytes()?)
                    .await
                    .map_err(|e| match e {
                        Error::Storage(msg) => Error::Handshake(msg),
                        other => other,
                    })?;
                self.transmit(&resp_env, None).await;
                session.establish();
                {
                    let mut sessions = self.inner.sessions.lock().await;
                    sessions.insert(env.origin, session);
                }
                self.persist_session(env.origin).await;
                self.inner
                    .bus
                    .publish(Event::Handshake {
                        peer: env.origin,
                        state: HandshakeState::Established,
                    })
                    .await;
                self.drain_pending(env.origin).await;
            }
            Kind::HandshakeResp => {
                let completed = {
                    let mut sessions = self.inner.sessions.lock().await;
                    match sessions.get_mut(&env.origin) {
                        Some(session) if !session.is_established() => {
                            session.complete(&peer_public)?;
                            true
                        }
                        _ => false,
                    }
                };
                if !completed {
                    return Err(Error::Policy("unsolicited handshake response".into()));
                }
                self.inner.handshakes.lock().await.remove(&env.origin);
                self.persist_session(env.origin).await;
                self.inner
                    .bus
                    .publish(Event::Handshake {
                        peer: env.origin,
                        state: HandshakeState::Established,
                    })
                    .await;
                self.drain_pending(env.origin).await;
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Snapshot an established session into the store.
    async fn persist_session(&self, peer: NodeId) {
        let blob = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .get(&peer)
                .and_then(|s| s.snapshot().ok())
                .and_then(|snap| bincode::serialize(&snap).ok())
        };
        if let Some(blob) = blob {
            if let Err(e) = self.inner.store.session_save(&peer, &blob, now_ms()) {
                warn!(peer = %peer, error = %e, "session snapshot write failed");
            }
        }
    }

    /// Start a handshake with a peer unless one is already in flight.
    async fn ensure_handshake(&self, peer: NodeId) -> Result<()> {
        {
            let sessions = self.inner.sessions.lock().await;
            if sessions.get(&peer).map(|s| s.is_established()).unwrap_or(false) {
                return Ok(());
            }
            if sessions.contains_key(&peer) {
                return Ok(()); // already in flight
            }
        }
        self.start_handshake(peer, 0).await
    }

    async fn start_handshake(&self, peer: NodeId, failures: u32) -> Result<()> {
        let (session, our_public) = PairwiseSession::initiate();
        let payload = HandshakePayload {
            public_key: *our_public.as_bytes(),
        };
        {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.insert(peer, session);
        }
        {
            let mut handshakes = self.inner.handshakes.lock().await;
            handshakes.insert(
                peer,
                HandshakeAttempt {
                    started: Instant::now(),
                    resent: false,
                    failures,
                },
            );
        }
        let env = self
            .originate(peer, Kind::HandshakeInit, payload.to_bytes()?)
            .await?;
        self.transmit(&env, None).await;
        self.inner
            .bus
            .publish(Event::Handshake {
                peer,
                state: HandshakeState::InitSent,
            })
            .await;
        Ok(())
    }

    /// Drive handshake retransmits. Call every few seconds.
    pub async fn handshake_tick(&self) {
        let timeout = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);
        let stale: Vec<(NodeId, bool, u32)> = {
            let handshakes = self.inner.handshakes.lock().await;
            handshakes
                .iter()
                .filter(|(_, a)| a.started.elapsed() >= timeout)
                .map(|(peer, a)| (*peer, a.resent, a.failures))
                .collect()
        };

        for (peer, resent, failures) in stale {
            if !resent {
                // One retransmit of the same attempt before calling it failed.
                let resend = {
                    let mut handshakes = self.inner.handshakes.lock().await;
                    if let Some(attempt) = handshakes.get_mut(&peer) {
                        attempt.resent = true;
                        attempt.started = Instant::now();
                        true
                    } else {
                        false
                    }
                };
                if resend {
                    debug!(peer = %peer, "handshake retransmit");
                    if let Err(e) = self.resend_init(peer).await {
                        debug!(peer = %peer, error = %e, "handshake retransmit failed");
                    }
                }
                continue;
            }

            let failures = failures + 1;
            if failures >= HANDSHAKE_MAX_FAILURES {
                warn!(peer = %peer, "handshake failed after {} rounds", failures);
                {
                    self.inner.handshakes.lock().await.remove(&peer);
                    self.inner.sessions.lock().await.remove(&peer);
                }
                let abandoned: Vec<PendingSend> = {
                    let mut pending = self.inner.pending.lock().await;
                    pending.remove(&peer).unwrap_or_default()
                };
                for send in &abandoned {
                    let _ = self
                        .inner
                        .store
                        .message_update_state(&send.msg_id, MessageState::Failed);
                    self.inner
                        .bus
                        .publish(Event::MessageState {
                            msg_id: send.msg_id,
                            state: MessageState::Failed,
                        })
                        .await;
                }
                self.inner.bus.publish(Event::HandshakeFailed { peer }).await;
                self.inner
                    .bus
                    .publish(Event::SystemNotice {
                        chat_id: peer,
                        text: "secure session could not be established".into(),
                    })
                    .await;
            } else {
                debug!(peer = %peer, failures, "handshake round failed; retrying");
                if let Err(e) = self.start_handshake(peer, failures).await {
                    debug!(peer = %peer, error = %e, "handshake restart failed");
                }
            }
        }
    }

    async fn resend_init(&self, peer: NodeId) -> Result<()> {
        // A fresh envelope (new msg_id) carrying the same ephemeral key would
        // require keeping the init payload around; a new attempt is simpler
        // and equivalent for an unauthenticated exchange.
        let public = {
            let mut sessions = self.inner.sessions.lock().await;
            let (session, public) = PairwiseSession::initiate();
            sessions.insert(peer, session);
            public
        };
        let payload = HandshakePayload {
            public_key: *public.as_bytes(),
        };
        let env = self
            .originate(peer, Kind::HandshakeInit, payload.to_bytes()?)
            .await?;
        self.transmit(&env, None).await;
        Ok(())
    }

    /// Encrypt and send everything queued while the handshake ran.
    async fn drain_pending(&self, peer: NodeId) {
        let queued: Vec<PendingSend> = {
            let mut pending = self.inner.pending.lock().await;
            pending.remove(&peer).unwrap_or_default()
        };
        for send in queued {
            match self
                .originate_with_id(send.msg_id, peer, send.kind, send.payload)
                .await
            {
                Ok(env) => {
                    let sent = self.transmit(&env, None).await;
                    let state = if sent {
                        MessageState::Sent
                    } else {
                        MessageState::Pending
                    };
                    let _ = self.inner.store.message_update_state(&send.msg_id, state);
                    self.inner
                        .bus
                        .publish(Event::MessageState {
                            msg_id: send.msg_id,
                            state,
                        })
                        .await;
                }
                Err(e) => warn!(peer = %peer, error = %e, "queued send failed"),
            }
        }
        self.persist_session(peer).await;
    }

    // ------------------------------------------------------------------
    // outbound pipeline
    // ------------------------------------------------------------------

    /// Build an envelope for a payload we originate.
    async fn originate(&self, dest: NodeId, kind: Kind, payload: Vec<u8>) -> Result<Envelope> {
        self.originate_with_id(MsgId::generate(), dest, kind, payload)
            .await
    }

    async fn originate_with_id(
        &self,
        msg_id: MsgId,
        dest: NodeId,
        kind: Kind,
        payload: Vec<u8>,
    ) -> Result<Envelope> {
        let seq = self.inner.store.seq_next(kind)?;
        let aad = Envelope::aad(&msg_id, &self.inner.node_id, &dest, kind, seq);

        let (nonce, ciphertext) = if kind.is_handshake() {
            (Nonce::zero(), payload)
        } else if dest.is_broadcast() {
            self.inner.group.seal(&payload, &aad)?
        } else {
            let mut sessions = self.inner.sessions.lock().await;
            let session = sessions
                .get_mut(&dest)
                .ok_or_else(|| Error::Handshake("no session with peer".into()))?;
            let (counter, ciphertext) = session.encrypt(&payload, &aad)?;
            (crate::crypto::counter_nonce(counter), ciphertext)
        };

        let env = Envelope {
            msg_id,
            origin: self.inner.node_id,
            dest,
            kind,
            ttl: self.inner.config.ttl_default,
            hop: 0,
            seq,
            ts: now_ms(),
            nonce,
            ciphertext,
        };
        if env.encoded_len() > self.inner.config.packet_size_limit as usize {
            return Err(Error::Policy("payload exceeds packet size limit".into()));
        }

        // Never loop back our own traffic.
        self.seen_first_sight(&env.msg_id).await?;
        Ok(env)
    }

    /// Hand an envelope to the transport. Returns whether it reached at
    /// least one link (or, for unicast, whether a confirmed write happened
    /// or a backup flood went out).
    async fn transmit(&self, env: &Envelope, exclude: Option<LinkAddr>) -> bool {
        let frame = env.encode();
        let (connected_count, direct_addr, hint_addr) = {
            let links = self.inner.links.lock().await;
            let direct = links
                .node_to_addr
                .get(&env.dest)
                .filter(|addr| links.connected.contains(*addr))
                .cloned();
            let hint = if direct.is_none() && !env.dest.is_broadcast() {
                self.inner
                    .store
                    .route_best(&env.dest, now_ms(), ROUTE_STALENESS_MS)
                    .ok()
                    .flatten()
                    .and_then(|via| links.node_to_addr.get(&via).cloned())
                    .filter(|addr| links.connected.contains(addr))
            } else {
                None
            };
            (links.connected.len(), direct, hint)
        };

        if connected_count == 0 {
            return false;
        }

        if env.dest.is_broadcast() {
            let _ = self
                .inner
                .cmd_tx
                .send(TransportCommand::Broadcast { frame, exclude })
                .await;
            return true;
        }

        // Unicast: preferred link first, everyone else as parallel backup.
        let preferred = direct_addr.or(hint_addr);
        let mut confirmed = false;
        if let Some(addr) = &preferred {
            let (reply_tx, reply_rx) = oneshot::channel();
            let _ = self
                .inner
                .cmd_tx
                .send(TransportCommand::SendTo {
                    addr: addr.clone(),
                    frame: frame.clone(),
                    reply: Some(reply_tx),
                })
                .await;
            confirmed = reply_rx.await.unwrap_or(false);
        }
        if connected_count > usize::from(preferred.is_some()) {
            let _ = self
                .inner
                .cmd_tx
                .send(TransportCommand::Broadcast {
                    frame,
                    exclude: preferred.clone(),
                })
                .await;
            return true;
        }
        confirmed
    }

    /// Send a text message. Returns the message id.
    pub async fn send_text(
        &self,
        chat_id: NodeId,
        body: &str,
        reply_to: Option<MsgId>,
    ) -> Result<MsgId> {
        let payload = TextPayload {
            body: body.to_string(),
            reply_to,
        }
        .to_bytes()?;
        let msg_id = MsgId::generate();

        let record = MessageRecord {
            msg_id,
            chat_id,
            origin: self.inner.node_id,
            dest: chat_id,
            kind: Kind::Text,
            body: body.to_string(),
            ts: now_ms(),
            seq: 0,
            outgoing: true,
            state: MessageState::Pending,
        };
        if let Err(e) = self.inner.store.message_put(&record) {
            warn!(error = %e, "outgoing message archive failed");
        }
        self.inner
            .bus
            .publish(Event::Message {
                record: record.clone(),
            })
            .await;

        self.send_payload(msg_id, chat_id, Kind::Text, payload).await?;
        Ok(msg_id)
    }

    /// Shared outbound path below the archive step: handles handshake
    /// gating, encryption, transmission and the outbox fallback.
    async fn send_payload(
        &self,
        msg_id: MsgId,
        dest: NodeId,
        kind: Kind,
        payload: Vec<u8>,
    ) -> Result<()> {
        if !dest.is_broadcast() {
            let established = {
                let sessions = self.inner.sessions.lock().await;
                sessions.get(&dest).map(|s| s.is_established()).unwrap_or(false)
            };
            if !established {
                {
                    let mut pending = self.inner.pending.lock().await;
                    pending.entry(dest).or_default().push(PendingSend {
                        msg_id,
                        kind,
                        payload,
                    });
                }
                self.ensure_handshake(dest).await?;
                return Ok(());
            }
        }

        let env = self.originate_with_id(msg_id, dest, kind, payload).await?;
        if !dest.is_broadcast() {
            self.persist_session(dest).await;
        }
        let sent = self.transmit(&env, None).await;

        if sent {
            let _ = self.inner.store.message_update_state(&msg_id, MessageState::Sent);
            self.inner
                .bus
                .publish(Event::MessageState {
                    msg_id,
                    state: MessageState::Sent,
                })
                .await;
        } else if !dest.is_broadcast() {
            self.inner
                .store
                .outbox_push(&msg_id, &dest, &env.encode(), now_ms())?;
            debug!(dest = %dest, msg = %msg_id, "no route; queued in outbox");
        }
        Ok(())
    }

    /// Send a file inline. Rejects payloads above the configured cap.
    pub async fn send_file(
        &self,
        chat_id: NodeId,
        bytes: &[u8],
        name: &str,
        mime: &str,
    ) -> Result<[u8; 16]> {
        let limit = self.inner.config.max_inline_file_bytes as usize;
        if bytes.len() > limit {
            self.inner
                .bus
                .publish(Event::SystemNotice {
                    chat_id,
                    text: format!("file too large ({} bytes, limit {})", bytes.len(), limit),
                })
                .await;
            return Err(Error::FileTooLarge {
                size: bytes.len(),
                limit,
            });
        }

        let budget = self.inner.config.max_ciphertext_len() - TAG_SIZE;
        let (file_id, chunks) = chunk_file(bytes, name, mime, budget);
        let total = chunks.len();

        let record = MessageRecord {
            msg_id: MsgId::generate(),
            chat_id,
            origin: self.inner.node_id,
            dest: chat_id,
            kind: Kind::FileChunk,
            body: format!("{} ({}, {} bytes)", name, mime, bytes.len()),
            ts: now_ms(),
            seq: 0,
            outgoing: true,
            state: MessageState::Sent,
        };
        if let Err(e) = self.inner.store.message_put(&record) {
            warn!(error = %e, "outgoing file record failed");
        }

        for chunk in chunks {
            let payload = chunk.to_bytes()?;
            self.send_payload(MsgId::generate(), chat_id, Kind::FileChunk, payload)
                .await?;
        }
        info!(chat = %chat_id, chunks = total, "file queued for transfer");
        Ok(file_id)
    }

    /// Send a reaction to an earlier message.
    pub async fn send_reaction(&self, chat_id: NodeId, msg_id: MsgId, emoji: &str) -> Result<()> {
        let payload = ReactionPayload {
            reply_to: msg_id,
            emoji: emoji.to_string(),
            add: true,
        }
        .to_bytes()?;
        self.send_payload(MsgId::generate(), chat_id, Kind::Reaction, payload)
            .await
    }

    /// Send a typing indicator.
    pub async fn send_typing(&self, chat_id: NodeId, typing: bool) -> Result<()> {
        let payload = TypingPayload { chat_id, typing }.to_bytes()?;
        self.send_payload(MsgId::generate(), chat_id, Kind::Typing, payload)
            .await
    }

    /// Broadcast an encrypted presence beacon.
    pub async fn send_presence(&self) -> Result<()> {
        let payload = PresencePayload { ts_ms: now_ms() }.to_bytes()?;
        let env = self.originate(BROADCAST, Kind::Presence, payload).await?;
        self.transmit(&env, None).await;
        Ok(())
    }

    async fn send_ack(&self, origin: NodeId, ack_of: MsgId) -> Result<()> {
        let payload = AckPayload { ack_of }.to_bytes()?;
        let env = self.originate(origin, Kind::Ack, payload).await?;
        self.transmit(&env, None).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // outbox
    // ------------------------------------------------------------------

    /// Drain queued envelopes for a destination over a specific link,
    /// preserving FIFO order. Stops at the first failed write.
    async fn flush_outbox_for(&self, dest: NodeId, via_addr: Option<&str>) {
        let addr = match via_addr {
            Some(addr) => Some(addr.to_string()),
            None => {
                let links = self.inner.links.lock().await;
                links
                    .node_to_addr
                    .get(&dest)
                    .filter(|a| links.connected.contains(*a))
                    .cloned()
            }
        };
        let Some(addr) = addr else { return };

        let entries = match self.inner.store.outbox_for(&dest) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "outbox read failed");
                return;
            }
        };
        for entry in entries {
            let (reply_tx, reply_rx) = oneshot::channel();
            let _ = self
                .inner
                .cmd_tx
                .send(TransportCommand::SendTo {
                    addr: addr.clone(),
                    frame: entry.envelope.clone(),
                    reply: Some(reply_tx),
                })
                .await;
            if reply_rx.await.unwrap_or(false) {
                let _ = self.inner.store.outbox_delete(&entry.msg_id);
                let _ = self
                    .inner
                    .store
                    .message_update_state(&entry.msg_id, MessageState::Sent);
                self.inner
                    .bus
                    .publish(Event::MessageState {
                        msg_id: entry.msg_id,
                        state: MessageState::Sent,
                    })
                    .await;
            } else {
                let _ = self.inner.store.outbox_bump_attempts(entry.id);
                break;
            }
        }
    }

    /// Periodic outbox pass: age-expire, then retry everything across the
    /// current connections.
    pub async fn outbox_sweep(&self) {
        let now = now_ms();
        match self.inner.store.outbox_age_sweep(now, OUTBOX_MAX_AGE_MS) {
            Ok(expired) => {
                for msg_id in expired {
                    let _ = self
                        .inner
                        .store
                        .message_update_state(&msg_id, MessageState::Failed);
                    self.inner
                        .bus
                        .publish(Event::MessageState {
                            msg_id,
                            state: MessageState::Failed,
                        })
                        .await;
                }
            }
            Err(e) => warn!(error = %e, "outbox age sweep failed"),
        }

        let entries = match self.inner.store.outbox_all() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "outbox read failed");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }

        let mut flushed: HashSet<NodeId> = HashSet::new();
        for entry in &entries {
            if flushed.contains(&entry.dest) {
                continue;
            }
            flushed.insert(entry.dest);
            self.flush_outbox_for(entry.dest, None).await;
        }

        // Destinations with no direct link: flood the queued envelopes and
        // let intermediate nodes carry them. Entries stay queued until an
        // ack or a confirmed direct write removes them; receivers dedupe.
        let has_links = {
            let links = self.inner.links.lock().await;
            !links.connected.is_empty()
        };
        if has_links {
            let remaining = self.inner.store.outbox_all().unwrap_or_default();
            for entry in remaining {
                let _ = self.inner.store.outbox_bump_attempts(entry.id);
                let _ = self
                    .inner
                    .cmd_tx
                    .send(TransportCommand::Broadcast {
                        frame: entry.envelope,
                        exclude: None,
                    })
                    .await;
            }
        }
    }

    /// Discard stale partial file transfers.
    pub async fn chunk_gc(&self) {
        let removed = {
            let mut assembler = self.inner.assembler.lock().await;
            assembler.sweep(Duration::from_secs(super::files::CHUNK_GC_SECS))
        };
        if removed > 0 {
            debug!(removed, "discarded incomplete file transfers");
        }
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    /// Known peers, most recently seen first.
    pub fn list_peers(&self) -> Result<Vec<crate::storage::PeerRecord>> {
        self.inner.store.peers_list()
    }

    /// Block or unblock a peer.
    pub async fn block(&self, peer: NodeId, blocked: bool) -> Result<()> {
        self.inner.store.block_set(&peer, blocked)?;
        self.inner
            .bus
            .publish(Event::PeerState {
                node: Some(peer),
                addr: String::new(),
                state: if blocked {
                    LinkState::Blocked
                } else {
                    LinkState::Disconnected
                },
            })
            .await;
        Ok(())
    }

    /// Search a chat's plaintext history.
    pub fn search(&self, chat_id: NodeId, query: &str) -> Result<Vec<MessageRecord>> {
        if query.trim().is_empty() {
            return self.inner.store.message_query(&chat_id, 500, None);
        }
        self.inner.store.message_search(&chat_id, query)
    }

    /// Render a chat's history as JSON or HTML.
    pub fn export(&self, chat_id: NodeId, format: ExportFormat) -> Result<Vec<u8>> {
        let rows = self.inner.store.message_export(&chat_id)?;
        render_export(&rows, format)
    }
}

/// Render archived messages in an export format. Shared with the offline
/// CLI export path.
pub fn render_export(rows: &[MessageRecord], format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => {
            let value: Vec<serde_json::Value> = rows
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "msg_id": r.msg_id.to_hex(),
                        "chat_id": r.chat_id.to_hex(),
                        "origin": r.origin.to_hex(),
                        "kind": r.kind.to_byte(),
                        "body": r.body,
                        "ts": r.ts,
                        "seq": r.seq,
                        "outgoing": r.outgoing,
                    })
                })
                .collect();
            serde_json::to_vec_pretty(&value).map_err(|e| Error::Codec(e.to_string()))
        }
        ExportFormat::Html => {
            let mut html = String::from("<html><body><h1>BigHeads Export</h1><ul>\n");
            for row in rows {
                html.push_str(&format!(
                    "<li><b>{}</b> [{}] : {}</li>\n",
                    row.origin.short(),
                    row.ts,
                    html_escape(&row.body),
                ));
            }
            html.push_str("</ul></body></html>\n");
            Ok(html.into_bytes())
        }
    }
}

/// Recover the pairwise chain counter a sender embedded in its nonce.
fn chain_counter_from_nonce(nonce: &Nonce) -> u64 {
    let bytes = nonce.as_bytes();
    u64::from_be_bytes([
        bytes[4], bytes[5], bytes[6], bytes[7], bytes[8], bytes[9], bytes[10], bytes[11],
    ])
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_counter_roundtrip() {
        let nonce = crate::crypto::counter_nonce(7_000_123);
        assert_eq!(chain_counter_from_nonce(&nonce), 7_000_123);
    }

    #[test]
    fn html_escape_basic() {
        assert_eq!(html_escape("a<b>&c"), "a&lt;b&gt;&amp;c");
    }
}
