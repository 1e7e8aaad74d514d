//! The durable store: one SQLite connection behind a mutex.

use super::schema::{CREATE_SCHEMA, SCHEMA_VERSION};
use crate::error::{Error, Result};
use crate::identity::{NodeId, NodeIdentity};
use crate::protocol::{Kind, MsgId};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Delivery state of an archived message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Accepted locally, not yet on the wire.
    Pending,
    /// Handed to at least one link (or flooded).
    Sent,
    /// Acknowledged by the recipient.
    Delivered,
    /// Gave up (outbox age-out or terminal transport failure).
    Failed,
}

impl MessageState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "delivered" => Self::Delivered,
            "failed" => Self::Failed,
            _ => Self::Sent,
        }
    }
}

/// One archived chat message.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    /// Envelope id.
    pub msg_id: MsgId,
    /// Counterparty for pairwise chats, broadcast sentinel for group.
    pub chat_id: NodeId,
    /// Originating node.
    pub origin: NodeId,
    /// Destination node.
    pub dest: NodeId,
    /// Envelope kind.
    pub kind: Kind,
    /// Plaintext body (text, or a file summary).
    pub body: String,
    /// Originator timestamp, milliseconds.
    pub ts: u64,
    /// Originator stream counter.
    pub seq: u64,
    /// Whether this node originated it.
    pub outgoing: bool,
    /// Delivery state.
    pub state: MessageState,
}

/// One queued unicast envelope.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// Row id: FIFO order within a destination.
    pub id: i64,
    /// Envelope id.
    pub msg_id: MsgId,
    /// Destination node.
    pub dest: NodeId,
    /// Encoded envelope, ready to transmit.
    pub envelope: Vec<u8>,
    /// Enqueue time, milliseconds.
    pub enqueued_at: u64,
    /// Send attempts so far.
    pub attempts: u32,
}

/// One known peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Mesh identifier.
    pub node_id: NodeId,
    /// Optional user-assigned alias.
    pub alias: Option<String>,
    /// Last known radio address.
    pub address: Option<String>,
    /// Last observed RSSI.
    pub last_rssi: Option<i32>,
    /// Last time any traffic from this peer was seen, milliseconds.
    pub last_seen: Option<u64>,
    /// Whether the peer is blocked.
    pub blocked: bool,
}

/// One stored reaction.
#[derive(Debug, Clone)]
pub struct ReactionRecord {
    /// Message reacted to.
    pub msg_id: MsgId,
    /// Reacting node.
    pub reactor: NodeId,
    /// Emoji.
    pub emoji: String,
    /// Reaction time, milliseconds.
    pub ts: u64,
}

const META_NODE_ID: &str = "node_id";
const META_NODE_SECRET: &str = "node_secret";
const META_SCHEMA_VERSION: &str = "schema_version";
const CONFIG_OVERRIDE_PREFIX: &str = "cfg:";

/// The durable store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Storage(format!("cannot create data dir: {}", e)))?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("cannot open database: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Storage(format!("cannot set pragmas: {}", e)))?;
        Self::init(conn)
    }

    /// Open an in-memory store (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("cannot open database: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_SCHEMA)
            .map_err(|e| Error::Storage(format!("cannot create schema: {}", e)))?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES (?, ?)",
            params![META_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("connection lock poisoned".into()))
    }

    // ------------------------------------------------------------------
    // meta / identity
    // ------------------------------------------------------------------

    /// Set a meta key.
    pub fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Get a meta key.
    pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Config overrides stored under the `cfg:` prefix, as (key, value).
    pub fn config_overrides(&self) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM meta WHERE key LIKE 'cfg:%'")?;
        let rows = stmt
            .query_map([], |row| {
                let key: String = row.get(0)?;
                let value: String = row.get(1)?;
                Ok((key, value))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(k, v)| (k[CONFIG_OVERRIDE_PREFIX.len()..].to_string(), v))
            .collect())
    }

    /// Load the node identity, creating and persisting one on first run.
    pub fn load_or_create_identity(&self) -> Result<NodeIdentity> {
        if let (Some(id_hex), Some(secret_hex)) =
            (self.meta_get(META_NODE_ID)?, self.meta_get(META_NODE_SECRET)?)
        {
            let id = NodeId::from_hex(&id_hex)?;
            let secret: [u8; 32] = hex::decode(&secret_hex)
                .ok()
                .and_then(|v| v.try_into().ok())
                .ok_or_else(|| Error::Storage("corrupt identity secret".into()))?;
            return Ok(NodeIdentity::from_parts(id, secret));
        }

        let identity = NodeIdentity::generate();
        self.meta_set(META_NODE_ID, &identity.id().to_hex())?;
        self.meta_set(META_NODE_SECRET, &hex::encode(identity.secret_bytes()))?;
        Ok(identity)
    }

    /// Next value of the per-kind outgoing stream counter. Read, increment
    /// and write happen under the connection lock, so values never repeat.
    pub fn seq_next(&self, kind: Kind) -> Result<u64> {
        let conn = self.lock()?;
        let key = format!("seq:{:#04x}", kind.to_byte());
        let current: u64 = conn
            .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
            params![key, (current + 1).to_string()],
        )?;
        Ok(current)
    }

    // ------------------------------------------------------------------
    // seen LRU
    // ------------------------------------------------------------------

    /// Record a message id as seen.
    ///
    /// Returns true iff the id was newly inserted. Insertion and the LRU trim
    /// run in one transaction under the connection lock, so "first sight"
    /// resolves to exactly one caller even across concurrent radios.
    pub fn seen_add(&self, msg_id: &MsgId, limit: u32, now_ms: u64) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO seen (msg_id, seen_at) VALUES (?, ?)",
            params![msg_id.to_hex(), now_ms as i64],
        )?;
        if inserted > 0 {
            tx.execute(
                "DELETE FROM seen WHERE id IN (
                    SELECT id FROM seen ORDER BY id DESC LIMIT -1 OFFSET ?
                )",
                params![limit as i64],
            )?;
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    /// Whether a message id is in the seen window.
    pub fn seen_contains(&self, msg_id: &MsgId) -> Result<bool> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM seen WHERE msg_id = ?",
                params![msg_id.to_hex()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Number of ids currently in the seen window.
    pub fn seen_count(&self) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM seen", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // messages
    // ------------------------------------------------------------------

    /// Insert or replace a chat message.
    pub fn message_put(&self, record: &MessageRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO messages
            (msg_id, chat_id, origin, dest, kind, body, ts, seq, outgoing, state)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.msg_id.to_hex(),
                record.chat_id.to_hex(),
                record.origin.to_hex(),
                record.dest.to_hex(),
                record.kind.to_byte() as i64,
                record.body,
                record.ts as i64,
                record.seq as i64,
                record.outgoing as i64,
                record.state.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Update a message's delivery state.
    pub fn message_update_state(&self, msg_id: &MsgId, state: MessageState) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE messages SET state = ? WHERE msg_id = ?",
            params![state.as_str(), msg_id.to_hex()],
        )?;
        Ok(())
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
        let msg_id: String = row.get(0)?;
        let chat_id: String = row.get(1)?;
        let origin: String = row.get(2)?;
        let dest: String = row.get(3)?;
        let kind: i64 = row.get(4)?;
        let body: String = row.get(5)?;
        let ts: i64 = row.get(6)?;
        let seq: i64 = row.get(7)?;
        let outgoing: i64 = row.get(8)?;
        let state: String = row.get(9)?;
        Ok(MessageRecord {
            msg_id: MsgId::from_hex(&msg_id).unwrap_or_else(|_| MsgId::from_bytes([0; 16])),
            chat_id: NodeId::from_hex(&chat_id).unwrap_or(crate::identity::BROADCAST),
            origin: NodeId::from_hex(&origin).unwrap_or(crate::identity::BROADCAST),
            dest: NodeId::from_hex(&dest).unwrap_or(crate::identity::BROADCAST),
            kind: Kind::from_byte(kind as u8).unwrap_or(Kind::Text),
            body,
            ts: ts as u64,
            seq: seq as u64,
            outgoing: outgoing != 0,
            state: MessageState::parse(&state),
        })
    }

    /// Query a chat's history, newest-first window returned oldest-first.
    pub fn message_query(
        &self,
        chat_id: &NodeId,
        limit: u32,
        before_ts: Option<u64>,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.lock()?;
        let before = before_ts.map(|t| t as i64).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            r#"
            SELECT msg_id, chat_id, origin, dest, kind, body, ts, seq, outgoing, state
            FROM messages
            WHERE chat_id = ? AND ts < ?
            ORDER BY ts DESC, seq DESC
            LIMIT ?
            "#,
        )?;
        let mut messages = stmt
            .query_map(params![chat_id.to_hex(), before, limit as i64], |row| {
                Self::row_to_message(row)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Case-insensitive substring search over a chat's plaintext bodies.
    pub fn message_search(&self, chat_id: &NodeId, term: &str) -> Result<Vec<MessageRecord>> {
        let conn = self.lock()?;
        let needle = format!("%{}%", term.to_lowercase());
        let mut stmt = conn.prepare(
            r#"
            SELECT msg_id, chat_id, origin, dest, kind, body, ts, seq, outgoing, state
            FROM messages
            WHERE chat_id = ? AND LOWER(body) LIKE ?
            ORDER BY ts ASC, seq ASC
            "#,
        )?;
        let messages = stmt
            .query_map(params![chat_id.to_hex(), needle], |row| {
                Self::row_to_message(row)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// Full chat history, oldest-first, for export.
    pub fn message_export(&self, chat_id: &NodeId) -> Result<Vec<MessageRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT msg_id, chat_id, origin, dest, kind, body, ts, seq, outgoing, state
            FROM messages
            WHERE chat_id = ?
            ORDER BY ts ASC, seq ASC
            "#,
        )?;
        let messages = stmt
            .query_map(params![chat_id.to_hex()], |row| Self::row_to_message(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // outbox
    // ------------------------------------------------------------------

    /// Queue a unicast envelope for later delivery.
    pub fn outbox_push(
        &self,
        msg_id: &MsgId,
        dest: &NodeId,
        envelope: &[u8],
        now_ms: u64,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO outbox (msg_id, dest, envelope, enqueued_at, attempts)
            VALUES (?, ?, ?, ?, 0)
            "#,
            params![msg_id.to_hex(), dest.to_hex(), envelope, now_ms as i64],
        )?;
        Ok(())
    }

    fn row_to_outbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
        let id: i64 = row.get(0)?;
        let msg_id: String = row.get(1)?;
        let dest: String = row.get(2)?;
        let envelope: Vec<u8> = row.get(3)?;
        let enqueued_at: i64 = row.get(4)?;
        let attempts: i64 = row.get(5)?;
        Ok(OutboxEntry {
            id,
            msg_id: MsgId::from_hex(&msg_id).unwrap_or_else(|_| MsgId::from_bytes([0; 16])),
            dest: NodeId::from_hex(&dest).unwrap_or(crate::identity::BROADCAST),
            envelope,
            enqueued_at: enqueued_at as u64,
            attempts: attempts as u32,
        })
    }

    /// Pending entries for one destination, FIFO.
    pub fn outbox_for(&self, dest: &NodeId) -> Result<Vec<OutboxEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, msg_id, dest, envelope, enqueued_at, attempts
             FROM outbox WHERE dest = ? ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![dest.to_hex()], |row| Self::row_to_outbox(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// All pending entries, FIFO.
    pub fn outbox_all(&self) -> Result<Vec<OutboxEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, msg_id, dest, envelope, enqueued_at, attempts
             FROM outbox ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map([], |row| Self::row_to_outbox(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Remove an entry after successful transmission.
    pub fn outbox_delete(&self, msg_id: &MsgId) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM outbox WHERE msg_id = ?", params![msg_id.to_hex()])?;
        Ok(())
    }

    /// Count one more failed attempt.
    pub fn outbox_bump_attempts(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE outbox SET attempts = attempts + 1 WHERE id = ?",
            params![id],
        )?;
        Ok(())
    }

    /// Delete entries older than `max_age_ms`, returning their message ids so
    /// the caller can mark the archived messages failed.
    pub fn outbox_age_sweep(&self, now_ms: u64, max_age_ms: u64) -> Result<Vec<MsgId>> {
        let cutoff = now_ms.saturating_sub(max_age_ms) as i64;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let expired = {
            let mut stmt =
                tx.prepare("SELECT msg_id FROM outbox WHERE enqueued_at < ?")?;
            let rows = stmt
                .query_map(params![cutoff], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        tx.execute("DELETE FROM outbox WHERE enqueued_at < ?", params![cutoff])?;
        tx.commit()?;
        Ok(expired
            .iter()
            .filter_map(|hex| MsgId::from_hex(hex).ok())
            .collect())
    }

    // ------------------------------------------------------------------
    // routes
    // ------------------------------------------------------------------

    /// Record that traffic from `dest` most recently arrived via `next_hop`.
    pub fn route_observe(&self, dest: &NodeId, next_hop: &NodeId, now_ms: u64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO routes (dest, next_hop, last_seen_ts, score)
            VALUES (?, ?, ?, 1)
            ON CONFLICT(dest) DO UPDATE SET
              next_hop = excluded.next_hop,
              last_seen_ts = excluded.last_seen_ts,
              score = score + 1
            "#,
            params![dest.to_hex(), next_hop.to_hex(), now_ms as i64],
        )?;
        Ok(())
    }

    /// Best known next hop for `dest`, ignoring hints older than
    /// `staleness_ms`. Advisory only; flooding remains the fallback.
    pub fn route_best(
        &self,
        dest: &NodeId,
        now_ms: u64,
        staleness_ms: u64,
    ) -> Result<Option<NodeId>> {
        let conn = self.lock()?;
        let cutoff = now_ms.saturating_sub(staleness_ms) as i64;
        let next_hop: Option<String> = conn
            .query_row(
                "SELECT next_hop FROM routes WHERE dest = ? AND last_seen_ts >= ?",
                params![dest.to_hex(), cutoff],
                |row| row.get(0),
            )
            .optional()?;
        Ok(next_hop.and_then(|hex| NodeId::from_hex(&hex).ok()))
    }

    // ------------------------------------------------------------------
    // peers / blocks
    // ------------------------------------------------------------------

    /// Record traffic from a peer, creating the row on first sight.
    pub fn peer_upsert(&self, node_id: &NodeId, last_seen_ms: u64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO peers (node_id, last_seen) VALUES (?, ?)
            ON CONFLICT(node_id) DO UPDATE SET last_seen = excluded.last_seen
            "#,
            params![node_id.to_hex(), last_seen_ms as i64],
        )?;
        Ok(())
    }

    /// Update a peer's radio observation (address, RSSI, connect time).
    pub fn peer_observe_radio(
        &self,
        node_id: &NodeId,
        address: &str,
        rssi: Option<i32>,
        connected_at_ms: Option<u64>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO peers (node_id, address, last_rssi, last_connected)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(node_id) DO UPDATE SET
              address = excluded.address,
              last_rssi = COALESCE(excluded.last_rssi, last_rssi),
              last_connected = COALESCE(excluded.last_connected, last_connected)
            "#,
            params![
                node_id.to_hex(),
                address,
                rssi,
                connected_at_ms.map(|t| t as i64)
            ],
        )?;
        Ok(())
    }

    /// Set or clear the block flag.
    pub fn block_set(&self, node_id: &NodeId, blocked: bool) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO peers (node_id, blocked) VALUES (?, ?)
            ON CONFLICT(node_id) DO UPDATE SET blocked = excluded.blocked
            "#,
            params![node_id.to_hex(), blocked as i64],
        )?;
        Ok(())
    }

    /// Whether a node is blocked.
    pub fn is_blocked(&self, node_id: &NodeId) -> Result<bool> {
        let conn = self.lock()?;
        let blocked: Option<i64> = conn
            .query_row(
                "SELECT blocked FROM peers WHERE node_id = ?",
                params![node_id.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blocked.unwrap_or(0) != 0)
    }

    /// All known peers, most recently seen first.
    pub fn peers_list(&self) -> Result<Vec<PeerRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, alias, address, last_rssi, last_seen, blocked
             FROM peers ORDER BY COALESCE(last_seen, 0) DESC",
        )?;
        let peers = stmt
            .query_map([], |row| {
                let node_id: String = row.get(0)?;
                let alias: Option<String> = row.get(1)?;
                let address: Option<String> = row.get(2)?;
                let last_rssi: Option<i32> = row.get(3)?;
                let last_seen: Option<i64> = row.get(4)?;
                let blocked: i64 = row.get(5)?;
                Ok((node_id, alias, address, last_rssi, last_seen, blocked))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(peers
            .into_iter()
            .filter_map(|(node_id, alias, address, last_rssi, last_seen, blocked)| {
                Some(PeerRecord {
                    node_id: NodeId::from_hex(&node_id).ok()?,
                    alias,
                    address,
                    last_rssi,
                    last_seen: last_seen.map(|t| t as u64),
                    blocked: blocked != 0,
                })
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // sessions
    // ------------------------------------------------------------------

    /// Persist an established session snapshot.
    pub fn session_save(&self, peer: &NodeId, snapshot: &[u8], now_ms: u64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO sessions (peer_id, snapshot, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(peer_id) DO UPDATE SET
              snapshot = excluded.snapshot,
              updated_at = excluded.updated_at
            "#,
            params![peer.to_hex(), snapshot, now_ms as i64],
        )?;
        Ok(())
    }

    /// Load all persisted sessions.
    pub fn session_load_all(&self) -> Result<Vec<(NodeId, Vec<u8>)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT peer_id, snapshot FROM sessions")?;
        let rows = stmt
            .query_map([], |row| {
                let peer: String = row.get(0)?;
                let snapshot: Vec<u8> = row.get(1)?;
                Ok((peer, snapshot))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(peer, snapshot)| Some((NodeId::from_hex(&peer).ok()?, snapshot)))
            .collect())
    }

    // ------------------------------------------------------------------
    // reactions
    // ------------------------------------------------------------------

    /// Store a reaction.
    pub fn reaction_add(&self, record: &ReactionRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO reactions (msg_id, reactor, emoji, ts) VALUES (?, ?, ?, ?)",
            params![
                record.msg_id.to_hex(),
                record.reactor.to_hex(),
                record.emoji,
                record.ts as i64
            ],
        )?;
        Ok(())
    }

    /// Reactions for a message, oldest-first.
    pub fn reactions_for(&self, msg_id: &MsgId) -> Result<Vec<ReactionRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT msg_id, reactor, emoji, ts FROM reactions WHERE msg_id = ? ORDER BY ts ASC",
        )?;
        let rows = stmt
            .query_map(params![msg_id.to_hex()], |row| {
                let msg_id: String = row.get(0)?;
                let reactor: String = row.get(1)?;
                let emoji: String = row.get(2)?;
                let ts: i64 = row.get(3)?;
                Ok((msg_id, reactor, emoji, ts))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(msg_id, reactor, emoji, ts)| {
                Some(ReactionRecord {
                    msg_id: MsgId::from_hex(&msg_id).ok()?,
                    reactor: NodeId::from_hex(&reactor).ok()?,
                    emoji,
                    ts: ts as u64,
                })
            })
            .collect())
    }

    /// Flush WAL contents to the main database file.
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::BROADCAST;

    fn test_store() -> Store {
        Store::open_in_memory().expect("open")
    }

    fn record(chat: NodeId, body: &str, ts: u64) -> MessageRecord {
        MessageRecord {
            msg_id: MsgId::generate(),
            chat_id: chat,
            origin: NodeId::generate(),
            dest: chat,
            kind: Kind::Text,
            body: body.to_string(),
            ts,
            seq: ts,
            outgoing: false,
            state: MessageState::Sent,
        }
    }

    #[test]
    fn seen_add_is_first_sight_only() {
        let store = test_store();
        let id = MsgId::generate();

        assert!(store.seen_add(&id, 100, 1).expect("add"));
        assert!(!store.seen_add(&id, 100, 2).expect("add"));
        assert!(store.seen_contains(&id).expect("contains"));
    }

    #[test]
    fn seen_evicts_oldest_first() {
        let store = test_store();
        let ids: Vec<MsgId> = (0..5).map(|_| MsgId::generate()).collect();
        for (i, id) in ids.iter().enumerate() {
            store.seen_add(id, 3, i as u64).expect("add");
        }

        assert_eq!(store.seen_count().expect("count"), 3);
        assert!(!store.seen_contains(&ids[0]).expect("contains"));
        assert!(!store.seen_contains(&ids[1]).expect("contains"));
        assert!(store.seen_contains(&ids[2]).expect("contains"));
        assert!(store.seen_contains(&ids[4]).expect("contains"));
    }

    #[test]
    fn identity_is_stable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ids.db");

        let first = Store::open(&path)
            .expect("open")
            .load_or_create_identity()
            .expect("identity");
        let second = Store::open(&path)
            .expect("open")
            .load_or_create_identity()
            .expect("identity");

        assert_eq!(first.id(), second.id());
        assert_eq!(first.secret_bytes(), second.secret_bytes());
    }

    #[test]
    fn seen_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seen.db");
        let id = MsgId::generate();

        {
            let store = Store::open(&path).expect("open");
            assert!(store.seen_add(&id, 100, 1).expect("add"));
        }

        let store = Store::open(&path).expect("reopen");
        assert!(store.seen_contains(&id).expect("contains"));
        assert!(!store.seen_add(&id, 100, 2).expect("add"));
    }

    #[test]
    fn message_query_window() {
        let store = test_store();
        for ts in 1..=10u64 {
            store
                .message_put(&record(BROADCAST, &format!("msg {}", ts), ts))
                .expect("put");
        }

        let recent = store.message_query(&BROADCAST, 3, None).expect("query");
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].body, "msg 8");
        assert_eq!(recent[2].body, "msg 10");

        let older = store.message_query(&BROADCAST, 3, Some(8)).expect("query");
        assert_eq!(older[2].body, "msg 7");
    }

    #[test]
    fn message_state_transition() {
        let store = test_store();
        let rec = record(BROADCAST, "pending", 1);
        store.message_put(&rec).expect("put");

        store
            .message_update_state(&rec.msg_id, MessageState::Delivered)
            .expect("update");

        let loaded = store.message_query(&BROADCAST, 10, None).expect("query");
        assert_eq!(loaded[0].state, MessageState::Delivered);
    }

    #[test]
    fn message_search_case_insensitive() {
        let store = test_store();
        store
            .message_put(&record(BROADCAST, "Meet at NOON", 1))
            .expect("put");
        store
            .message_put(&record(BROADCAST, "unrelated", 2))
            .expect("put");

        let hits = store.message_search(&BROADCAST, "noon").expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].body, "Meet at NOON");
    }

    #[test]
    fn outbox_fifo_per_dest() {
        let store = test_store();
        let dest = NodeId::generate();
        let other = NodeId::generate();

        let ids: Vec<MsgId> = (0..3).map(|_| MsgId::generate()).collect();
        for (i, id) in ids.iter().enumerate() {
            store
                .outbox_push(id, &dest, &[i as u8], i as u64)
                .expect("push");
        }
        store
            .outbox_push(&MsgId::generate(), &other, &[9], 9)
            .expect("push");

        let queued = store.outbox_for(&dest).expect("for");
        assert_eq!(queued.len(), 3);
        assert_eq!(queued[0].msg_id, ids[0]);
        assert_eq!(queued[2].msg_id, ids[2]);

        store.outbox_delete(&ids[1]).expect("delete");
        assert_eq!(store.outbox_for(&dest).expect("for").len(), 2);
        assert_eq!(store.outbox_all().expect("all").len(), 3);
    }

    #[test]
    fn outbox_age_sweep() {
        let store = test_store();
        let dest = NodeId::generate();
        let old = MsgId::generate();
        let fresh = MsgId::generate();

        store.outbox_push(&old, &dest, &[1], 1_000).expect("push");
        store.outbox_push(&fresh, &dest, &[2], 900_000).expect("push");

        let expired = store.outbox_age_sweep(1_000_000, 500_000).expect("sweep");
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0], old);
        assert_eq!(store.outbox_for(&dest).expect("for").len(), 1);
    }

    #[test]
    fn route_staleness_window() {
        let store = test_store();
        let dest = NodeId::generate();
        let hop = NodeId::generate();

        store.route_observe(&dest, &hop, 1_000).expect("observe");
        assert_eq!(
            store.route_best(&dest, 2_000, 10_000).expect("best"),
            Some(hop)
        );
        assert_eq!(store.route_best(&dest, 100_000, 10_000).expect("best"), None);
    }

    #[test]
    fn block_flag() {
        let store = test_store();
        let peer = NodeId::generate();

        assert!(!store.is_blocked(&peer).expect("blocked"));
        store.block_set(&peer, true).expect("block");
        assert!(store.is_blocked(&peer).expect("blocked"));
        store.block_set(&peer, false).expect("unblock");
        assert!(!store.is_blocked(&peer).expect("blocked"));
    }

    #[test]
    fn session_roundtrip() {
        let store = test_store();
        let peer = NodeId::generate();

        store.session_save(&peer, b"snapshot-bytes", 1).expect("save");
        let sessions = store.session_load_all().expect("load");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].0, peer);
        assert_eq!(sessions[0].1, b"snapshot-bytes");
    }

    #[test]
    fn seq_counters_are_monotonic_and_durable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seq.db");

        {
            let store = Store::open(&path).expect("open");
            assert_eq!(store.seq_next(Kind::Text).expect("seq"), 0);
            assert_eq!(store.seq_next(Kind::Text).expect("seq"), 1);
            assert_eq!(store.seq_next(Kind::Ack).expect("seq"), 0);
        }

        let store = Store::open(&path).expect("reopen");
        assert_eq!(store.seq_next(Kind::Text).expect("seq"), 2);
    }

    #[test]
    fn config_overrides_prefix() {
        let store = test_store();
        store.meta_set("cfg:ttl_default", "9").expect("set");
        store.meta_set("unrelated", "x").expect("set");

        let overrides = store.config_overrides().expect("overrides");
        assert_eq!(overrides, vec![("ttl_default".to_string(), "9".to_string())]);
    }
}
