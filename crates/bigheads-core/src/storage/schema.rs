//! Database schema definitions.

/// Schema version recorded in `meta` for migrations.
pub const SCHEMA_VERSION: u32 = 1;

/// SQL to create the database schema.
pub const CREATE_SCHEMA: &str = r#"
-- Key/value store: identity, keys, per-kind seq counters, config overrides
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Durable dedupe window. rowid preserves insertion order for LRU eviction.
CREATE TABLE IF NOT EXISTS seen (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    msg_id TEXT NOT NULL UNIQUE,
    seen_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_seen_msg ON seen(msg_id);

-- Chat archive: envelopes addressed to or sent by this node
CREATE TABLE IF NOT EXISTS messages (
    msg_id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL,
    origin TEXT NOT NULL,
    dest TEXT NOT NULL,
    kind INTEGER NOT NULL,
    body TEXT NOT NULL,
    ts INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    outgoing INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'pending'
);

CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, ts);

-- Unicast envelopes awaiting a reachable peer. rowid gives FIFO per dest.
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    msg_id TEXT NOT NULL UNIQUE,
    dest TEXT NOT NULL,
    envelope BLOB NOT NULL,
    enqueued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_outbox_dest ON outbox(dest);

-- Advisory routing hints: which neighbor last carried traffic from a node
CREATE TABLE IF NOT EXISTS routes (
    dest TEXT PRIMARY KEY,
    next_hop TEXT NOT NULL,
    last_seen_ts INTEGER NOT NULL,
    score INTEGER NOT NULL DEFAULT 0
);

-- Known peers; the block list is the blocked flag
CREATE TABLE IF NOT EXISTS peers (
    node_id TEXT PRIMARY KEY,
    alias TEXT,
    address TEXT,
    last_rssi INTEGER,
    last_seen INTEGER,
    last_connected INTEGER,
    blocked INTEGER NOT NULL DEFAULT 0
);

-- Established pairwise session snapshots
CREATE TABLE IF NOT EXISTS sessions (
    peer_id TEXT PRIMARY KEY,
    snapshot BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Emoji reactions to archived messages
CREATE TABLE IF NOT EXISTS reactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    msg_id TEXT NOT NULL,
    reactor TEXT NOT NULL,
    emoji TEXT NOT NULL,
    ts INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reactions_msg ON reactions(msg_id);
"#;
