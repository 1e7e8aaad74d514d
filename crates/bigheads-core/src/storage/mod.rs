//! Durable persistence for the mesh core.
//!
//! One SQLite database holds every table the protocol needs: the seen-id
//! dedupe window, the chat archive, the offline outbox, routing hints, peer
//! records with the block flag, pairwise session snapshots, and the `meta`
//! key/value table (identity, keys, counters, config overrides).
//!
//! A single connection sits behind a mutex: writes serialize, which is what
//! makes `seen_add` an atomic first-sight test even when two radios deliver
//! the same envelope simultaneously.

mod schema;
mod store;

pub use schema::{CREATE_SCHEMA, SCHEMA_VERSION};
pub use store::{MessageRecord, MessageState, OutboxEntry, PeerRecord, ReactionRecord, Store};
