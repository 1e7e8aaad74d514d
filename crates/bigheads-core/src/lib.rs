//! # BigHeads Core
//!
//! The networking and messaging substrate of BigHeads, an offline
//! decentralized messenger that forms an ad-hoc mesh over BLE links between
//! nearby desktop peers.
//!
//! ## What it does
//!
//! - TTL-scoped flooding with a durable seen-cache for dedupe and loop
//!   suppression; envelopes tolerate partial connectivity and reach
//!   intermittently connected peers through an offline outbox
//! - End-to-end encryption: a group broadcast channel keyed from a shared
//!   passphrase, and pairwise chats over an unauthenticated NN-style
//!   handshake with per-message key chains
//! - A BLE central transport: scanning, a bounded connection pool, and
//!   framed write/notify I/O over small MTUs
//! - SQLite persistence for the seen window, chat archive, outbox, routing
//!   hints, peers and block list
//!
//! ## What it does not do
//!
//! No perfect forward secrecy or identity binding: the handshake is
//! unauthenticated and MITM is an accepted limitation of the
//! prototype. No transports beyond BLE GATT. Files travel only as inline
//! base64 chunks under a configured cap.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │              UI collaborators             │
//! ├───────────────────────────────────────────┤
//! │    bus     │     runtime (lifecycle)      │
//! ├───────────────────────────────────────────┤
//! │       mesh (pipeline, outbox, files)      │
//! ├─────────────┬──────────────┬──────────────┤
//! │   crypto    │   protocol   │   storage    │
//! ├─────────────┴──────────────┴──────────────┤
//! │         transport (BLE central)           │
//! └───────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod bus;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod logging;
pub mod mesh;
pub mod protocol;
pub mod runtime;
pub mod storage;
pub mod transport;

pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
