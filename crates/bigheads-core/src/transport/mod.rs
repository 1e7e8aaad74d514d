//! Transport layer: link discovery, connection pool and framed I/O.
//!
//! The mesh never talks to a radio directly. It owns the receiving end of a
//! [`TransportEvent`] channel and the sending end of a [`TransportCommand`]
//! channel; whatever sits on the other side (the BLE central here, a channel
//! fabric in tests) implements the same contract: frames in, frames out,
//! connection lifecycle notifications.

mod ble;
mod framing;

pub use ble::{BleCentral, RECONNECT_BACKOFF_BASE_SECS, RECONNECT_BACKOFF_MAX_SECS};
pub use framing::{split_frame, Reassembler, Segment, SEGMENT_HEADER_LEN, SEGMENT_PAYLOAD};

use tokio::sync::oneshot;

/// Opaque link address (the radio's peer address).
pub type LinkAddr = String;

/// Link lifecycle state for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Seen in a scan, not yet connected.
    Discovered,
    /// Connection attempt in flight.
    Connecting,
    /// GATT link up, notifications subscribed.
    Connected,
    /// Link lost or closed.
    Disconnected,
    /// Excluded from connection attempts.
    Blocked,
}

/// Events surfaced by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A peer advertising the service was discovered.
    PeerDiscovered {
        /// Link address.
        addr: LinkAddr,
        /// Signal strength, if the scan reported one.
        rssi: Option<i16>,
    },
    /// A GATT link came up.
    PeerConnected {
        /// Link address.
        addr: LinkAddr,
    },
    /// A GATT link went down.
    PeerDisconnected {
        /// Link address.
        addr: LinkAddr,
    },
    /// A complete frame was reassembled from a link.
    FrameReceived {
        /// Link address the frame arrived on.
        addr: LinkAddr,
        /// The frame bytes (one encoded envelope).
        frame: Vec<u8>,
    },
}

/// Commands a transport executes for the mesh.
#[derive(Debug)]
pub enum TransportCommand {
    /// Send one frame to one connected peer.
    SendTo {
        /// Target link.
        addr: LinkAddr,
        /// Frame bytes.
        frame: Vec<u8>,
        /// Optional delivery result: true iff every segment was written.
        reply: Option<oneshot::Sender<bool>>,
    },
    /// Send one frame to every connected peer, optionally excluding the link
    /// it arrived on. Per-peer failures do not abort the fan-out.
    Broadcast {
        /// Frame bytes.
        frame: Vec<u8>,
        /// Link to skip (loop suppression).
        exclude: Option<LinkAddr>,
    },
}
