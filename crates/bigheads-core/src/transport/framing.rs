//! Frame segmentation for small BLE MTUs.
//!
//! One frame (one encoded envelope) is split into ordered segments:
//!
//! ```text
//! stream_id (u16) | seg_idx (u16) | total (u16) | payload
//! ```
//!
//! `stream_id` is monotonic per direction per link, so interleaved frames on
//! the same link reassemble independently. The receiver buffers by
//! `(link, stream_id)` and delivers when the last index arrives; partial
//! buffers are discarded once they exceed the configured frame cap or sit
//! idle for [`REASSEMBLY_IDLE_SECS`].

use crate::error::{Error, Result};
use crate::transport::LinkAddr;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Segment header size in bytes.
pub const SEGMENT_HEADER_LEN: usize = 6;

/// Payload bytes per segment. Conservative for the 23–185 byte range of
/// post-header BLE MTUs.
pub const SEGMENT_PAYLOAD: usize = 180;

/// Seconds a partial buffer may sit idle before it is discarded.
pub const REASSEMBLY_IDLE_SECS: u64 = 10;

/// One parsed segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Frame this segment belongs to, monotonic per direction per link.
    pub stream_id: u16,
    /// Zero-based segment index.
    pub seg_idx: u16,
    /// Total segments in the frame.
    pub total: u16,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Segment {
    /// Serialize for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SEGMENT_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.extend_from_slice(&self.seg_idx.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse from the wire. Invalid headers drop the segment.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SEGMENT_HEADER_LEN {
            return Err(Error::Codec("segment too short".into()));
        }
        let stream_id = u16::from_be_bytes([bytes[0], bytes[1]]);
        let seg_idx = u16::from_be_bytes([bytes[2], bytes[3]]);
        let total = u16::from_be_bytes([bytes[4], bytes[5]]);
        if total == 0 || seg_idx >= total {
            return Err(Error::Codec("invalid segment header".into()));
        }
        Ok(Self {
            stream_id,
            seg_idx,
            total,
            payload: bytes[SEGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

/// Split a frame into segments under a fresh stream id.
pub fn split_frame(stream_id: u16, frame: &[u8]) -> Vec<Segment> {
    let chunks: Vec<&[u8]> = if frame.is_empty() {
        vec![&[]]
    } else {
        frame.chunks(SEGMENT_PAYLOAD).collect()
    };
    let total = chunks.len() as u16;
    chunks
        .into_iter()
        .enumerate()
        .map(|(idx, payload)| Segment {
            stream_id,
            seg_idx: idx as u16,
            total,
            payload: payload.to_vec(),
        })
        .collect()
}

struct PartialFrame {
    segments: HashMap<u16, Vec<u8>>,
    total: u16,
    bytes: usize,
    last_touch: Instant,
}

/// Per-link reassembly of segmented frames.
pub struct Reassembler {
    buffers: HashMap<(LinkAddr, u16), PartialFrame>,
    /// Discard partial frames growing past this many payload bytes.
    frame_cap: usize,
}

impl Reassembler {
    /// Create a reassembler with the given frame size cap.
    pub fn new(frame_cap: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            frame_cap,
        }
    }

    /// Feed one received segment. Returns the complete frame once the last
    /// piece arrives.
    pub fn push(&mut self, addr: &str, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        let segment = Segment::decode(bytes)?;
        let key = (addr.to_string(), segment.stream_id);

        let partial = self.buffers.entry(key.clone()).or_insert_with(|| PartialFrame {
            segments: HashMap::new(),
            total: segment.total,
            bytes: 0,
            last_touch: Instant::now(),
        });

        if partial.total != segment.total {
            // Stream id reuse with a different shape: restart the buffer.
            partial.segments.clear();
            partial.bytes = 0;
            partial.total = segment.total;
        }

        partial.bytes += segment.payload.len();
        partial.last_touch = Instant::now();
        if partial.bytes > self.frame_cap {
            self.buffers.remove(&key);
            return Err(Error::Codec("oversized frame discarded".into()));
        }
        partial.segments.insert(segment.seg_idx, segment.payload);

        if partial.segments.len() == partial.total as usize {
            let partial = self
                .buffers
                .remove(&key)
                .ok_or_else(|| Error::Codec("reassembly state lost".into()))?;
            let mut frame = Vec::with_capacity(partial.bytes);
            for idx in 0..partial.total {
                let piece = partial
                    .segments
                    .get(&idx)
                    .ok_or_else(|| Error::Codec("missing segment".into()))?;
                frame.extend_from_slice(piece);
            }
            return Ok(Some(frame));
        }
        Ok(None)
    }

    /// Discard buffers idle longer than [`REASSEMBLY_IDLE_SECS`], and
    /// everything belonging to a disconnected link.
    pub fn sweep(&mut self) {
        let idle = Duration::from_secs(REASSEMBLY_IDLE_SECS);
        self.buffers.retain(|_, p| p.last_touch.elapsed() < idle);
    }

    /// Drop all partial state for a link.
    pub fn forget_link(&mut self, addr: &str) {
        self.buffers.retain(|(a, _), _| a != addr);
    }

    /// Number of partial frames currently buffered.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_roundtrip() {
        let mut reassembler = Reassembler::new(1024);
        let segments = split_frame(1, b"small frame");
        assert_eq!(segments.len(), 1);

        let frame = reassembler
            .push("aa:bb", &segments[0].encode())
            .expect("push")
            .expect("complete");
        assert_eq!(frame, b"small frame");
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn multi_segment_in_order() {
        let mut reassembler = Reassembler::new(4096);
        let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        let segments = split_frame(7, &data);
        assert!(segments.len() > 1);

        let mut out = None;
        for seg in &segments {
            out = reassembler.push("aa:bb", &seg.encode()).expect("push");
        }
        assert_eq!(out.expect("complete"), data);
    }

    #[test]
    fn out_of_order_segments() {
        let mut reassembler = Reassembler::new(4096);
        let data = vec![0xA5u8; SEGMENT_PAYLOAD * 2 + 10];
        let segments = split_frame(3, &data);

        assert!(reassembler
            .push("x", &segments[2].encode())
            .expect("push")
            .is_none());
        assert!(reassembler
            .push("x", &segments[0].encode())
            .expect("push")
            .is_none());
        let frame = reassembler
            .push("x", &segments[1].encode())
            .expect("push")
            .expect("complete");
        assert_eq!(frame, data);
    }

    #[test]
    fn interleaved_streams_and_links() {
        let mut reassembler = Reassembler::new(4096);
        let a = vec![1u8; SEGMENT_PAYLOAD + 1];
        let b = vec![2u8; SEGMENT_PAYLOAD + 1];
        let seg_a = split_frame(1, &a);
        let seg_b = split_frame(1, &b);

        // Same stream id, different links: must not mix.
        assert!(reassembler.push("one", &seg_a[0].encode()).expect("push").is_none());
        assert!(reassembler.push("two", &seg_b[0].encode()).expect("push").is_none());
        assert_eq!(
            reassembler
                .push("one", &seg_a[1].encode())
                .expect("push")
                .expect("complete"),
            a
        );
        assert_eq!(
            reassembler
                .push("two", &seg_b[1].encode())
                .expect("push")
                .expect("complete"),
            b
        );
    }

    #[test]
    fn invalid_header_is_rejected() {
        let mut reassembler = Reassembler::new(1024);

        // seg_idx >= total
        let bad = Segment {
            stream_id: 1,
            seg_idx: 5,
            total: 3,
            payload: vec![0],
        };
        assert!(reassembler.push("x", &bad.encode()).is_err());

        // zero total
        let mut bytes = bad.encode();
        bytes[2..4].copy_from_slice(&0u16.to_be_bytes());
        bytes[4..6].copy_from_slice(&0u16.to_be_bytes());
        assert!(reassembler.push("x", &bytes).is_err());

        // truncated header
        assert!(reassembler.push("x", &[0, 1, 2]).is_err());
    }

    #[test]
    fn oversized_partial_is_discarded() {
        let mut reassembler = Reassembler::new(100);
        let data = vec![0u8; SEGMENT_PAYLOAD * 2];
        let segments = split_frame(9, &data);

        assert!(reassembler.push("x", &segments[0].encode()).is_err());
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn forget_link_clears_partials() {
        let mut reassembler = Reassembler::new(4096);
        let data = vec![0u8; SEGMENT_PAYLOAD + 1];
        let segments = split_frame(2, &data);

        reassembler.push("gone", &segments[0].encode()).expect("push");
        assert_eq!(reassembler.pending(), 1);
        reassembler.forget_link("gone");
        assert_eq!(reassembler.pending(), 0);
    }
}
