//! Inline file transfer: base64 chunking and reassembly.
//!
//! A file below the configured cap is split into `FILE_CHUNK` envelopes small
//! enough to fit the packet budget. The receiver buffers chunks by file id
//! and emits the whole file once every index is present. There is no
//! retransmit protocol; flood redundancy is the only repair mechanism, and
//! chunk sets that stay incomplete are garbage-collected.

use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::protocol::FileChunkPayload;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Seconds an incomplete chunk set survives after its first chunk.
pub const CHUNK_GC_SECS: u64 = 600;

/// Fixed bincode framing allowance for the non-data fields of a chunk
/// payload (ids, counters, string length prefixes).
const CHUNK_FIELD_OVERHEAD: usize = 64;

/// Raw bytes per chunk such that the base64 payload fits `packet_budget`
/// ciphertext bytes alongside the name and MIME fields.
pub fn chunk_capacity(packet_budget: usize, name: &str, mime: &str) -> usize {
    let b64_budget = packet_budget
        .saturating_sub(CHUNK_FIELD_OVERHEAD + name.len() + mime.len());
    // Four base64 chars encode three raw bytes.
    (b64_budget / 4).saturating_mul(3).max(48)
}

/// Split a file into chunk payloads under a fresh file id.
pub fn chunk_file(
    data: &[u8],
    name: &str,
    mime: &str,
    packet_budget: usize,
) -> ([u8; 16], Vec<FileChunkPayload>) {
    let file_id = crate::crypto::random_bytes::<16>();
    let capacity = chunk_capacity(packet_budget, name, mime);
    let pieces: Vec<&[u8]> = if data.is_empty() {
        vec![&[]]
    } else {
        data.chunks(capacity).collect()
    };
    let total = pieces.len() as u32;
    let chunks = pieces
        .into_iter()
        .enumerate()
        .map(|(idx, piece)| FileChunkPayload {
            file_id,
            chunk_idx: idx as u32,
            total_chunks: total,
            name: name.to_string(),
            mime: mime.to_string(),
            data: BASE64.encode(piece),
        })
        .collect();
    (file_id, chunks)
}

/// A fully reassembled file.
#[derive(Debug, Clone)]
pub struct CompletedFile {
    /// Transfer id.
    pub file_id: [u8; 16],
    /// Original name.
    pub name: String,
    /// MIME type.
    pub mime: String,
    /// The file bytes.
    pub bytes: Vec<u8>,
    /// Sending node.
    pub origin: NodeId,
    /// Chat the file belongs to.
    pub chat_id: NodeId,
}

struct PartialFile {
    name: String,
    mime: String,
    total: u32,
    chunks: HashMap<u32, Vec<u8>>,
    origin: NodeId,
    chat_id: NodeId,
    first_seen: Instant,
}

/// Buffers inbound chunks until files complete.
pub struct FileAssembler {
    partials: HashMap<[u8; 16], PartialFile>,
    /// Reject files that would exceed this many raw bytes.
    max_file_bytes: usize,
}

impl FileAssembler {
    /// Create an assembler with the inline-file size cap.
    pub fn new(max_file_bytes: usize) -> Self {
        Self {
            partials: HashMap::new(),
            max_file_bytes,
        }
    }

    /// Feed one decrypted chunk. Returns the file once complete.
    pub fn push(
        &mut self,
        chunk: FileChunkPayload,
        origin: NodeId,
        chat_id: NodeId,
    ) -> Result<Option<CompletedFile>> {
        if chunk.total_chunks == 0 || chunk.chunk_idx >= chunk.total_chunks {
            return Err(Error::Codec("invalid chunk indices".into()));
        }
        let data = BASE64
            .decode(chunk.data.as_bytes())
            .map_err(|_| Error::Codec("invalid chunk base64".into()))?;

        let partial = self
            .partials
            .entry(chunk.file_id)
            .or_insert_with(|| PartialFile {
                name: chunk.name.clone(),
                mime: chunk.mime.clone(),
                total: chunk.total_chunks,
                chunks: HashMap::new(),
                origin,
                chat_id,
                first_seen: Instant::now(),
            });

        if partial.total != chunk.total_chunks || partial.origin != origin {
            // Conflicting metadata under one file id: keep the first claim,
            // drop the stray chunk.
            return Err(Error::Codec("conflicting chunk metadata".into()));
        }
        partial.chunks.insert(chunk.chunk_idx, data);

        let received: usize = partial.chunks.values().map(Vec::len).sum();
        if received > self.max_file_bytes {
            self.partials.remove(&chunk.file_id);
            return Err(Error::Policy("reassembled file exceeds cap".into()));
        }

        if partial.chunks.len() == partial.total as usize {
            let partial = self
                .partials
                .remove(&chunk.file_id)
                .ok_or_else(|| Error::Codec("assembly state lost".into()))?;
            let mut bytes = Vec::with_capacity(received);
            for idx in 0..partial.total {
                let piece = partial
                    .chunks
                    .get(&idx)
                    .ok_or_else(|| Error::Codec("missing chunk".into()))?;
                bytes.extend_from_slice(piece);
            }
            return Ok(Some(CompletedFile {
                file_id: chunk.file_id,
                name: partial.name,
                mime: partial.mime,
                bytes,
                origin: partial.origin,
                chat_id: partial.chat_id,
            }));
        }
        Ok(None)
    }

    /// Drop chunk sets whose first chunk is older than `max_age`. Returns
    /// how many were discarded.
    pub fn sweep(&mut self, max_age: Duration) -> usize {
        let before = self.partials.len();
        self.partials.retain(|_, p| p.first_seen.elapsed() < max_age);
        before - self.partials.len()
    }

    /// Number of incomplete files currently buffered.
    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::BROADCAST;

    fn make_chunks(data: &[u8], budget: usize) -> ([u8; 16], Vec<FileChunkPayload>) {
        chunk_file(data, "pic.png", "image/png", budget)
    }

    #[test]
    fn chunk_then_reassemble_byte_identical() {
        let data: Vec<u8> = (0..5000).map(|i| (i % 256) as u8).collect();
        let origin = NodeId::generate();
        let (_, chunks) = make_chunks(&data, 400);
        assert!(chunks.len() > 1);

        let mut assembler = FileAssembler::new(1 << 20);
        let mut out = None;
        for chunk in chunks {
            out = assembler.push(chunk, origin, BROADCAST).expect("push");
        }
        let file = out.expect("complete");
        assert_eq!(file.bytes, data);
        assert_eq!(file.name, "pic.png");
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn interleaved_files_reassemble_independently() {
        let origin = NodeId::generate();
        let a: Vec<u8> = vec![0xAA; 1500];
        let b: Vec<u8> = vec![0xBB; 1500];
        let (_, chunks_a) = make_chunks(&a, 400);
        let (_, chunks_b) = make_chunks(&b, 400);

        let mut assembler = FileAssembler::new(1 << 20);
        let mut done = Vec::new();
        for (ca, cb) in chunks_a.iter().zip(chunks_b.iter()) {
            if let Some(f) = assembler.push(ca.clone(), origin, BROADCAST).expect("push") {
                done.push(f);
            }
            if let Some(f) = assembler.push(cb.clone(), origin, BROADCAST).expect("push") {
                done.push(f);
            }
        }
        assert_eq!(done.len(), 2);
        assert!(done.iter().any(|f| f.bytes == a));
        assert!(done.iter().any(|f| f.bytes == b));
    }

    #[test]
    fn out_of_order_chunks() {
        let data = vec![7u8; 1000];
        let origin = NodeId::generate();
        let (_, mut chunks) = make_chunks(&data, 400);
        chunks.reverse();

        let mut assembler = FileAssembler::new(1 << 20);
        let mut out = None;
        for chunk in chunks {
            out = assembler.push(chunk, origin, BROADCAST).expect("push");
        }
        assert_eq!(out.expect("complete").bytes, data);
    }

    #[test]
    fn duplicate_chunks_are_harmless() {
        let data = vec![1u8; 700];
        let origin = NodeId::generate();
        let (_, chunks) = make_chunks(&data, 400);

        let mut assembler = FileAssembler::new(1 << 20);
        assembler
            .push(chunks[0].clone(), origin, BROADCAST)
            .expect("push");
        assembler
            .push(chunks[0].clone(), origin, BROADCAST)
            .expect("push");
        let mut out = None;
        for chunk in &chunks[1..] {
            out = assembler
                .push(chunk.clone(), origin, BROADCAST)
                .expect("push");
        }
        assert_eq!(out.expect("complete").bytes, data);
    }

    #[test]
    fn rejects_bad_indices_and_base64() {
        let mut assembler = FileAssembler::new(1 << 20);
        let origin = NodeId::generate();

        let bad_idx = FileChunkPayload {
            file_id: [1; 16],
            chunk_idx: 5,
            total_chunks: 2,
            name: "x".into(),
            mime: "y".into(),
            data: BASE64.encode(b"data"),
        };
        assert!(assembler.push(bad_idx, origin, BROADCAST).is_err());

        let bad_b64 = FileChunkPayload {
            file_id: [2; 16],
            chunk_idx: 0,
            total_chunks: 1,
            name: "x".into(),
            mime: "y".into(),
            data: "!!not base64!!".into(),
        };
        assert!(assembler.push(bad_b64, origin, BROADCAST).is_err());
    }

    #[test]
    fn oversized_file_discarded() {
        let data = vec![0u8; 4000];
        let origin = NodeId::generate();
        let (_, chunks) = make_chunks(&data, 400);

        let mut assembler = FileAssembler::new(1000);
        let mut failed = false;
        for chunk in chunks {
            if assembler.push(chunk, origin, BROADCAST).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn sweep_discards_stale_partials() {
        let data = vec![3u8; 1000];
        let origin = NodeId::generate();
        let (_, chunks) = make_chunks(&data, 400);

        let mut assembler = FileAssembler::new(1 << 20);
        assembler
            .push(chunks[0].clone(), origin, BROADCAST)
            .expect("push");
        assert_eq!(assembler.pending(), 1);

        assert_eq!(assembler.sweep(Duration::from_secs(CHUNK_GC_SECS)), 0);
        assert_eq!(assembler.sweep(Duration::ZERO), 1);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn chunks_fit_packet_budget() {
        let data = vec![0u8; 10_000];
        let budget = 400;
        let (_, chunks) = make_chunks(&data, budget);
        for chunk in &chunks {
            let encoded = chunk.to_bytes().expect("encode");
            assert!(
                encoded.len() <= budget,
                "chunk payload {} exceeds budget {}",
                encoded.len(),
                budget
            );
        }
    }
}
