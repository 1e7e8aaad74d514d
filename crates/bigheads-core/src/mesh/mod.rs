//! The mesh protocol layer: envelope pipeline, flooding, outbox, files.
//!
//! A single dispatcher task owns the inbound pipeline so dedupe and relay
//! ordering are serialized; everything the radios deliver funnels through a
//! bounded queue into it. Outbound traffic is encrypted, recorded, then
//! flooded (broadcast) or route-biased (unicast) across the connected links.

mod files;
mod service;

pub use files::{chunk_capacity, chunk_file, CompletedFile, FileAssembler, CHUNK_GC_SECS};
pub use service::{
    render_export, Counters, CountersSnapshot, ExportFormat, Inbound, MeshService, MAX_TTL,
    OUTBOX_MAX_AGE_MS,
};
