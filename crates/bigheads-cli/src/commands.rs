//! Command implementations.
//!
//! `start` runs the full node; the rest operate on the data directory
//! without touching the radio.

use bigheads_core::bus::{Event, Topic};
use bigheads_core::config::Config;
use bigheads_core::error::{Error, Result};
use bigheads_core::identity::{NodeId, BROADCAST};
use bigheads_core::mesh::{render_export, ExportFormat};
use bigheads_core::runtime::Runtime;
use bigheads_core::storage::Store;
use std::path::PathBuf;
use tracing::info;

/// Expand a leading `~` to the home directory.
pub fn expand_data_dir(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(raw)
}

fn parse_chat_id(raw: &str) -> Result<NodeId> {
    if raw.eq_ignore_ascii_case("broadcast") {
        return Ok(BROADCAST);
    }
    NodeId::from_hex(raw).map_err(|_| Error::Config(format!("not a chat id: {}", raw)))
}

fn open_store(data_dir: &std::path::Path) -> Result<Store> {
    Store::open(Config::db_path(data_dir))
}

/// Print this node's identity, creating it on first run.
pub fn identity(data_dir: &std::path::Path) -> Result<()> {
    Config::load(data_dir)?;
    let store = open_store(data_dir)?;
    let identity = store.load_or_create_identity()?;
    println!("node id:    {}", identity.id().to_hex());
    println!("public key: {}", hex::encode(identity.public_key().as_bytes()));
    Ok(())
}

/// Run the node until Ctrl-C.
pub async fn start(data_dir: &std::path::Path) -> Result<()> {
    let runtime = Runtime::start(data_dir).await?;
    info!(node = %runtime.mesh().node_id(), "node running; Ctrl-C to stop");

    let mut messages = runtime.subscribe(Topic::Message);
    let mut peers = runtime.subscribe(Topic::PeerState);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = messages.recv() => {
                match event {
                    Some(Event::Message { record }) => {
                        info!(chat = %record.chat_id, from = %record.origin, "{}", record.body);
                    }
                    Some(Event::FileComplete { name, bytes, origin, .. }) => {
                        info!(from = %origin, "received file {} ({} bytes)", name, bytes.len());
                    }
                    Some(Event::SystemNotice { text, .. }) => info!("{}", text),
                    Some(_) => {}
                    None => break,
                }
            }
            event = peers.recv() => {
                if let Some(Event::PeerState { node, addr, state }) = event {
                    info!(?node, %addr, ?state, "peer state");
                }
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}

/// List known peers.
pub fn peers(data_dir: &std::path::Path) -> Result<()> {
    let store = open_store(data_dir)?;
    let peers = store.peers_list()?;
    if peers.is_empty() {
        println!("no peers seen yet");
        return Ok(());
    }
    for peer in peers {
        println!(
            "{}  last_seen={}  blocked={}{}",
            peer.node_id.to_hex(),
            peer.last_seen
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".into()),
            peer.blocked,
            peer.alias
                .map(|a| format!("  alias={}", a))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

/// Set or clear a peer's block flag.
pub fn block(data_dir: &std::path::Path, peer: &str, blocked: bool) -> Result<()> {
    let peer = parse_chat_id(peer)?;
    if peer.is_broadcast() {
        return Err(Error::Config("cannot block the broadcast chat".into()));
    }
    let store = open_store(data_dir)?;
    store.block_set(&peer, blocked)?;
    println!(
        "{} {}",
        if blocked { "blocked" } else { "unblocked" },
        peer.to_hex()
    );
    Ok(())
}

/// Export a chat history to stdout or a file.
pub fn export(
    data_dir: &std::path::Path,
    chat: &str,
    format: &str,
    out: Option<&str>,
) -> Result<()> {
    let chat_id = parse_chat_id(chat)?;
    let format = match format.to_ascii_lowercase().as_str() {
        "json" => ExportFormat::Json,
        "html" => ExportFormat::Html,
        other => return Err(Error::Config(format!("unknown export format: {}", other))),
    };

    let store = open_store(data_dir)?;
    let rows = store.message_export(&chat_id)?;
    let rendered = render_export(&rows, format)?;

    match out {
        Some(path) => {
            std::fs::write(path, &rendered)
                .map_err(|e| Error::Storage(format!("cannot write {}: {}", path, e)))?;
            println!("wrote {} bytes to {}", rendered.len(), path);
        }
        None => {
            let text = String::from_utf8_lossy(&rendered);
            println!("{}", text);
        }
    }
    Ok(())
}
