//! Shared harness: a channel-backed link fabric standing in for the radios.
//!
//! Each node runs a full core (dispatcher, crypto, storage, bus) against the
//! transport seam; the fabric routes frames between linked nodes and counts
//! transmissions so loop-suppression budgets can be asserted.

use bigheads_core::bus::Event;
use bigheads_core::config::Config;
use bigheads_core::runtime::Runtime;
use bigheads_core::storage::Store;
use bigheads_core::transport::{TransportCommand, TransportEvent};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const CHANNEL_DEPTH: usize = 2048;

struct FabricInner {
    nodes: Mutex<HashMap<String, mpsc::Sender<TransportEvent>>>,
    links: Mutex<HashMap<String, HashSet<String>>>,
    tx_count: AtomicU64,
}

/// The simulated radio fabric.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl Fabric {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FabricInner {
                nodes: Mutex::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
                tx_count: AtomicU64::new(0),
            }),
        }
    }

    fn register(
        &self,
        name: &str,
        event_tx: mpsc::Sender<TransportEvent>,
        mut cmd_rx: mpsc::Receiver<TransportCommand>,
    ) {
        self.inner
            .nodes
            .lock()
            .expect("nodes lock")
            .insert(name.to_string(), event_tx);

        let inner = Arc::clone(&self.inner);
        let from = name.to_string();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    TransportCommand::SendTo { addr, frame, reply } => {
                        let ok = deliver(&inner, &from, &addr, frame).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(ok);
                        }
                    }
                    TransportCommand::Broadcast { frame, exclude } => {
                        let peers: Vec<String> = {
                            let links = inner.links.lock().expect("links lock");
                            links
                                .get(&from)
                                .map(|set| {
                                    set.iter()
                                        .filter(|p| Some(p.as_str()) != exclude.as_deref())
                                        .cloned()
                                        .collect()
                                })
                                .unwrap_or_default()
                        };
                        for peer in peers {
                            deliver(&inner, &from, &peer, frame.clone()).await;
                        }
                    }
                }
            }
        });
    }

    /// Bring a bidirectional link up.
    pub async fn connect(&self, a: &str, b: &str) {
        {
            let mut links = self.inner.links.lock().expect("links lock");
            links.entry(a.to_string()).or_default().insert(b.to_string());
            links.entry(b.to_string()).or_default().insert(a.to_string());
        }
        self.notify(a, TransportEvent::PeerConnected { addr: b.to_string() })
            .await;
        self.notify(b, TransportEvent::PeerConnected { addr: a.to_string() })
            .await;
    }

    /// Tear a link down.
    pub async fn disconnect(&self, a: &str, b: &str) {
        {
            let mut links = self.inner.links.lock().expect("links lock");
            if let Some(set) = links.get_mut(a) {
                set.remove(b);
            }
            if let Some(set) = links.get_mut(b) {
                set.remove(a);
            }
        }
        self.notify(a, TransportEvent::PeerDisconnected { addr: b.to_string() })
            .await;
        self.notify(b, TransportEvent::PeerDisconnected { addr: a.to_string() })
            .await;
    }

    /// Push a raw frame straight into a node, as if it arrived on a link.
    pub async fn inject(&self, to: &str, from_addr: &str, frame: Vec<u8>) {
        self.notify(
            to,
            TransportEvent::FrameReceived {
                addr: from_addr.to_string(),
                frame,
            },
        )
        .await;
    }

    async fn notify(&self, node: &str, event: TransportEvent) {
        let tx = {
            let nodes = self.inner.nodes.lock().expect("nodes lock");
            nodes.get(node).cloned()
        };
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Frames delivered across the fabric since the last reset.
    pub fn tx_count(&self) -> u64 {
        self.inner.tx_count.load(Ordering::Relaxed)
    }

    pub fn reset_tx_count(&self) {
        self.inner.tx_count.store(0, Ordering::Relaxed);
    }
}

async fn deliver(inner: &Arc<FabricInner>, from: &str, to: &str, frame: Vec<u8>) -> bool {
    let linked = {
        let links = inner.links.lock().expect("links lock");
        links.get(from).map(|set| set.contains(to)).unwrap_or(false)
    };
    if !linked {
        return false;
    }
    inner.tx_count.fetch_add(1, Ordering::Relaxed);
    let tx = {
        let nodes = inner.nodes.lock().expect("nodes lock");
        nodes.get(to).cloned()
    };
    match tx {
        Some(tx) => tx
            .send(TransportEvent::FrameReceived {
                addr: from.to_string(),
                frame,
            })
            .await
            .is_ok(),
        None => false,
    }
}

/// One node on the fabric.
pub struct TestNode {
    pub name: String,
    pub runtime: Runtime,
    pub store: Arc<Store>,
}

/// Quiet config for deterministic tests: no presence beacons or autosave
/// ticks firing mid-assertion.
pub fn test_config(passphrase: &str) -> Config {
    let mut config = Config::default();
    config.group_passphrase = passphrase.to_string();
    config.presence_interval_sec = 3600;
    config.autosave_sec = 3600;
    config
}

/// Spawn a node with an in-memory store.
pub async fn spawn_node(fabric: &Fabric, name: &str, passphrase: &str) -> TestNode {
    let store = Arc::new(Store::open_in_memory().expect("store"));
    spawn_node_with_store(fabric, name, test_config(passphrase), store).await
}

/// Spawn a node on a file-backed store (for restart scenarios).
pub async fn spawn_node_at(
    fabric: &Fabric,
    name: &str,
    passphrase: &str,
    path: &PathBuf,
) -> TestNode {
    let store = Arc::new(Store::open(path).expect("store"));
    spawn_node_with_store(fabric, name, test_config(passphrase), store).await
}

pub async fn spawn_node_with_store(
    fabric: &Fabric,
    name: &str,
    config: Config,
    store: Arc<Store>,
) -> TestNode {
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_DEPTH);
    fabric.register(name, event_tx, cmd_rx);

    let runtime = Runtime::start_core(config, Arc::clone(&store), event_rx, cmd_tx)
        .await
        .expect("runtime start");

    TestNode {
        name: name.to_string(),
        runtime,
        store,
    }
}

/// Receive the next event within a deadline.
pub async fn recv_event(rx: &mut mpsc::Receiver<Event>, within: Duration) -> Option<Event> {
    tokio::time::timeout(within, rx.recv()).await.ok().flatten()
}

/// Let in-flight frames and relays drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}
