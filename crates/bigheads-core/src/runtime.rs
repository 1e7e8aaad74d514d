//! Node lifecycle: startup order, background tasks, graceful shutdown.
//!
//! Components come up in dependency order: config, persistence, crypto,
//! transport, mesh. The bus is handed to subscribers once the mesh is
//! live. Background tasks (scan loop inside the transport, autosave, outbox
//! sweeper, chunk GC, handshake ticker, presence beacon) all watch one
//! shutdown signal; shutdown completes within five seconds regardless of
//! network state.

use crate::bus::{Bus, Event, Topic};
use crate::config::Config;
use crate::crypto::GroupCipher;
use crate::error::{Error, Result};
use crate::mesh::MeshService;
use crate::storage::Store;
use crate::transport::{BleCentral, TransportCommand, TransportEvent};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Transport channel depths.
const TRANSPORT_QUEUE: usize = 256;

/// Seconds between outbox sweeps.
const OUTBOX_SWEEP_SECS: u64 = 30;

/// Seconds between partial-file GC passes.
const CHUNK_GC_TICK_SECS: u64 = 60;

/// Seconds between handshake retransmit checks.
const HANDSHAKE_TICK_SECS: u64 = 5;

/// Shutdown deadline.
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// A running node.
pub struct Runtime {
    mesh: MeshService,
    bus: Arc<Bus>,
    store: Arc<Store>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Start a full node over the BLE transport.
    pub async fn start(data_dir: &Path) -> Result<Self> {
        let mut config = Config::load(data_dir)?;
        let store = Arc::new(Store::open(Config::db_path(data_dir))?);
        for (key, value) in store.config_overrides()? {
            config.apply_override(&key, &value);
        }
        config.validate()?;

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(TRANSPORT_QUEUE);
        let (cmd_tx, cmd_rx) = mpsc::channel::<TransportCommand>(TRANSPORT_QUEUE);

        let transport = Arc::new(BleCentral::new(config.clone(), event_tx).await?);

        let runtime = Self::start_core(config, store, event_rx, cmd_tx).await?;
        let shutdown_rx = runtime.shutdown_tx.subscribe();
        tokio::spawn(async move {
            transport.run(cmd_rx, shutdown_rx).await;
        });
        Ok(runtime)
    }

    /// Start the core against an arbitrary transport: the caller owns the
    /// command receiver and event sender. This is the seam the scenario
    /// tests run through.
    pub async fn start_core(
        config: Config,
        store: Arc<Store>,
        event_rx: mpsc::Receiver<TransportEvent>,
        cmd_tx: mpsc::Sender<TransportCommand>,
    ) -> Result<Self> {
        let identity = store.load_or_create_identity()?;
        info!(node = %identity.id(), "node identity loaded");

        // argon2id is deliberately slow; keep it off the reactor.
        let passphrase = config.group_passphrase.clone();
        let group = tokio::task::spawn_blocking(move || GroupCipher::from_passphrase(&passphrase))
            .await
            .map_err(|e| Error::Config(format!("key derivation task failed: {}", e)))??;

        let bus = Arc::new(Bus::new());
        let (mesh, inbound_rx) = MeshService::new(
            identity.id(),
            config.clone(),
            Arc::clone(&store),
            group,
            Arc::clone(&bus),
            cmd_tx,
        );
        mesh.load_sessions().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(mesh.spawn_event_pump(event_rx, shutdown_rx.clone()));
        tasks.push(mesh.spawn_dispatcher(inbound_rx, shutdown_rx.clone()));

        tasks.push(Self::spawn_ticker(
            Duration::from_secs(config.autosave_sec.max(1) as u64),
            shutdown_rx.clone(),
            {
                let store = Arc::clone(&store);
                move || {
                    let store = Arc::clone(&store);
                    async move {
                        if let Err(e) = store.checkpoint() {
                            warn!(error = %e, "autosave failed; retrying next tick");
                        }
                    }
                }
            },
        ));
        tasks.push(Self::spawn_ticker(
            Duration::from_secs(OUTBOX_SWEEP_SECS),
            shutdown_rx.clone(),
            {
                let mesh = mesh.clone();
                move || {
                    let mesh = mesh.clone();
                    async move { mesh.outbox_sweep().await }
                }
            },
        ));
        tasks.push(Self::spawn_ticker(
            Duration::from_secs(CHUNK_GC_TICK_SECS),
            shutdown_rx.clone(),
            {
                let mesh = mesh.clone();
                move || {
                    let mesh = mesh.clone();
                    async move { mesh.chunk_gc().await }
                }
            },
        ));
        tasks.push(Self::spawn_ticker(
            Duration::from_secs(HANDSHAKE_TICK_SECS),
            shutdown_rx.clone(),
            {
                let mesh = mesh.clone();
                move || {
                    let mesh = mesh.clone();
                    async move { mesh.handshake_tick().await }
                }
            },
        ));
        tasks.push(Self::spawn_ticker(
            Duration::from_secs(config.presence_interval_sec.max(1) as u64),
            shutdown_rx.clone(),
            {
                let mesh = mesh.clone();
                move || {
                    let mesh = mesh.clone();
                    async move {
                        if let Err(e) = mesh.send_presence().await {
                            warn!(error = %e, "presence beacon failed");
                        }
                    }
                }
            },
        ));

        Ok(Self {
            mesh,
            bus,
            store,
            shutdown_tx,
            tasks,
        })
    }

    fn spawn_ticker<F, Fut>(
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut tick_fn: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of tokio's interval fires immediately; skip it
            // so beacons and sweeps start one period in.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => tick_fn().await,
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// The mesh API surface.
    pub fn mesh(&self) -> &MeshService {
        &self.mesh
    }

    /// Subscribe to a bus topic.
    pub fn subscribe(&self, topic: Topic) -> mpsc::Receiver<Event> {
        self.bus.subscribe(topic)
    }

    /// The shared bus.
    pub fn bus(&self) -> Arc<Bus> {
        Arc::clone(&self.bus)
    }

    /// Stop accepting work, flush state and stop all tasks. Bounded by the
    /// shutdown deadline no matter what the network is doing.
    pub async fn shutdown(self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(true);

        let join_all = async {
            for task in self.tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), join_all)
            .await
            .is_err()
        {
            warn!("tasks did not stop within the shutdown deadline");
        }

        if let Err(e) = self.store.checkpoint() {
            warn!(error = %e, "final checkpoint failed");
        }
        info!("shutdown complete");
    }
}
