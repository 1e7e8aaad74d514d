//! BLE central: scanning, bounded connection pool, framed GATT I/O.
//!
//! The central scans for peers advertising the BigHeads service UUID,
//! maintains up to `max_connections` GATT links, subscribes to each peer's
//! notify characteristic for inbound segments, and writes outbound segments
//! to the write characteristic. Write failures never crash the transport;
//! they mark the link disconnected and surface an event.

use super::framing::{split_frame, Reassembler};
use super::{LinkAddr, TransportCommand, TransportEvent};
use crate::config::{Config, NOTIFY_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID};
use crate::error::{Error, Result};
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// First reconnect delay after a link failure.
pub const RECONNECT_BACKOFF_BASE_SECS: u64 = 1;

/// Reconnect delay cap.
pub const RECONNECT_BACKOFF_MAX_SECS: u64 = 60;

/// Forget peers not seen in a scan for this long.
const DISCOVERY_EXPIRY_SECS: u64 = 300;

/// Per-peer outbound send timeout.
const SEND_TIMEOUT_SECS: u64 = 10;

/// GATT connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Backoff delay before the n-th reconnect attempt (n starting at 0).
fn reconnect_delay(attempts: u32) -> Duration {
    let secs = RECONNECT_BACKOFF_BASE_SECS
        .saturating_mul(1u64 << attempts.min(16))
        .min(RECONNECT_BACKOFF_MAX_SECS);
    Duration::from_secs(secs)
}

struct ConnectedLink {
    peripheral: Peripheral,
    write_char: Characteristic,
    last_used: Instant,
    next_stream_id: u16,
}

#[derive(Default)]
struct PoolState {
    links: HashMap<LinkAddr, ConnectedLink>,
    /// Reconnect bookkeeping: attempt count and earliest next try.
    backoff: HashMap<LinkAddr, (u32, Instant)>,
    /// When each advertising peer was last seen in a scan.
    last_advertised: HashMap<LinkAddr, Instant>,
}

/// The BLE transport.
pub struct BleCentral {
    adapter: Adapter,
    config: Config,
    service_uuid: Uuid,
    write_uuid: Uuid,
    notify_uuid: Uuid,
    state: Arc<Mutex<PoolState>>,
    reassembler: Arc<Mutex<Reassembler>>,
    event_tx: mpsc::Sender<TransportEvent>,
}

impl BleCentral {
    /// Acquire the first BLE adapter on the host.
    ///
    /// Fails with [`Error::NoAdapter`] when none exists, which the binary
    /// maps to its dedicated exit code.
    pub async fn new(config: Config, event_tx: mpsc::Sender<TransportEvent>) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NoAdapter)?;

        let parse = |s: &str| {
            Uuid::parse_str(s).map_err(|e| Error::Config(format!("bad GATT uuid {}: {}", s, e)))
        };
        let frame_cap = config.packet_size_limit as usize;

        Ok(Self {
            adapter,
            config,
            service_uuid: parse(SERVICE_UUID)?,
            write_uuid: parse(WRITE_CHAR_UUID)?,
            notify_uuid: parse(NOTIFY_CHAR_UUID)?,
            state: Arc::new(Mutex::new(PoolState::default())),
            reassembler: Arc::new(Mutex::new(Reassembler::new(frame_cap))),
            event_tx,
        })
    }

    /// Run the transport until shutdown: one scan loop plus the command
    /// executor. Consumes the command receiver.
    pub async fn run(
        self: Arc<Self>,
        mut cmd_rx: mpsc::Receiver<TransportCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let scanner = Arc::clone(&self);
        let mut scan_shutdown = shutdown.clone();
        let scan_task = tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(scanner.config.scan_interval_sec as u64));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = scanner.scan_once().await {
                            warn!(error = %e, "BLE scan failed; check adapter state");
                        }
                    }
                    _ = scan_shutdown.changed() => break,
                }
            }
        });

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(TransportCommand::SendTo { addr, frame, reply }) => {
                            let ok = self.send_to(&addr, &frame).await;
                            if let Some(reply) = reply {
                                let _ = reply.send(ok);
                            }
                        }
                        Some(TransportCommand::Broadcast { frame, exclude }) => {
                            self.broadcast(&frame, exclude.as_deref()).await;
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        scan_task.abort();
        self.disconnect_all().await;
    }

    /// One scan pass: refresh the discovery set, then fill free pool slots.
    async fn scan_once(&self) -> Result<()> {
        self.adapter
            .start_scan(ScanFilter {
                services: vec![self.service_uuid],
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(
            (self.config.scan_interval_sec as u64 / 2).max(1),
        ))
        .await;
        let _ = self.adapter.stop_scan().await;

        let mut candidates = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            if !props.services.contains(&self.service_uuid) {
                continue;
            }
            let addr = peripheral.address().to_string();
            {
                let mut state = self.state.lock().await;
                state.last_advertised.insert(addr.clone(), Instant::now());
            }
            let _ = self
                .event_tx
                .send(TransportEvent::PeerDiscovered {
                    addr: addr.clone(),
                    rssi: props.rssi,
                })
                .await;
            candidates.push((addr, peripheral));
        }

        self.expire_stale_discoveries().await;
        // Sweep reassembly buffers on scan cadence; ten-second idle windows
        // do not need a dedicated timer.
        self.reassembler.lock().await.sweep();

        for (addr, peripheral) in candidates {
            if !self.eligible_for_connect(&addr).await {
                continue;
            }
            self.make_room_if_needed().await;
            if let Err(e) = self.connect(addr.clone(), peripheral).await {
                if !e.should_silent_drop() {
                    debug!(peer = %addr, error = %e, "BLE connect failed");
                }
                self.note_failure(&addr).await;
            }
        }
        Ok(())
    }

    async fn expire_stale_discoveries(&self) {
        let expiry = Duration::from_secs(DISCOVERY_EXPIRY_SECS);
        let mut state = self.state.lock().await;
        let stale: Vec<LinkAddr> = state
            .last_advertised
            .iter()
            .filter(|(_, seen)| seen.elapsed() > expiry)
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in stale {
            state.last_advertised.remove(&addr);
            state.backoff.remove(&addr);
        }
    }

    async fn eligible_for_connect(&self, addr: &str) -> bool {
        let state = self.state.lock().await;
        if state.links.contains_key(addr) {
            return false;
        }
        if let Some((_, next_try)) = state.backoff.get(addr) {
            if Instant::now() < *next_try {
                return false;
            }
        }
        true
    }

    /// Evict the least recently used link when the pool is at capacity.
    async fn make_room_if_needed(&self) {
        let evict = {
            let state = self.state.lock().await;
            if state.links.len() < self.config.max_connections as usize {
                return;
            }
            state
                .links
                .iter()
                .min_by_key(|(_, link)| link.last_used)
                .map(|(addr, _)| addr.clone())
        };
        if let Some(addr) = evict {
            info!(peer = %addr, "evicting least recently used BLE link");
            self.drop_link(&addr).await;
        }
    }

    async fn connect(&self, addr: LinkAddr, peripheral: Peripheral) -> Result<()> {
        tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            peripheral.connect(),
        )
        .await
        .map_err(|_| Error::Timeout)??;

        peripheral.discover_services().await?;
        let chars = peripheral.characteristics();
        let write_char = chars
            .iter()
            .find(|c| c.uuid == self.write_uuid)
            .cloned()
            .ok_or_else(|| Error::Transport("write characteristic not found".into()))?;
        let notify_char = chars
            .iter()
            .find(|c| c.uuid == self.notify_uuid)
            .cloned()
            .ok_or_else(|| Error::Transport("notify characteristic not found".into()))?;
        peripheral.subscribe(&notify_char).await?;

        self.spawn_notification_pump(addr.clone(), peripheral.clone())
            .await?;

        {
            let mut state = self.state.lock().await;
            state.backoff.remove(&addr);
            state.links.insert(
                addr.clone(),
                ConnectedLink {
                    peripheral,
                    write_char,
                    last_used: Instant::now(),
                    next_stream_id: 0,
                },
            );
        }

        info!(peer = %addr, "BLE peer connected");
        let _ = self
            .event_tx
            .send(TransportEvent::PeerConnected { addr })
            .await;
        Ok(())
    }

    async fn spawn_notification_pump(&self, addr: LinkAddr, peripheral: Peripheral) -> Result<()> {
        let mut notifications = peripheral.notifications().await?;
        let notify_uuid = self.notify_uuid;
        let reassembler = Arc::clone(&self.reassembler);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != notify_uuid {
                    continue;
                }
                let frame = {
                    let mut reassembler = reassembler.lock().await;
                    reassembler.push(&addr, &notification.value)
                };
                match frame {
                    Ok(Some(frame)) => {
                        let _ = event_tx
                            .send(TransportEvent::FrameReceived {
                                addr: addr.clone(),
                                frame,
                            })
                            .await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(peer = %addr, error = %e, "dropping bad segment");
                    }
                }
            }
            debug!(peer = %addr, "notification stream ended");
        });
        Ok(())
    }

    /// Write one frame to one link as ordered segments.
    async fn send_to(&self, addr: &str, frame: &[u8]) -> bool {
        let (peripheral, write_char, stream_id) = {
            let mut state = self.state.lock().await;
            let Some(link) = state.links.get_mut(addr) else {
                return false;
            };
            link.last_used = Instant::now();
            let stream_id = link.next_stream_id;
            link.next_stream_id = link.next_stream_id.wrapping_add(1);
            (link.peripheral.clone(), link.write_char.clone(), stream_id)
        };

        let write = async {
            for segment in split_frame(stream_id, frame) {
                peripheral
                    .write(&write_char, &segment.encode(), WriteType::WithoutResponse)
                    .await?;
            }
            Ok::<(), btleplug::Error>(())
        };

        match tokio::time::timeout(Duration::from_secs(SEND_TIMEOUT_SECS), write).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(peer = %addr, error = %e, "BLE write failed");
                self.drop_link(addr).await;
                self.note_failure(addr).await;
                false
            }
            Err(_) => {
                warn!(peer = %addr, "BLE write timed out");
                self.drop_link(addr).await;
                self.note_failure(addr).await;
                false
            }
        }
    }

    /// Best-effort fan-out to every connected link except `exclude`.
    async fn broadcast(&self, frame: &[u8], exclude: Option<&str>) {
        let targets: Vec<LinkAddr> = {
            let state = self.state.lock().await;
            state
                .links
                .keys()
                .filter(|addr| Some(addr.as_str()) != exclude)
                .cloned()
                .collect()
        };
        for addr in targets {
            self.send_to(&addr, frame).await;
        }
    }

    async fn note_failure(&self, addr: &str) {
        let mut state = self.state.lock().await;
        let attempts = state.backoff.get(addr).map(|(n, _)| n + 1).unwrap_or(0);
        state.backoff.insert(
            addr.to_string(),
            (attempts, Instant::now() + reconnect_delay(attempts)),
        );
    }

    async fn drop_link(&self, addr: &str) {
        let link = {
            let mut state = self.state.lock().await;
            state.links.remove(addr)
        };
        if let Some(link) = link {
            let _ = link.peripheral.disconnect().await;
            self.reassembler.lock().await.forget_link(addr);
            let _ = self
                .event_tx
                .send(TransportEvent::PeerDisconnected {
                    addr: addr.to_string(),
                })
                .await;
        }
    }

    async fn disconnect_all(&self) {
        let addrs: Vec<LinkAddr> = {
            let state = self.state.lock().await;
            state.links.keys().cloned().collect()
        };
        for addr in addrs {
            self.drop_link(&addr).await;
        }
        let _ = self.adapter.stop_scan().await;
        info!("BLE transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(2), Duration::from_secs(4));
        assert_eq!(reconnect_delay(6), Duration::from_secs(60));
        assert_eq!(reconnect_delay(30), Duration::from_secs(60));
    }
}
