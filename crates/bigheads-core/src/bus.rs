//! In-process pub/sub delivering decrypted events to UI collaborators.
//!
//! Four topics; subscribers get events in publication order, at least once,
//! with no coalescing. Queues are bounded and publication awaits a slow
//! subscriber rather than dropping; in particular a `message` event is never
//! lost to backpressure. The core never holds references to UI objects; this
//! channel boundary is the only coupling.

use crate::crypto::HandshakeState;
use crate::identity::NodeId;
use crate::protocol::MsgId;
use crate::storage::{MessageRecord, MessageState};
use crate::transport::LinkState;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Per-subscriber queue depth.
const SUBSCRIBER_QUEUE: usize = 256;

/// Subscription topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Chat content: messages, files, reactions, typing, system notices.
    Message,
    /// Peer lifecycle as seen by the mesh.
    PeerState,
    /// Raw transport notifications.
    Transport,
    /// Pairwise handshake progress.
    Handshake,
}

/// Events published by the core.
#[derive(Debug, Clone)]
pub enum Event {
    /// A chat message was archived (incoming or own outgoing).
    Message {
        /// The archived record, plaintext included.
        record: MessageRecord,
    },
    /// A message's delivery state changed.
    MessageState {
        /// Which message.
        msg_id: MsgId,
        /// The new state.
        state: MessageState,
    },
    /// A chunked file finished reassembling.
    FileComplete {
        /// File transfer id.
        file_id: [u8; 16],
        /// Original file name.
        name: String,
        /// MIME type.
        mime: String,
        /// The complete file bytes.
        bytes: Vec<u8>,
        /// Sending node.
        origin: NodeId,
        /// Chat the file belongs to.
        chat_id: NodeId,
    },
    /// A reaction arrived.
    Reaction {
        /// Message reacted to.
        msg_id: MsgId,
        /// Reacting node.
        reactor: NodeId,
        /// Emoji.
        emoji: String,
        /// Added or retracted.
        add: bool,
    },
    /// A typing indicator arrived.
    Typing {
        /// Chat the indicator applies to.
        chat_id: NodeId,
        /// Typing node.
        node: NodeId,
        /// Whether typing is in progress.
        typing: bool,
    },
    /// An in-chat system notice (handshake failures, rejected files).
    SystemNotice {
        /// Chat the notice belongs to.
        chat_id: NodeId,
        /// Human-readable text.
        text: String,
    },
    /// A peer's mesh-level state changed.
    PeerState {
        /// The peer, when its node id is known.
        node: Option<NodeId>,
        /// Radio address.
        addr: String,
        /// New link state.
        state: LinkState,
    },
    /// A raw transport-level notification.
    TransportNotice {
        /// Radio address involved.
        addr: String,
        /// Human-readable detail.
        detail: String,
    },
    /// Pairwise handshake progress with a peer.
    Handshake {
        /// The peer.
        peer: NodeId,
        /// New handshake state.
        state: HandshakeState,
    },
    /// The handshake with a peer gave up after retransmits.
    HandshakeFailed {
        /// The peer.
        peer: NodeId,
    },
}

impl Event {
    /// The topic this event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            Event::Message { .. }
            | Event::MessageState { .. }
            | Event::FileComplete { .. }
            | Event::Reaction { .. }
            | Event::Typing { .. }
            | Event::SystemNotice { .. } => Topic::Message,
            Event::PeerState { .. } => Topic::PeerState,
            Event::TransportNotice { .. } => Topic::Transport,
            Event::Handshake { .. } | Event::HandshakeFailed { .. } => Topic::Handshake,
        }
    }
}

/// The bus.
pub struct Bus {
    subscribers: Mutex<HashMap<Topic, Vec<mpsc::Sender<Event>>>>,
}

impl Bus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a topic. The returned receiver sees every subsequent
    /// event on that topic in publication order.
    pub fn subscribe(&self, topic: Topic) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(topic)
            .or_default()
            .push(tx);
        rx
    }

    /// Publish an event. Awaits slow subscribers; dead ones are pruned.
    pub async fn publish(&self, event: Event) {
        let topic = event.topic();
        let targets: Vec<mpsc::Sender<Event>> = {
            let subs = self
                .subscribers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subs.get(&topic).cloned().unwrap_or_default()
        };

        let mut dead = false;
        for tx in &targets {
            if tx.send(event.clone()).await.is_err() {
                dead = true;
            }
        }
        if dead {
            let mut subs = self
                .subscribers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(list) = subs.get_mut(&topic) {
                list.retain(|tx| !tx.is_closed());
            }
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::BROADCAST;

    fn notice(text: &str) -> Event {
        Event::SystemNotice {
            chat_id: BROADCAST,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn delivers_in_publication_order() {
        let bus = Bus::new();
        let mut rx = bus.subscribe(Topic::Message);

        for i in 0..5 {
            bus.publish(notice(&format!("n{}", i))).await;
        }

        for i in 0..5 {
            match rx.recv().await.expect("event") {
                Event::SystemNotice { text, .. } => assert_eq!(text, format!("n{}", i)),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = Bus::new();
        let mut msg_rx = bus.subscribe(Topic::Message);
        let mut hs_rx = bus.subscribe(Topic::Handshake);

        bus.publish(Event::HandshakeFailed {
            peer: NodeId::generate(),
        })
        .await;

        assert!(matches!(
            hs_rx.recv().await.expect("event"),
            Event::HandshakeFailed { .. }
        ));
        assert!(msg_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = Bus::new();
        let mut a = bus.subscribe(Topic::Message);
        let mut b = bus.subscribe(Topic::Message);

        bus.publish(notice("shared")).await;

        assert!(matches!(a.recv().await, Some(Event::SystemNotice { .. })));
        assert!(matches!(b.recv().await, Some(Event::SystemNotice { .. })));
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_stall_publish() {
        let bus = Bus::new();
        let rx = bus.subscribe(Topic::Message);
        drop(rx);

        bus.publish(notice("into the void")).await;

        let mut live = bus.subscribe(Topic::Message);
        bus.publish(notice("still works")).await;
        assert!(matches!(live.recv().await, Some(Event::SystemNotice { .. })));
    }
}
