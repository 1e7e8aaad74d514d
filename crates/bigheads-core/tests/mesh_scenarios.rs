//! End-to-end mesh scenarios over the channel fabric: real crypto, real
//! storage, real dispatchers, simulated radios.

mod common;

use bigheads_core::bus::{Event, Topic};
use bigheads_core::crypto::{GroupCipher, HandshakeState};
use bigheads_core::identity::{NodeId, BROADCAST};
use bigheads_core::protocol::{Envelope, Kind, MsgId, TextPayload};
use bigheads_core::storage::{MessageRecord, MessageState};
use common::{recv_event, settle, spawn_node, spawn_node_at, Fabric};
use std::time::Duration;
use tokio::sync::mpsc;

const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Wait for the next incoming (non-outgoing) chat message, skipping other
/// message-topic events.
async fn next_incoming_message(rx: &mut mpsc::Receiver<Event>) -> MessageRecord {
    loop {
        match recv_event(rx, EVENT_WAIT).await {
            Some(Event::Message { record }) if !record.outgoing => return record,
            Some(_) => continue,
            None => panic!("timed out waiting for incoming message"),
        }
    }
}

/// Assert no further incoming chat message arrives within a grace window.
async fn assert_no_more_incoming(rx: &mut mpsc::Receiver<Event>) {
    let deadline = tokio::time::sleep(Duration::from_millis(500));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(Event::Message { record }) if !record.outgoing => {
                    panic!("unexpected duplicate delivery: {:?}", record.msg_id)
                }
                Some(_) => continue,
                None => return,
            },
            _ = &mut deadline => return,
        }
    }
}

#[tokio::test]
async fn three_node_broadcast_reaches_the_far_side() {
    let fabric = Fabric::new();
    let a = spawn_node(&fabric, "a", "hello").await;
    let b = spawn_node(&fabric, "b", "hello").await;
    let c = spawn_node(&fabric, "c", "hello").await;

    // A-B and B-C; A and C are not directly linked.
    fabric.connect("a", "b").await;
    fabric.connect("b", "c").await;
    settle().await;

    let mut a_rx = a.runtime.subscribe(Topic::Message);
    let mut b_rx = b.runtime.subscribe(Topic::Message);
    let mut c_rx = c.runtime.subscribe(Topic::Message);

    let msg_id = a
        .runtime
        .mesh()
        .send_text(BROADCAST, "hi", None)
        .await
        .expect("send");

    let at_b = next_incoming_message(&mut b_rx).await;
    assert_eq!(at_b.body, "hi");
    assert_eq!(at_b.origin, a.runtime.mesh().node_id());

    let at_c = next_incoming_message(&mut c_rx).await;
    assert_eq!(at_c.body, "hi");
    assert_eq!(at_c.msg_id, msg_id);

    assert_no_more_incoming(&mut b_rx).await;
    assert_no_more_incoming(&mut c_rx).await;
    // The originator sees its own outgoing record and nothing else.
    assert_no_more_incoming(&mut a_rx).await;

    assert!(b.store.seen_contains(&msg_id).expect("seen"));
    assert!(c.store.seen_contains(&msg_id).expect("seen"));
}

#[tokio::test]
async fn ring_flood_stays_within_transmission_budget() {
    let fabric = Fabric::new();
    let a = spawn_node(&fabric, "a", "ring").await;
    let b = spawn_node(&fabric, "b", "ring").await;
    let c = spawn_node(&fabric, "c", "ring").await;

    fabric.connect("a", "b").await;
    fabric.connect("b", "c").await;
    fabric.connect("c", "a").await;
    settle().await;

    let mut b_rx = b.runtime.subscribe(Topic::Message);
    let mut c_rx = c.runtime.subscribe(Topic::Message);

    fabric.reset_tx_count();
    a.runtime
        .mesh()
        .send_text(BROADCAST, "around the ring", None)
        .await
        .expect("send");

    assert_eq!(next_incoming_message(&mut b_rx).await.body, "around the ring");
    assert_eq!(next_incoming_message(&mut c_rx).await.body, "around the ring");
    assert_no_more_incoming(&mut b_rx).await;
    assert_no_more_incoming(&mut c_rx).await;

    // Two transmissions per link is the ceiling for one flooded envelope.
    let transmitted = fabric.tx_count();
    assert!(
        transmitted <= 6,
        "flood used {} transmissions, budget is 6",
        transmitted
    );
}

#[tokio::test]
async fn pairwise_handshake_then_first_message() {
    let fabric = Fabric::new();
    let a = spawn_node(&fabric, "a", "pair").await;
    let b = spawn_node(&fabric, "b", "pair").await;
    fabric.connect("a", "b").await;
    settle().await;

    let b_id = b.runtime.mesh().node_id();
    let mut a_hs = a.runtime.subscribe(Topic::Handshake);
    let mut b_hs = b.runtime.subscribe(Topic::Handshake);
    let mut a_msg = a.runtime.subscribe(Topic::Message);
    let mut b_msg = b.runtime.subscribe(Topic::Message);

    let msg_id = a
        .runtime
        .mesh()
        .send_text(b_id, "yo", None)
        .await
        .expect("send");

    // Initiator walks InitSent -> Established.
    match recv_event(&mut a_hs, EVENT_WAIT).await {
        Some(Event::Handshake { peer, state }) => {
            assert_eq!(peer, b_id);
            assert_eq!(state, HandshakeState::InitSent);
        }
        other => panic!("expected InitSent, got {:?}", other),
    }
    match recv_event(&mut a_hs, EVENT_WAIT).await {
        Some(Event::Handshake { state, .. }) => assert_eq!(state, HandshakeState::Established),
        other => panic!("expected Established, got {:?}", other),
    }

    // Responder reports Established.
    match recv_event(&mut b_hs, EVENT_WAIT).await {
        Some(Event::Handshake { peer, state }) => {
            assert_eq!(peer, a.runtime.mesh().node_id());
            assert_eq!(state, HandshakeState::Established);
        }
        other => panic!("expected Established, got {:?}", other),
    }

    // The held-back plaintext goes out the moment the session is live.
    let delivered = next_incoming_message(&mut b_msg).await;
    assert_eq!(delivered.body, "yo");
    assert_eq!(delivered.msg_id, msg_id);

    // The sender sees the archive record, then Sent, then the ack.
    let mut saw_sent = false;
    let mut saw_delivered = false;
    for _ in 0..8 {
        match recv_event(&mut a_msg, EVENT_WAIT).await {
            Some(Event::MessageState { msg_id: id, state }) if id == msg_id => match state {
                MessageState::Sent => saw_sent = true,
                MessageState::Delivered => {
                    saw_delivered = true;
                    break;
                }
                other => panic!("unexpected state {:?}", other),
            },
            Some(_) => continue,
            None => break,
        }
    }
    assert!(saw_sent, "no Sent state observed");
    assert!(saw_delivered, "no Delivered ack observed");
}

#[tokio::test]
async fn offline_outbox_flushes_in_order_on_reconnect() {
    let fabric = Fabric::new();
    let a = spawn_node(&fabric, "a", "queue").await;
    let b = spawn_node(&fabric, "b", "queue").await;
    fabric.connect("a", "b").await;
    settle().await;

    let b_id = b.runtime.mesh().node_id();
    let mut b_msg = b.runtime.subscribe(Topic::Message);

    // Establish the session while the link is up.
    a.runtime
        .mesh()
        .send_text(b_id, "warmup", None)
        .await
        .expect("send");
    assert_eq!(next_incoming_message(&mut b_msg).await.body, "warmup");

    fabric.disconnect("a", "b").await;
    settle().await;

    for body in ["first", "second", "third"] {
        a.runtime
            .mesh()
            .send_text(b_id, body, None)
            .await
            .expect("send");
    }
    settle().await;
    assert_eq!(a.store.outbox_for(&b_id).expect("outbox").len(), 3);

    fabric.connect("a", "b").await;

    assert_eq!(next_incoming_message(&mut b_msg).await.body, "first");
    assert_eq!(next_incoming_message(&mut b_msg).await.body, "second");
    assert_eq!(next_incoming_message(&mut b_msg).await.body, "third");
    assert_no_more_incoming(&mut b_msg).await;

    settle().await;
    assert!(a.store.outbox_for(&b_id).expect("outbox").is_empty());
}

#[tokio::test]
async fn tampered_broadcast_is_dropped_and_not_relayed() {
    let fabric = Fabric::new();
    let b = spawn_node(&fabric, "b", "hello").await;
    let c = spawn_node(&fabric, "c", "hello").await;
    fabric.connect("b", "c").await;
    settle().await;

    let mut b_msg = b.runtime.subscribe(Topic::Message);

    // A valid group envelope from a ghost origin, with one ciphertext byte
    // flipped in transit.
    let group = GroupCipher::from_passphrase("hello").expect("derive");
    let origin = NodeId::generate();
    let msg_id = MsgId::generate();
    let payload = TextPayload {
        body: "tampered".into(),
        reply_to: None,
    }
    .to_bytes()
    .expect("payload");
    let aad = Envelope::aad(&msg_id, &origin, &BROADCAST, Kind::Text, 0);
    let (nonce, mut ciphertext) = group.seal(&payload, &aad).expect("seal");
    ciphertext[0] ^= 0xFF;

    let env = Envelope {
        msg_id,
        origin,
        dest: BROADCAST,
        kind: Kind::Text,
        ttl: 6,
        hop: 1,
        seq: 0,
        ts: 1,
        nonce,
        ciphertext,
    };

    fabric.reset_tx_count();
    fabric.inject("b", "ghost", env.encode()).await;
    settle().await;

    let counters = b.runtime.mesh().counters();
    assert_eq!(counters.crypto_errors, 1);
    assert_eq!(counters.delivered, 0);
    assert!(b.store.seen_contains(&msg_id).expect("seen"));
    // The authenticated-failure envelope never reached C.
    assert_eq!(fabric.tx_count(), 0);
    assert_eq!(c.runtime.mesh().counters().delivered, 0);

    let deadline = tokio::time::timeout(Duration::from_millis(300), b_msg.recv()).await;
    assert!(deadline.is_err(), "no message event expected");
}

#[tokio::test]
async fn file_transfer_interleaved_with_text() {
    let fabric = Fabric::new();
    let a = spawn_node(&fabric, "a", "files").await;
    let b = spawn_node(&fabric, "b", "files").await;
    fabric.connect("a", "b").await;
    settle().await;

    let mut b_msg = b.runtime.subscribe(Topic::Message);

    let data: Vec<u8> = (0..60_000u32).map(|i| ((i * 31 + 7) % 256) as u8).collect();

    a.runtime
        .mesh()
        .send_text(BROADCAST, "before the file", None)
        .await
        .expect("send");
    a.runtime
        .mesh()
        .send_file(BROADCAST, &data, "pic.png", "image/png")
        .await
        .expect("send file");
    a.runtime
        .mesh()
        .send_text(BROADCAST, "after the file", None)
        .await
        .expect("send");

    let mut file_events = 0;
    let mut texts = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while file_events == 0 || texts.len() < 2 {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for file + texts");
        match recv_event(&mut b_msg, remaining).await {
            Some(Event::FileComplete { name, mime, bytes, .. }) => {
                file_events += 1;
                assert_eq!(name, "pic.png");
                assert_eq!(mime, "image/png");
                assert_eq!(bytes, data);
            }
            Some(Event::Message { record }) if !record.outgoing => {
                texts.push(record.body);
            }
            Some(_) => continue,
            None => panic!("timed out"),
        }
    }

    assert_eq!(file_events, 1);
    assert!(texts.contains(&"before the file".to_string()));
    assert!(texts.contains(&"after the file".to_string()));

    // No second completion for the same file.
    let extra = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            match b_msg.recv().await {
                Some(Event::FileComplete { .. }) => break true,
                Some(_) => continue,
                None => break false,
            }
        }
    })
    .await;
    assert!(extra.is_err() || !extra.unwrap_or(false));
}

#[tokio::test]
async fn seen_cache_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("node-b.db");

    let group = GroupCipher::from_passphrase("durable").expect("derive");
    let origin = NodeId::generate();
    let msg_id = MsgId::generate();
    let payload = TextPayload {
        body: "once only".into(),
        reply_to: None,
    }
    .to_bytes()
    .expect("payload");
    let aad = Envelope::aad(&msg_id, &origin, &BROADCAST, Kind::Text, 0);
    let (nonce, ciphertext) = group.seal(&payload, &aad).expect("seal");
    let env = Envelope {
        msg_id,
        origin,
        dest: BROADCAST,
        kind: Kind::Text,
        ttl: 3,
        hop: 1,
        seq: 0,
        ts: 1,
        nonce,
        ciphertext,
    };

    // First life: deliver the envelope.
    {
        let fabric = Fabric::new();
        let b = spawn_node_at(&fabric, "b", "durable", &db_path).await;
        let mut b_msg = b.runtime.subscribe(Topic::Message);

        fabric.inject("b", "ghost", env.encode()).await;
        assert_eq!(next_incoming_message(&mut b_msg).await.body, "once only");
        b.runtime.shutdown().await;
    }

    // Second life: the same envelope is a silent duplicate.
    let fabric = Fabric::new();
    let b = spawn_node_at(&fabric, "b", "durable", &db_path).await;
    let mut b_msg = b.runtime.subscribe(Topic::Message);

    fabric.inject("b", "ghost", env.encode()).await;
    settle().await;

    assert_eq!(b.runtime.mesh().counters().duplicates, 1);
    assert_eq!(b.runtime.mesh().counters().delivered, 0);
    let quiet = tokio::time::timeout(Duration::from_millis(300), b_msg.recv()).await;
    assert!(quiet.is_err(), "duplicate must not be delivered again");
}
