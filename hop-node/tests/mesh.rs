//! Multi-node relay scenarios over the in-process transport.

use std::sync::Arc;
use std::time::Duration;

use hop_core::{ConnectionState, Message, PeerAddress};
use hop_node::transport::{MemoryNetwork, Transport};
use hop_node::{spawn, NodeConfig, NodeHandle};

const WAIT: Duration = Duration::from_secs(3);

fn config(username: &str) -> NodeConfig {
    NodeConfig {
        username: username.to_string(),
        auto_connect: false,
        ..NodeConfig::default()
    }
}

async fn node(net: &MemoryNetwork, address: &str, username: &str) -> NodeHandle {
    spawn(Arc::new(net.join(address).await), config(username), None)
}

async fn wait_open(node: &NodeHandle, count: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            if node.open_peers().await.unwrap().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peers did not open");
}

async fn next_message(rx: &mut tokio::sync::broadcast::Receiver<Message>) -> Message {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no message")
        .expect("broadcast closed")
}

#[tokio::test]
async fn two_hop_relay_delivers_once() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let net = MemoryNetwork::new();
    let x = node(&net, "X", "x").await;
    let y = node(&net, "Y", "y").await;
    let z = node(&net, "Z", "z").await;

    x.connect(PeerAddress::from("Y")).await.unwrap();
    z.connect(PeerAddress::from("Y")).await.unwrap();
    wait_open(&y, 2).await;
    wait_open(&x, 1).await;
    wait_open(&z, 1).await;

    let mut z_inbox = z.subscribe_messages();
    let sent = x.send("z", "over two hops").await.unwrap();
    let got = next_message(&mut z_inbox).await;
    assert_eq!(got.id, sent.id);
    assert_eq!(got.content, "over two hops");

    // Let the flood settle, then check each store.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(z.messages().await.unwrap().len(), 1);
    assert!(y.messages().await.unwrap().is_empty());
    assert_eq!(x.messages().await.unwrap().len(), 1);

    for n in [&x, &y, &z] {
        n.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn diamond_duplicate_is_suppressed() {
    // X -> {A, B} -> Z: Z hears m1 from both neighbors.
    let net = MemoryNetwork::new();
    let x = node(&net, "X", "x").await;
    let a = node(&net, "A", "a").await;
    let b = node(&net, "B", "b").await;
    let z = node(&net, "Z", "z").await;

    x.connect(PeerAddress::from("A")).await.unwrap();
    x.connect(PeerAddress::from("B")).await.unwrap();
    z.connect(PeerAddress::from("A")).await.unwrap();
    z.connect(PeerAddress::from("B")).await.unwrap();
    wait_open(&x, 2).await;
    wait_open(&z, 2).await;

    let mut z_inbox = z.subscribe_messages();
    let sent = x.send("z", "diamond").await.unwrap();
    assert_eq!(next_message(&mut z_inbox).await.id, sent.id);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(z_inbox.try_recv().is_err());
    assert_eq!(z.messages().await.unwrap().len(), 1);
}

#[tokio::test]
async fn bare_message_frame_is_delivered_directly() {
    let net = MemoryNetwork::new();
    let a = node(&net, "A", "alice").await;
    let b = node(&net, "B", "bob").await;
    a.connect(PeerAddress::from("B")).await.unwrap();
    wait_open(&a, 1).await;

    let mut inbox = b.subscribe_messages();
    let m = Message::new("alice", "bob", "direct", 1);
    a.send_direct(&PeerAddress::from("B"), m.clone()).await.unwrap();
    assert_eq!(next_message(&mut inbox).await, m);
    // A bare frame is not relayed, so A does not get it back.
    assert!(a.messages().await.unwrap().is_empty());
}

#[tokio::test]
async fn stalled_peer_is_torn_down_alone() {
    let net = MemoryNetwork::new();
    let a = spawn(
        Arc::new(net.join("A").await),
        NodeConfig {
            write_timeout: Duration::from_millis(150),
            ..config("alice")
        },
        None,
    );
    let b = node(&net, "B", "bob").await;
    // R completes the handshake but never reads.
    let r = net.join("R").await;

    a.connect(PeerAddress::from("B")).await.unwrap();
    a.connect(PeerAddress::from("R")).await.unwrap();
    let _stalled = r.accept().await.unwrap();
    wait_open(&a, 2).await;

    let mut inbox = b.subscribe_messages();
    let big = "x".repeat(200 * 1024);
    a.send("bob", &big).await.unwrap();
    assert_eq!(next_message(&mut inbox).await.content.len(), big.len());

    wait_open(&a, 1).await;
    assert_eq!(a.open_peers().await.unwrap(), vec![PeerAddress::from("B")]);
    assert_eq!(a.connection_state(), ConnectionState::Connected);
}
