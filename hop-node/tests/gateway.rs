//! Gateway sync round trips against the in-memory directory.

use std::sync::Arc;
use std::time::Duration;

use hop_core::{Message, PeerAddress};
use hop_node::transport::MemoryNetwork;
use hop_node::{spawn, DirectoryService, MemoryDirectory, NodeConfig, NodeHandle};

const WAIT: Duration = Duration::from_secs(3);

fn config(username: &str) -> NodeConfig {
    NodeConfig {
        username: username.to_string(),
        auto_connect: false,
        ..NodeConfig::default()
    }
}

fn remote(id: &str, sender: &str, receiver: &str, ts: u64) -> Message {
    let mut m = Message::new(sender, receiver, format!("via directory {id}"), ts);
    m.id = id.to_string();
    m
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn stored(node: &NodeHandle, id: &str) -> Vec<Message> {
    node.messages()
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.id == id)
        .collect()
}

#[tokio::test]
async fn offline_node_syncs_when_reachable() {
    let net = MemoryNetwork::new();
    let dir = MemoryDirectory::new();
    let a = spawn(
        Arc::new(net.join("A").await),
        config("alice"),
        Some(Arc::new(dir.clone()) as Arc<dyn DirectoryService>),
    );

    // Offline: nothing to flood to, the message stays cached.
    let out = a.send("bob", "store and forward").await.unwrap();
    dir.insert(remote("s1", "bob", "alice", 5)).await;
    assert!(dir.uploaded_ids().await.is_empty());

    let mut inbox = a.subscribe_messages();
    a.set_internet_reachable(true).await.unwrap();

    let pulled = tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(pulled.id, "s1");

    eventually(|| {
        let dir = dir.clone();
        let id = out.id.clone();
        async move { dir.uploaded_ids().await.contains(&id) }
    })
    .await;
    eventually(|| {
        let dir = dir.clone();
        async move { dir.marked_ids().await == vec!["s1".to_string()] }
    })
    .await;
    eventually(|| {
        let a = a.clone();
        async move { stored(&a, "s1").await.first().map(|m| m.delivered) == Some(true) }
    })
    .await;
    assert_eq!(stored(&a, "s1").await.len(), 1);

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn mesh_copy_is_confirmed_without_redelivery() {
    let net = MemoryNetwork::new();
    let dir = MemoryDirectory::new();
    let a = spawn(
        Arc::new(net.join("A").await),
        config("alice"),
        Some(Arc::new(dir.clone()) as Arc<dyn DirectoryService>),
    );
    let b = spawn(Arc::new(net.join("B").await), config("bob"), None);
    b.connect(PeerAddress::from("A")).await.unwrap();
    let mut inbox = a.subscribe_messages();

    tokio::time::timeout(WAIT, async {
        while b.open_peers().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Same message reaches A over the mesh and later through the directory.
    let sent = b.send("alice", "both paths").await.unwrap();
    assert_eq!(tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap().id, sent.id);
    dir.insert(sent.clone()).await;

    a.set_internet_reachable(true).await.unwrap();
    eventually(|| {
        let dir = dir.clone();
        let id = sent.id.clone();
        async move { dir.marked_ids().await.contains(&id) }
    })
    .await;
    assert_eq!(stored(&a, &sent.id).await.len(), 1);
    assert!(inbox.try_recv().is_err());
}

#[tokio::test]
async fn unreachable_stops_pulling() {
    let net = MemoryNetwork::new();
    let dir = MemoryDirectory::new();
    let a = spawn(
        Arc::new(net.join("A").await),
        config("alice"),
        Some(Arc::new(dir.clone()) as Arc<dyn DirectoryService>),
    );
    a.set_internet_reachable(true).await.unwrap();
    a.set_internet_reachable(false).await.unwrap();
    // Round-trip through the coordinator so both signals are applied.
    a.messages().await.unwrap();

    dir.insert(remote("late", "bob", "alice", 1)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stored(&a, "late").await.is_empty());

    a.set_internet_reachable(true).await.unwrap();
    eventually(|| {
        let a = a.clone();
        async move { stored(&a, "late").await.len() == 1 }
    })
    .await;
}

#[tokio::test]
async fn directory_failure_does_not_block_relay() {
    let net = MemoryNetwork::new();
    let dir = MemoryDirectory::new();
    dir.set_failing(true).await;
    let a = spawn(
        Arc::new(net.join("A").await),
        config("alice"),
        Some(Arc::new(dir.clone()) as Arc<dyn DirectoryService>),
    );
    let b = spawn(Arc::new(net.join("B").await), config("bob"), None);
    a.set_internet_reachable(true).await.unwrap();
    a.send("bob", "queued").await.unwrap();

    let mut inbox = b.subscribe_messages();
    a.connect(PeerAddress::from("B")).await.unwrap();
    tokio::time::timeout(WAIT, async {
        while a.open_peers().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let live = a.send("bob", "live").await.unwrap();
    assert_eq!(tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap().id, live.id);
    assert!(dir.uploaded_ids().await.is_empty());
}
