//! Socket and group backends over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use hop_core::PeerAddress;
use hop_node::transport::{GroupTransport, SocketTransport};
use hop_node::{spawn, NodeConfig, NodeHandle};

const WAIT: Duration = Duration::from_secs(5);

fn config(username: &str) -> NodeConfig {
    NodeConfig {
        username: username.to_string(),
        auto_connect: true,
        discovery_window: Duration::from_millis(200),
        ..NodeConfig::default()
    }
}

async fn wait_open(node: &NodeHandle, count: usize) {
    tokio::time::timeout(WAIT, async {
        while node.open_peers().await.unwrap().len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peers did not open");
}

#[tokio::test]
async fn socket_nodes_exchange_over_tcp() {
    let a = SocketTransport::bind(PeerAddress::from("node-a"), "127.0.0.1:0".parse().unwrap(), 0)
        .await
        .unwrap();
    let b = SocketTransport::bind(PeerAddress::from("node-b"), "127.0.0.1:0".parse().unwrap(), 0)
        .await
        .unwrap();
    a.add_peer_addr(PeerAddress::from("node-b"), b.listen_addr().unwrap()).await;

    let a = spawn(Arc::new(a), config("alice"), None);
    let b = spawn(Arc::new(b), config("bob"), None);
    let mut inbox = b.subscribe_messages();

    a.connect(PeerAddress::from("node-b")).await.unwrap();
    wait_open(&a, 1).await;
    wait_open(&b, 1).await;

    let sent = a.send("bob", "over tcp").await.unwrap();
    let got = tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(got.id, sent.id);

    a.shutdown().await.unwrap();
    wait_open(&b, 0).await;
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn group_member_joins_owner_through_discovery() {
    let owner = GroupTransport::owner(PeerAddress::from("owner"), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let endpoint = owner.listen_addr().unwrap();
    let owner = spawn(Arc::new(owner), config("olivia"), None);
    let member = spawn(
        Arc::new(GroupTransport::member(PeerAddress::from("member"), endpoint)),
        config("mark"),
        None,
    );

    member.start_discovery().await.unwrap();
    wait_open(&member, 1).await;
    wait_open(&owner, 1).await;
    assert_eq!(member.open_peers().await.unwrap(), vec![PeerAddress::from("owner")]);

    let mut inbox = member.subscribe_messages();
    let sent = owner.send("mark", "welcome").await.unwrap();
    let got = tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(got.id, sent.id);
}
