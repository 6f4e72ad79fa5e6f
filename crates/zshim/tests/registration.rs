//! End-to-end registration scenarios, driven from the proxy's side of the
//! socket.

use std::fs::File;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use zshim::protocol::messages::{self, Ack, AddWorkload, Hello, WireMessage};
use zshim::protocol::transport::PacketStream;
use zshim::{ShimConfig, start};

async fn peer_send(stream: &PacketStream, msg: &WireMessage) {
    stream.send(&messages::encode(msg).unwrap()).await.unwrap();
}

async fn peer_recv(stream: &PacketStream) -> WireMessage {
    let mut buf = [0u8; 4096];
    let n = stream.recv(&mut buf).await.unwrap();
    assert_ne!(n, 0, "shim closed the connection unexpectedly");
    messages::decode(&buf[..n]).unwrap()
}

async fn peer_recv_registration(stream: &PacketStream) -> (AddWorkload, OwnedFd) {
    let mut buf = [0u8; 4096];
    let (n, fd) = stream.recv_with_fd(&mut buf).await.unwrap();
    assert_ne!(n, 0, "shim closed the connection unexpectedly");
    let msg = messages::decode(&buf[..n]).unwrap();
    let WireMessage::AddWorkload(add) = msg else {
        panic!("expected add_workload, got {}", msg.kind());
    };
    (add, fd.expect("registration arrived without its descriptor"))
}

async fn expect_closed(stream: &PacketStream) {
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(1), stream.recv(&mut buf))
        .await
        .expect("timed out waiting for the shim to close the connection")
        .unwrap();
    assert_eq!(n, 0);
}

fn namespace_stand_in(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn single_workload_registration_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let socket_path = tmp.path().join("shim.sock");
    let target = namespace_stand_in(tmp.path(), "ns-net", "netns-1234");
    let cancel = CancellationToken::new();

    let handle = start(
        ShimConfig::new(&socket_path),
        vec![target],
        cancel.clone(),
    )
    .unwrap();

    let peer = PacketStream::connect(&socket_path).await.unwrap();
    peer_send(&peer, &Hello { version: 1 }.into()).await;
    assert!(matches!(peer_recv(&peer).await, WireMessage::SnapshotSent(_)));
    peer_send(&peer, &Ack {}.into()).await;

    let (add, fd) = peer_recv_registration(&peer).await;
    assert!(add.uid.starts_with("workload-"));
    assert_eq!(add.workload_info.name, add.uid);
    assert_eq!(add.workload_info.namespace, add.uid);
    assert_eq!(add.workload_info.service_account, add.uid);

    // The received descriptor references the namespace the shim opened.
    let mut contents = String::new();
    File::from(fd).read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "netns-1234");

    peer_send(&peer, &Ack {}.into()).await;
    expect_closed(&peer).await;

    // The listener is back at accept: a second session starts from hello
    // with a fresh snapshot.
    let peer = PacketStream::connect(&socket_path).await.unwrap();
    peer_send(&peer, &Hello { version: 1 }.into()).await;
    assert!(matches!(peer_recv(&peer).await, WireMessage::SnapshotSent(_)));
    drop(peer);

    cancel.cancel();
    timeout(Duration::from_secs(1), handle.wait())
        .await
        .expect("shutdown timed out");
}

#[tokio::test]
async fn multiple_workloads_register_in_order() {
    let tmp = TempDir::new().unwrap();
    let socket_path = tmp.path().join("shim.sock");
    let targets = vec![
        namespace_stand_in(tmp.path(), "ns-a", "first"),
        namespace_stand_in(tmp.path(), "ns-b", "second"),
    ];
    let cancel = CancellationToken::new();

    let handle = start(ShimConfig::new(&socket_path), targets, cancel.clone()).unwrap();

    let peer = PacketStream::connect(&socket_path).await.unwrap();
    peer_send(&peer, &Hello { version: 1 }.into()).await;
    assert!(matches!(peer_recv(&peer).await, WireMessage::SnapshotSent(_)));
    peer_send(&peer, &Ack {}.into()).await;

    // Registrations arrive in target order, one ack each.
    for expected in ["first", "second"] {
        let (_add, fd) = peer_recv_registration(&peer).await;
        let mut contents = String::new();
        File::from(fd).read_to_string(&mut contents).unwrap();
        assert_eq!(contents, expected);
        peer_send(&peer, &Ack {}.into()).await;
    }

    expect_closed(&peer).await;

    cancel.cancel();
    timeout(Duration::from_secs(1), handle.wait())
        .await
        .expect("shutdown timed out");
}

#[tokio::test]
async fn empty_target_list_reaches_done_after_snapshot() {
    let tmp = TempDir::new().unwrap();
    let socket_path = tmp.path().join("shim.sock");
    let cancel = CancellationToken::new();

    let handle = start(ShimConfig::new(&socket_path), Vec::new(), cancel.clone()).unwrap();

    let peer = PacketStream::connect(&socket_path).await.unwrap();
    peer_send(&peer, &Hello { version: 1 }.into()).await;
    assert!(matches!(peer_recv(&peer).await, WireMessage::SnapshotSent(_)));
    peer_send(&peer, &Ack {}.into()).await;

    // Zero per-target iterations: the session is done and the connection
    // closes without any registration.
    expect_closed(&peer).await;

    cancel.cancel();
    timeout(Duration::from_secs(1), handle.wait())
        .await
        .expect("shutdown timed out");
}

#[tokio::test]
async fn version_mismatch_closes_without_snapshot() {
    let tmp = TempDir::new().unwrap();
    let socket_path = tmp.path().join("shim.sock");
    let target = namespace_stand_in(tmp.path(), "ns-net", "netns");
    let cancel = CancellationToken::new();

    let handle = start(
        ShimConfig::new(&socket_path),
        vec![target],
        cancel.clone(),
    )
    .unwrap();

    let peer = PacketStream::connect(&socket_path).await.unwrap();
    peer_send(&peer, &Hello { version: 2 }.into()).await;

    // The session aborts before a snapshot is ever sent.
    expect_closed(&peer).await;

    cancel.cancel();
    timeout(Duration::from_secs(1), handle.wait())
        .await
        .expect("shutdown timed out");
}

#[tokio::test]
async fn restart_rebinds_the_same_path() {
    let tmp = TempDir::new().unwrap();
    let socket_path = tmp.path().join("shim.sock");

    for _ in 0..2 {
        let cancel = CancellationToken::new();
        let handle =
            start(ShimConfig::new(&socket_path), Vec::new(), cancel.clone()).unwrap();

        let peer = PacketStream::connect(&socket_path).await.unwrap();
        peer_send(&peer, &Hello { version: 1 }.into()).await;
        assert!(matches!(peer_recv(&peer).await, WireMessage::SnapshotSent(_)));
        drop(peer);

        cancel.cancel();
        timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("shutdown timed out");
    }
}
