//! End-to-end rendezvous scenarios over loopback UDP.
//!
//! A real server and real clients run on 127.0.0.1 with OS-assigned
//! ports, so the full datagram path is exercised without privileges.
//! Connect timeouts are shortened via the builder so failure scenarios
//! finish quickly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use pinhole_core::crypto::Keypair;
use pinhole_core::wire::{route, Message, MAX_DATAGRAM};
use pinhole_net::{Client, NetError, RendezvousServer};

// ── Harness ───────────────────────────────────────────────────────────────────

const RETRY: Duration = Duration::from_millis(100);
const TIMEOUT: Duration = Duration::from_millis(800);

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

struct TestServer {
    server: RendezvousServer,
    addr: SocketAddr,
    private: [u8; 32],
    task: JoinHandle<Result<(), NetError>>,
}

async fn spawn_server() -> TestServer {
    let keypair = Keypair::generate();
    let private = *keypair.private_bytes();
    let server = RendezvousServer::bind(any_addr(), keypair)
        .await
        .expect("server bind failed");
    let addr = server.local_addr().unwrap();
    let task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };
    TestServer {
        server,
        addr,
        private,
        task,
    }
}

async fn spawn_client(id: &str, server_addr: SocketAddr) -> (Client, JoinHandle<Result<(), NetError>>) {
    let client = Client::builder(id, server_addr)
        .connect_timeout(TIMEOUT)
        .connect_retry(RETRY)
        .bind(any_addr())
        .await
        .expect("client bind failed");
    let task = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    client.start().await.expect("greeting send failed");
    (client, task)
}

/// Poll `cond` until it holds or `deadline` passes.
async fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
    let stop = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < stop {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

async fn recv_message(socket: &UdpSocket) -> Option<Message> {
    let mut buf = [0u8; MAX_DATAGRAM];
    match tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(Message::decode(&buf[..len]).expect("undecodable reply")),
        _ => None,
    }
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_peer_greet_and_register() {
    let ts = spawn_server().await;
    let (c1, c1_task) = spawn_client("c1", ts.addr).await;

    c1.wait_registered().await.expect("registration timed out");

    // The registry holds c1 under the source address of its register
    // datagram, which on loopback is the client's bound address.
    let record = ts.server.registry().get("c1").await.unwrap();
    assert_eq!(record.addr, Some(c1.local_addr().unwrap()));
    assert_eq!(record.public_key, c1.me().public_key);

    // Both ends of the server link derived the same secret.
    let expected = Keypair::from_private(ts.private)
        .shared_secret(&c1.me().public_key)
        .unwrap();
    assert_eq!(c1.server_secret(), Some(expected));
    let server_side = ts
        .server
        .connection(c1.local_addr().unwrap())
        .expect("server has no connection for c1");
    assert_eq!(server_side.secret(), Some(expected));

    c1.shutdown();
    ts.server.shutdown();
    c1_task.await.unwrap().unwrap();
    ts.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn two_peer_rendezvous_and_key_exchange() {
    let ts = spawn_server().await;
    let (c1, c1_task) = spawn_client("c1", ts.addr).await;
    let (c2, c2_task) = spawn_client("c2", ts.addr).await;

    c1.wait_registered().await.unwrap();
    c2.wait_registered().await.unwrap();

    c1.connect("c2").await.expect("punch failed");

    // c2 was introduced by the server and punched from its side too.
    assert!(
        wait_until(Duration::from_secs(2), || {
            c1.key_sent("c2")
                && c1.key_received("c2")
                && c2.key_sent("c1")
                && c2.key_received("c1")
        })
        .await,
        "terminal state not reached"
    );

    // Both clients received each other's record and created a direct
    // connection to the advertised address.
    assert_eq!(
        c1.peer("c2").unwrap().addr,
        Some(c2.local_addr().unwrap())
    );
    assert_eq!(
        c2.peer("c1").unwrap().addr,
        Some(c1.local_addr().unwrap())
    );

    // The per-peer secrets agree.
    let s12 = c1.peer_secret("c2").expect("c1 has no secret for c2");
    let s21 = c2.peer_secret("c1").expect("c2 has no secret for c1");
    assert_eq!(s12, s21);
    assert_ne!(s12, [0u8; 32]);

    c1.shutdown();
    c2.shutdown();
    ts.server.shutdown();
    c1_task.await.unwrap().unwrap();
    c2_task.await.unwrap().unwrap();
    ts.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn connected_hook_fires_on_success() {
    let ts = spawn_server().await;

    let connected = Arc::new(AtomicBool::new(false));
    let connecting = Arc::new(AtomicBool::new(false));
    let c1 = {
        let connected = connected.clone();
        let connecting = connecting.clone();
        Client::builder("c1", ts.addr)
            .connect_timeout(TIMEOUT)
            .connect_retry(RETRY)
            .on_connecting(move |_| connecting.store(true, Ordering::SeqCst))
            .on_connected(move |_| connected.store(true, Ordering::SeqCst))
            .bind(any_addr())
            .await
            .unwrap()
    };
    let c1_task = {
        let c1 = c1.clone();
        tokio::spawn(async move { c1.run().await })
    };
    c1.start().await.unwrap();

    let (c2, c2_task) = spawn_client("c2", ts.addr).await;
    c1.wait_registered().await.unwrap();
    c2.wait_registered().await.unwrap();

    c1.connect("c2").await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || connected.load(Ordering::SeqCst)).await,
        "connected hook never fired"
    );
    assert!(connecting.load(Ordering::SeqCst));

    c1.shutdown();
    c2.shutdown();
    ts.server.shutdown();
    c1_task.await.unwrap().unwrap();
    c2_task.await.unwrap().unwrap();
    ts.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn connect_times_out_against_silent_peer() {
    let ts = spawn_server().await;

    // A peer that registers and then never answers a connect datagram.
    let silent = UdpSocket::bind(any_addr()).await.unwrap();
    let mut register = Message::new(route::REGISTER);
    register.peer_id = "c2".to_string();
    silent
        .send_to(&register.encode().unwrap(), ts.addr)
        .await
        .unwrap();
    let ack = recv_message(&silent).await.expect("no register ack");
    assert_eq!(ack.path, route::REGISTER);
    assert!(!ack.is_error());

    let connected = Arc::new(AtomicBool::new(false));
    let c1 = {
        let connected = connected.clone();
        Client::builder("c1", ts.addr)
            .connect_timeout(TIMEOUT)
            .connect_retry(RETRY)
            .on_connected(move |_| connected.store(true, Ordering::SeqCst))
            .bind(any_addr())
            .await
            .unwrap()
    };
    let c1_task = {
        let c1 = c1.clone();
        tokio::spawn(async move { c1.run().await })
    };
    c1.start().await.unwrap();
    c1.wait_registered().await.unwrap();

    let err = c1.connect("c2").await.expect_err("connect should time out");
    assert!(matches!(err, NetError::ConnectTimeout));
    assert!(!connected.load(Ordering::SeqCst), "connected hook fired on timeout");
    assert!(!c1.key_received("c2"));

    c1.shutdown();
    ts.server.shutdown();
    c1_task.await.unwrap().unwrap();
    ts.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_path_is_silently_dropped() {
    let ts = spawn_server().await;

    let probe = UdpSocket::bind(any_addr()).await.unwrap();
    probe
        .send_to(&Message::new("xyz").encode().unwrap(), ts.addr)
        .await
        .unwrap();

    // No reply within a comfortable window.
    let mut buf = [0u8; MAX_DATAGRAM];
    let reply = tokio::time::timeout(Duration::from_millis(300), probe.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "unknown path produced a reply");

    // No state change, and the server still works.
    assert!(ts.server.registry().get_all().await.unwrap().is_empty());
    let mut register = Message::new(route::REGISTER);
    register.peer_id = "c1".to_string();
    probe
        .send_to(&register.encode().unwrap(), ts.addr)
        .await
        .unwrap();
    let ack = recv_message(&probe).await.expect("server stopped responding");
    assert_eq!(ack.path, route::REGISTER);

    ts.server.shutdown();
    ts.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn establish_against_missing_peer_is_an_error_reply() {
    let ts = spawn_server().await;

    // Wire-level: a registered raw peer asks for a ghost and sees the
    // error reply directly.
    let probe = UdpSocket::bind(any_addr()).await.unwrap();
    let mut register = Message::new(route::REGISTER);
    register.peer_id = "raw".to_string();
    probe
        .send_to(&register.encode().unwrap(), ts.addr)
        .await
        .unwrap();
    recv_message(&probe).await.expect("no register ack");

    let mut establish = Message::new(route::ESTABLISH);
    establish.peer_id = "raw".to_string();
    establish.body = b"ghost".to_vec();
    probe
        .send_to(&establish.encode().unwrap(), ts.addr)
        .await
        .unwrap();

    let reply = recv_message(&probe).await.expect("no establish reply");
    assert_eq!(reply.path, route::ESTABLISH);
    assert!(reply.is_error());
    assert!(
        reply.error.contains("ghost"),
        "unexpected error text: {}",
        reply.error
    );

    // Client-level: connect to a ghost fails and leaves no peer state.
    let (c1, c1_task) = spawn_client("c1", ts.addr).await;
    c1.wait_registered().await.unwrap();
    assert!(c1.connect("ghost").await.is_err());
    assert!(c1.peer("ghost").is_none());
    assert!(c1.peer_connection("ghost").is_none());

    c1.shutdown();
    ts.server.shutdown();
    c1_task.await.unwrap().unwrap();
    ts.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn oversized_datagram_gets_a_decode_error_reply() {
    let ts = spawn_server().await;

    let probe = UdpSocket::bind(any_addr()).await.unwrap();
    let mut big = Message::new(route::GREETING);
    big.body = vec![0xab; 2 * MAX_DATAGRAM];
    let bytes = big.encode().unwrap();
    assert!(bytes.len() > MAX_DATAGRAM);
    probe.send_to(&bytes, ts.addr).await.unwrap();

    let reply = recv_message(&probe).await.expect("no error reply");
    assert!(reply.is_error());
    assert!(
        reply.error.contains("cannot parse"),
        "unexpected error text: {}",
        reply.error
    );

    // The server survived.
    let mut register = Message::new(route::REGISTER);
    register.peer_id = "c1".to_string();
    probe
        .send_to(&register.encode().unwrap(), ts.addr)
        .await
        .unwrap();
    assert!(recv_message(&probe).await.is_some());

    ts.server.shutdown();
    ts.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn repeated_greeting_rekeys_deterministically() {
    let ts = spawn_server().await;
    let (c1, c1_task) = spawn_client("c1", ts.addr).await;
    c1.wait_registered().await.unwrap();

    let first = c1.server_secret().expect("no secret after first greet");

    // Greet again: same static keys, same source address — the server
    // replaces the secret with the same value and registration repeats.
    c1.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(c1.server_secret(), Some(first));
    let record = ts.server.registry().get("c1").await.unwrap();
    assert_eq!(record.addr, Some(c1.local_addr().unwrap()));

    c1.shutdown();
    ts.server.shutdown();
    c1_task.await.unwrap().unwrap();
    ts.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_completes_run() {
    let ts = spawn_server().await;
    let (c1, c1_task) = spawn_client("c1", ts.addr).await;
    c1.wait_registered().await.unwrap();

    // Shut down while the process is mid-conversation; both runs return.
    c1.shutdown();
    ts.server.shutdown();
    c1_task.await.unwrap().unwrap();
    ts.task.await.unwrap().unwrap();
}
