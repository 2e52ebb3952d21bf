//! Per-peer handshake state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::Notify;

use pinhole_core::Peer;

use crate::connection::Connection;

/// Tracks key-exchange progress against every remote peer this process
/// interacts with, keyed by peer id.
///
/// Flags flip atomically and the peer record and connection publish
/// exactly once, so handler tasks for different peers and the connect
/// routine can share entries freely. `key_received` implies the peer
/// connection carries a bound secret — the key handler binds the secret
/// before flipping the flag.
#[derive(Default)]
pub struct HandshakeTracker {
    peers: DashMap<String, Arc<PeerHandshake>>,
}

impl HandshakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for `id`, created on first use.
    pub fn entry(&self, id: &str) -> Arc<PeerHandshake> {
        self.peers.entry(id.to_string()).or_default().clone()
    }

    /// The entry for `id`, if the peer has been seen.
    pub fn get(&self, id: &str) -> Option<Arc<PeerHandshake>> {
        self.peers.get(id).map(|entry| entry.clone())
    }
}

/// Handshake state for one remote peer id.
#[derive(Default)]
pub struct PeerHandshake {
    key_sent: AtomicBool,
    key_received: AtomicBool,
    /// Guards against spawning the punch routine twice for one peer.
    punching: AtomicBool,
    peer: OnceLock<Peer>,
    conn: OnceLock<Connection>,
    established: Notify,
    key_ready: Notify,
}

impl PeerHandshake {
    pub fn key_sent(&self) -> bool {
        self.key_sent.load(Ordering::Acquire)
    }

    pub fn set_key_sent(&self) {
        self.key_sent.store(true, Ordering::Release);
    }

    pub fn key_received(&self) -> bool {
        self.key_received.load(Ordering::Acquire)
    }

    /// Flip `key_received` and wake anything waiting in [`wait_key`].
    ///
    /// The caller must have bound the peer secret first.
    ///
    /// [`wait_key`]: PeerHandshake::wait_key
    pub fn set_key_received(&self) {
        self.key_received.store(true, Ordering::Release);
        self.key_ready.notify_waiters();
    }

    /// Publish the peer record and its connection. First write wins.
    pub fn publish(&self, peer: Peer, conn: Connection) {
        let _ = self.peer.set(peer);
        let _ = self.conn.set(conn);
        self.established.notify_waiters();
    }

    /// Claim the punch routine for this peer. Only the first caller gets
    /// `true`.
    pub fn begin_punch(&self) -> bool {
        !self.punching.swap(true, Ordering::AcqRel)
    }

    pub fn peer(&self) -> Option<&Peer> {
        self.peer.get()
    }

    pub fn conn(&self) -> Option<Connection> {
        self.conn.get().cloned()
    }

    /// Wait until the introduction has published the peer record and its
    /// connection.
    pub async fn wait_established(&self) {
        loop {
            let notified = self.established.notified();
            if self.peer.get().is_some() && self.conn.get().is_some() {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the key handler has bound the peer secret.
    pub async fn wait_key(&self) {
        loop {
            let notified = self.key_ready.notified();
            if self.key_received() {
                return;
            }
            notified.await;
        }
    }
}
