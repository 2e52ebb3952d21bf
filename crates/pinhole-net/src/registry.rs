//! Peer registry — the server's id → peer mapping.

use async_trait::async_trait;
use dashmap::DashMap;

use pinhole_core::Peer;

use crate::error::NetError;

/// Storage behind the server's register and establish handlers.
///
/// The default backing is in-process and empties on restart — existing
/// clients are rediscovered when they greet again. The trait exists so
/// alternative backings can be plugged in.
#[async_trait]
pub trait PeerRegistry: Send + Sync {
    /// Upsert the record for `peer.id`.
    async fn create(&self, peer: Peer) -> Result<(), NetError>;

    /// The record for `id`, or [`NetError::PeerNotFound`].
    async fn get(&self, id: &str) -> Result<Peer, NetError>;

    /// All records, in no particular order.
    async fn get_all(&self) -> Result<Vec<Peer>, NetError>;

    /// Remove the record for `id`, or [`NetError::PeerNotFound`].
    async fn remove(&self, id: &str) -> Result<(), NetError>;
}

/// The in-memory registry.
#[derive(Default)]
pub struct MemoryRegistry {
    peers: DashMap<String, Peer>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerRegistry for MemoryRegistry {
    async fn create(&self, peer: Peer) -> Result<(), NetError> {
        self.peers.insert(peer.id.clone(), peer);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Peer, NetError> {
        self.peers
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| NetError::PeerNotFound(id.to_string()))
    }

    async fn get_all(&self) -> Result<Vec<Peer>, NetError> {
        Ok(self.peers.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn remove(&self, id: &str) -> Result<(), NetError> {
        self.peers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| NetError::PeerNotFound(id.to_string()))
    }
}
