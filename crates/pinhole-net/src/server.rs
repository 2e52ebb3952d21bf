//! The rendezvous server role.
//!
//! A single publicly reachable endpoint that accepts greetings, registers
//! peers under their observed external addresses, and on request brokers
//! an introduction between two registered peers. The server never relays
//! data traffic — its job ends once both peers know each other's
//! addresses.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use pinhole_core::crypto::{self, Keypair};
use pinhole_core::wire::{route, Message};
use pinhole_core::Peer;

use crate::connection::Connection;
use crate::dispatch::Dispatcher;
use crate::error::NetError;
use crate::handler::MessageHandler;
use crate::registry::{MemoryRegistry, PeerRegistry};

/// The rendezvous server. Cheap to clone.
#[derive(Clone)]
pub struct RendezvousServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<dyn PeerRegistry>,
    keypair: Arc<Keypair>,
}

impl RendezvousServer {
    /// Bind `addr` with a fresh in-memory registry.
    pub async fn bind(addr: SocketAddr, keypair: Keypair) -> Result<Self, NetError> {
        Self::with_registry(addr, keypair, Arc::new(MemoryRegistry::new())).await
    }

    /// Bind `addr` with an alternative registry backing.
    pub async fn with_registry(
        addr: SocketAddr,
        keypair: Keypair,
        registry: Arc<dyn PeerRegistry>,
    ) -> Result<Self, NetError> {
        let dispatcher = Dispatcher::bind(addr).await?;
        let keypair = Arc::new(keypair);

        let routes: Arc<dyn MessageHandler> = Arc::new(ServerRoutes {
            registry: registry.clone(),
            keypair: keypair.clone(),
            dispatcher: Arc::downgrade(&dispatcher),
        });
        for path in [route::GREETING, route::REGISTER, route::ESTABLISH] {
            dispatcher.handle(path, routes.clone());
        }

        Ok(Self {
            inner: Arc::new(ServerInner {
                dispatcher,
                registry,
                keypair,
            }),
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.inner.dispatcher.local_addr()
    }

    /// The server's X25519 public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.inner.keypair.public
    }

    /// The peer registry behind the register and establish handlers.
    pub fn registry(&self) -> &Arc<dyn PeerRegistry> {
        &self.inner.registry
    }

    /// Register `addr` in the connection table and return its connection.
    pub fn create_connection(&self, addr: SocketAddr) -> Connection {
        self.inner.dispatcher.connection(addr)
    }

    /// The connection for `addr`, if one exists.
    pub fn connection(&self, addr: SocketAddr) -> Option<Connection> {
        self.inner.dispatcher.get_connection(addr)
    }

    /// Register an application handler on the shared socket.
    pub fn handle(&self, path: &str, handler: Arc<dyn MessageHandler>) {
        self.inner.dispatcher.handle(path, handler);
    }

    /// Run the socket loops until [`RendezvousServer::shutdown`].
    pub async fn run(&self) -> Result<(), NetError> {
        self.inner.dispatcher.clone().run().await
    }

    /// Signal shutdown; in-flight handlers complete before `run` returns.
    pub fn shutdown(&self) {
        self.inner.dispatcher.shutdown();
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

struct ServerRoutes {
    registry: Arc<dyn PeerRegistry>,
    keypair: Arc<Keypair>,
    dispatcher: Weak<Dispatcher>,
}

#[async_trait]
impl MessageHandler for ServerRoutes {
    async fn handle(&self, conn: &Connection, msg: Message) -> Result<Option<Message>, NetError> {
        // A message that already carries an error is a reply; propagate
        // instead of acting on it.
        if let Some(err) = msg.error_text() {
            return Err(NetError::Remote(err.to_string()));
        }
        match msg.path.as_str() {
            route::GREETING => self.on_greeting(conn, msg).await,
            route::REGISTER => self.on_register(conn, msg).await,
            route::ESTABLISH => self.on_establish(conn, msg).await,
            _ => Ok(None),
        }
    }
}

impl ServerRoutes {
    /// Exchange public keys with a client and bind the link secret.
    ///
    /// A repeated greeting from the same source address recomputes and
    /// replaces the secret (rekey); a different source address lands on
    /// a different connection.
    async fn on_greeting(
        &self,
        conn: &Connection,
        msg: Message,
    ) -> Result<Option<Message>, NetError> {
        let client_public = crypto::decode_key(&msg.body)?;
        let secret = self.keypair.shared_secret(&client_public)?;
        conn.set_secret(secret);
        tracing::debug!(client = %conn.addr(), "client greeted, link secret bound");

        let mut reply = Message::new(route::GREETING);
        reply.body = crypto::encode_key(&self.keypair.public).into_bytes();
        Ok(Some(reply))
    }

    /// Record the client under the source address of this very datagram.
    async fn on_register(
        &self,
        conn: &Connection,
        msg: Message,
    ) -> Result<Option<Message>, NetError> {
        if msg.peer_id.is_empty() {
            return Err(NetError::Protocol("register without a peer id"));
        }

        let public_key = if msg.body.is_empty() {
            Vec::new()
        } else {
            crypto::decode_key(&msg.body)?.to_vec()
        };

        self.registry
            .create(Peer {
                id: msg.peer_id.clone(),
                public_key,
                addr: Some(conn.addr()),
            })
            .await?;
        tracing::info!(id = %msg.peer_id, addr = %conn.addr(), "peer registered");

        Ok(Some(Message::new(route::REGISTER)))
    }

    /// Introduce the requester and the target to each other. Both
    /// messages are queued before this handler returns.
    async fn on_establish(
        &self,
        _conn: &Connection,
        msg: Message,
    ) -> Result<Option<Message>, NetError> {
        let requester = self.registry.get(&msg.peer_id).await?;

        let target_id = std::str::from_utf8(&msg.body)
            .map_err(|_| NetError::Protocol("establish body is not text"))?;
        let target = self.registry.get(target_id).await?;
        let target_addr = target
            .addr
            .ok_or_else(|| NetError::PeerAddrMissing(target.id.clone()))?;

        let dispatcher = self.dispatcher.upgrade().ok_or(NetError::Terminated)?;
        let target_conn = dispatcher
            .get_connection(target_addr)
            .ok_or_else(|| NetError::PeerConnectionNotFound(target.id.clone()))?;

        let mut intro = Message::new(route::ESTABLISH);
        intro.body = requester.encode()?;
        target_conn.send(intro).await?;

        tracing::info!(requester = %requester.id, target = %target.id, "introduction brokered");

        let mut reply = Message::new(route::ESTABLISH);
        reply.body = target.encode()?;
        Ok(Some(reply))
    }
}
