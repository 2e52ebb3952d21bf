//! The client role — drives the five-path rendezvous sequence.
//!
//! Startup sends a greeting to the rendezvous server; the reply chain
//! (greeting → register → registered) runs entirely inside handlers.
//! [`Client::connect`] then asks the server for an introduction and waits
//! until the punch routine — spawned by the establish handler on both
//! sides — has exchanged keys directly with the peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use pinhole_core::crypto::{self, Keypair};
use pinhole_core::wire::{route, Message, CONNECT_RETRY_INTERVAL, CONNECT_TIMEOUT};
use pinhole_core::Peer;

use crate::connection::Connection;
use crate::dispatch::Dispatcher;
use crate::error::NetError;
use crate::handler::MessageHandler;
use crate::tracker::{HandshakeTracker, PeerHandshake};

/// Observability hook; receives the peer id the state change concerns.
type Hook = Box<dyn Fn(&str) + Send + Sync>;

struct Hooks {
    registered: Hook,
    connecting: Hook,
    connected: Hook,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            registered: Box::new(|_| {}),
            connecting: Box::new(|_| {}),
            connected: Box::new(|_| {}),
        }
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Configures and binds a [`Client`].
pub struct ClientBuilder {
    id: String,
    server_addr: SocketAddr,
    keypair: Option<Keypair>,
    connect_timeout: Duration,
    connect_retry: Duration,
    hooks: Hooks,
}

impl ClientBuilder {
    /// Use this keypair instead of generating a fresh one.
    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Wall-clock deadline for [`Client::connect`].
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Interval at which the punch routine re-sends its connect datagram.
    pub fn connect_retry(mut self, retry: Duration) -> Self {
        self.connect_retry = retry;
        self
    }

    /// Fired when the server acknowledges registration.
    pub fn on_registered(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hooks.registered = Box::new(hook);
        self
    }

    /// Fired when the punch routine starts against a peer.
    pub fn on_connecting(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hooks.connecting = Box::new(hook);
        self
    }

    /// Fired when the peer's key arrives and the link secret is bound.
    pub fn on_connected(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hooks.connected = Box::new(hook);
        self
    }

    /// Bind the local socket and construct the client. The client is idle
    /// until [`Client::run`] drives its socket loops.
    pub async fn bind(self, local_addr: SocketAddr) -> Result<Client, NetError> {
        let dispatcher = Dispatcher::bind(local_addr).await?;
        let keypair = self.keypair.unwrap_or_else(Keypair::generate);
        let me = Peer::new(&self.id, keypair.public.to_vec());
        let server_conn = dispatcher.connection(self.server_addr);

        let state = Arc::new(ClientState {
            me,
            keypair,
            server_conn,
            registered: AtomicBool::new(false),
            registered_signal: Notify::new(),
            tracker: HandshakeTracker::new(),
            hooks: self.hooks,
        });

        let routes: Arc<dyn MessageHandler> = Arc::new(ClientRoutes {
            state: state.clone(),
            dispatcher: Arc::downgrade(&dispatcher),
            connect_timeout: self.connect_timeout,
            connect_retry: self.connect_retry,
        });
        for path in [
            route::GREETING,
            route::REGISTER,
            route::ESTABLISH,
            route::CONNECT,
            route::KEY,
        ] {
            dispatcher.handle(path, routes.clone());
        }

        Ok(Client {
            inner: Arc::new(ClientInner {
                state,
                dispatcher,
                connect_timeout: self.connect_timeout,
            }),
        })
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// A rendezvous client. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    state: Arc<ClientState>,
    dispatcher: Arc<Dispatcher>,
    connect_timeout: Duration,
}

struct ClientState {
    me: Peer,
    keypair: Keypair,
    server_conn: Connection,
    registered: AtomicBool,
    registered_signal: Notify,
    tracker: HandshakeTracker,
    hooks: Hooks,
}

impl ClientState {
    async fn wait_registered(&self) {
        loop {
            let notified = self.registered_signal.notified();
            if self.registered.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

impl Client {
    pub fn builder(id: &str, server_addr: SocketAddr) -> ClientBuilder {
        ClientBuilder {
            id: id.to_string(),
            server_addr,
            keypair: None,
            connect_timeout: CONNECT_TIMEOUT,
            connect_retry: CONNECT_RETRY_INTERVAL,
            hooks: Hooks::default(),
        }
    }

    /// This client's identity record.
    pub fn me(&self) -> &Peer {
        &self.inner.state.me
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.inner.dispatcher.local_addr()
    }

    /// Register an application handler on the shared socket.
    pub fn handle(&self, path: &str, handler: Arc<dyn MessageHandler>) {
        self.inner.dispatcher.handle(path, handler);
    }

    /// Run the socket loops until [`Client::shutdown`].
    pub async fn run(&self) -> Result<(), NetError> {
        self.inner.dispatcher.clone().run().await
    }

    /// Signal shutdown; in-flight handlers complete before `run` returns.
    pub fn shutdown(&self) {
        self.inner.dispatcher.shutdown();
    }

    /// Open the server handshake by sending a greeting. Registration
    /// proceeds inside handlers as the replies come back.
    pub async fn start(&self) -> Result<(), NetError> {
        let state = &self.inner.state;
        let mut greeting = Message::new(route::GREETING);
        greeting.body = crypto::encode_key(&state.keypair.public).into_bytes();
        state.server_conn.send(greeting).await
    }

    /// Whether the server has acknowledged registration.
    pub fn registered(&self) -> bool {
        self.inner.state.registered.load(Ordering::Acquire)
    }

    /// Wait until the server acknowledges registration, bounded by the
    /// configured connect timeout.
    pub async fn wait_registered(&self) -> Result<(), NetError> {
        tokio::time::timeout(
            self.inner.connect_timeout,
            self.inner.state.wait_registered(),
        )
        .await
        .map_err(|_| NetError::ConnectTimeout)
    }

    /// Punch through to `peer_id`: ask the server for an introduction,
    /// then wait until the keys have been exchanged directly, bounded by
    /// the configured connect timeout.
    pub async fn connect(&self, peer_id: &str) -> Result<(), NetError> {
        let state = &self.inner.state;
        self.wait_registered().await?;

        let entry = state.tracker.entry(peer_id);
        if entry.key_received() {
            return Ok(());
        }

        let mut request = Message::new(route::ESTABLISH);
        request.peer_id = state.me.id.clone();
        request.body = peer_id.as_bytes().to_vec();
        state.server_conn.send(request).await?;

        // The establish reply spawns the punch routine; all that is left
        // here is waiting for the peer's key or the deadline.
        tokio::time::timeout(self.inner.connect_timeout, entry.wait_key())
            .await
            .map_err(|_| NetError::ConnectTimeout)
    }

    /// Whether our key has been sent to `peer_id`.
    pub fn key_sent(&self, peer_id: &str) -> bool {
        self.inner
            .state
            .tracker
            .get(peer_id)
            .is_some_and(|entry| entry.key_sent())
    }

    /// Whether `peer_id`'s key has arrived and its secret is bound.
    pub fn key_received(&self, peer_id: &str) -> bool {
        self.inner
            .state
            .tracker
            .get(peer_id)
            .is_some_and(|entry| entry.key_received())
    }

    /// The peer record received from the server, once introduced.
    pub fn peer(&self, peer_id: &str) -> Option<Peer> {
        self.inner
            .state
            .tracker
            .get(peer_id)
            .and_then(|entry| entry.peer().cloned())
    }

    /// The direct connection to `peer_id`, once introduced.
    pub fn peer_connection(&self, peer_id: &str) -> Option<Connection> {
        self.inner.state.tracker.get(peer_id).and_then(|entry| entry.conn())
    }

    /// The secret bound to the direct connection to `peer_id`.
    pub fn peer_secret(&self, peer_id: &str) -> Option<[u8; 32]> {
        self.peer_connection(peer_id).and_then(|conn| conn.secret())
    }

    /// The secret bound to the server link.
    pub fn server_secret(&self) -> Option<[u8; 32]> {
        self.inner.state.server_conn.secret()
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

struct ClientRoutes {
    state: Arc<ClientState>,
    dispatcher: Weak<Dispatcher>,
    connect_timeout: Duration,
    connect_retry: Duration,
}

#[async_trait]
impl MessageHandler for ClientRoutes {
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
            route::CONNECT => self.on_connect(conn, msg).await,
            route::KEY => self.on_key(conn, msg).await,
            _ => Ok(None),
        }
    }
}

impl ClientRoutes {
    /// Greeting reply: bind the server link secret, then register.
    async fn on_greeting(
        &self,
        conn: &Connection,
        msg: Message,
    ) -> Result<Option<Message>, NetError> {
        let state = &self.state;
        let server_public = crypto::decode_key(&msg.body)?;
        let secret = state.keypair.shared_secret(&server_public)?;
        conn.set_secret(secret);
        tracing::debug!(server = %conn.addr(), "server link secret bound");

        let mut register = Message::new(route::REGISTER);
        register.peer_id = state.me.id.clone();
        register.body = crypto::encode_key(&state.keypair.public).into_bytes();
        Ok(Some(register))
    }

    /// Register acknowledgement.
    async fn on_register(
        &self,
        _conn: &Connection,
        _msg: Message,
    ) -> Result<Option<Message>, NetError> {
        let state = &self.state;
        state.registered.store(true, Ordering::Release);
        state.registered_signal.notify_waiters();
        tracing::info!(id = %state.me.id, "registered with rendezvous server");
        (state.hooks.registered)(&state.me.id);
        Ok(None)
    }

    /// Introduction from the server: store the peer record, create its
    /// connection, and start punching. Both the requester and the target
    /// receive an establish message; each side punches from its end.
    async fn on_establish(
        &self,
        _conn: &Connection,
        msg: Message,
    ) -> Result<Option<Message>, NetError> {
        let peer = Peer::decode(&msg.body)?;
        let addr = peer
            .addr
            .ok_or_else(|| NetError::PeerAddrMissing(peer.id.clone()))?;

        let dispatcher = self.dispatcher.upgrade().ok_or(NetError::Terminated)?;
        let peer_conn = dispatcher.connection(addr);

        let peer_id = peer.id.clone();
        let entry = self.state.tracker.entry(&peer_id);
        entry.publish(peer, peer_conn);
        tracing::debug!(peer = %peer_id, %addr, "peer introduction received");

        if entry.begin_punch() {
            let state = self.state.clone();
            let retry = self.connect_retry;
            let deadline = self.connect_timeout;
            tokio::spawn(async move {
                punch(state, entry, peer_id, retry, deadline).await;
            });
        }
        Ok(None)
    }

    /// Connect datagram from a peer: answer with our public key.
    async fn on_connect(
        &self,
        conn: &Connection,
        msg: Message,
    ) -> Result<Option<Message>, NetError> {
        if msg.peer_id.is_empty() {
            return Err(NetError::Protocol("connect without a peer id"));
        }
        let entry = self
            .state
            .tracker
            .get(&msg.peer_id)
            .ok_or(NetError::UnknownPeer("connect"))?;
        let known = entry.conn().ok_or(NetError::UnknownPeer("connect"))?;

        // The datagram may arrive on a different connection object than
        // the one we created; the address is what identifies the peer.
        if known.addr() != conn.addr() {
            return Err(NetError::UnknownPeer("connect"));
        }

        entry.set_key_sent();

        let mut key = Message::new(route::KEY);
        key.peer_id = self.state.me.id.clone();
        key.body = crypto::encode_key(&self.state.keypair.public).into_bytes();
        Ok(Some(key))
    }

    /// Key from a peer: bind the peer link secret. No reply.
    async fn on_key(&self, conn: &Connection, msg: Message) -> Result<Option<Message>, NetError> {
        let entry = self
            .state
            .tracker
            .get(&msg.peer_id)
            .ok_or(NetError::UnknownPeer("key"))?;
        let known = entry.conn().ok_or(NetError::UnknownPeer("key"))?;
        if known.addr() != conn.addr() {
            return Err(NetError::UnknownPeer("key"));
        }

        let peer_public = crypto::decode_key(&msg.body)?;
        let secret = self.state.keypair.shared_secret(&peer_public)?;
        known.set_secret(secret);
        entry.set_key_received();
        tracing::debug!(peer = %msg.peer_id, "peer link secret bound");
        Ok(None)
    }
}

/// The punch routine: send connect datagrams until the peer's key
/// arrives or the deadline passes. Repeated sends hold our side of the
/// pinhole open while the peer punches from its side.
async fn punch(
    state: Arc<ClientState>,
    entry: Arc<PeerHandshake>,
    peer_id: String,
    retry: Duration,
    deadline: Duration,
) {
    (state.hooks.connecting)(&peer_id);
    let Some(conn) = entry.conn() else { return };

    let mut ticker = tokio::time::interval(retry);
    let timeout = tokio::time::sleep(deadline);
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            _ = entry.wait_key() => {
                tracing::info!(peer = %peer_id, "connected");
                (state.hooks.connected)(&peer_id);
                return;
            }
            _ = &mut timeout => {
                tracing::warn!(peer = %peer_id, "connect timed out");
                return;
            }
            _ = ticker.tick() => {
                let mut hello = Message::new(route::CONNECT);
                hello.peer_id = state.me.id.clone();
                hello.body = state.me.id.as_bytes().to_vec();
                if conn.send(hello).await.is_err() {
                    return;
                }
            }
        }
    }
}
