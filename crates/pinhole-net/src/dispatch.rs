//! The dispatcher — owns the UDP socket and both socket loops.
//!
//! Inbound datagrams are demultiplexed by source address into
//! [`Connection`]s and by message path into handlers; each message is
//! served on its own task. Outbound messages funnel through one bounded
//! FIFO queue, so datagrams queued from the same task in order are
//! transmitted in order. Signalling shutdown lets both loops finish
//! in-flight work; outstanding handler tasks are joined before [`run`]
//! returns, and no datagram received after shutdown begins is dispatched.
//!
//! [`run`]: Dispatcher::run

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;

use pinhole_core::wire::{MAX_DATAGRAM, OUTBOUND_QUEUE_DEPTH};
use pinhole_core::Message;

use crate::connection::Connection;
use crate::error::NetError;
use crate::handler::{HandlerTable, MessageHandler};

pub struct Dispatcher {
    socket: UdpSocket,
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    /// Keyed by remote-address string; entries are created lazily on
    /// first traffic in either direction.
    connections: DashMap<String, Connection>,
    handlers: RwLock<HandlerTable>,
    shutdown_tx: watch::Sender<bool>,
}

impl Dispatcher {
    /// Bind the UDP socket and construct an idle dispatcher.
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>, NetError> {
        let socket = UdpSocket::bind(addr).await?;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            socket,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            connections: DashMap::new(),
            handlers: RwLock::new(HandlerTable::new()),
            shutdown_tx,
        }))
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.socket.local_addr()?)
    }

    /// Register `handler` for `path`, replacing any previous registration.
    pub fn handle(&self, path: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().insert(path, handler);
    }

    /// Look up or lazily create the connection for `addr`.
    pub fn connection(&self, addr: SocketAddr) -> Connection {
        self.connections
            .entry(addr.to_string())
            .or_insert_with(|| Connection::new(addr, self.outbound_tx.clone()))
            .clone()
    }

    /// The connection for `addr`, if one exists.
    pub fn get_connection(&self, addr: SocketAddr) -> Option<Connection> {
        self.connections.get(&addr.to_string()).map(|c| c.clone())
    }

    /// Signal shutdown. [`Dispatcher::run`] returns once in-flight work
    /// completes. Effective even before the loops have subscribed.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Run both socket loops until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), NetError> {
        let outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or(NetError::AlreadyRunning)?;

        let sender = {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.sender_loop(outbound_rx).await })
        };

        Arc::clone(&self).receiver_loop().await;

        let _ = sender.await;
        Ok(())
    }

    async fn sender_loop(&self, mut outbound_rx: mpsc::Receiver<Message>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                maybe = outbound_rx.recv() => {
                    let Some(message) = maybe else { return };
                    self.transmit(message).await;
                }
            }
        }
    }

    async fn transmit(&self, message: Message) {
        let Some(addr) = message.addr else {
            tracing::warn!(path = %message.path, "outbound message with no address, dropping");
            return;
        };
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "failed to encode outbound message");
                return;
            }
        };
        // The channel is datagram-lossy by contract; send errors are
        // logged and swallowed.
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            tracing::warn!(%addr, error = %e, "send_to failed");
        }
    }

    async fn receiver_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        while !*shutdown.borrow_and_update() {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                result = self.socket.recv_from(&mut buf) => {
                    let (len, addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    let conn = self.connection(addr);
                    let datagram = buf[..len].to_vec();
                    let this = Arc::clone(&self);
                    tasks.spawn(async move { this.serve(datagram, conn).await });
                }
            }
        }

        // In-flight handlers complete before teardown.
        while tasks.join_next().await.is_some() {}
    }

    async fn serve(&self, datagram: Vec<u8>, conn: Connection) {
        let message = match Message::decode(&datagram) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(addr = %conn.addr(), error = %e, "undecodable datagram");
                let _ = conn.send(Message::error_reply(e)).await;
                return;
            }
        };

        let Some(handler) = self.handlers.read().get(&message.path) else {
            tracing::trace!(path = %message.path, "no handler, dropping");
            return;
        };

        let path = message.path.clone();
        let inbound_was_error = message.is_error();

        match handler.handle(&conn, message).await {
            Ok(Some(reply)) => {
                let _ = conn.send(reply).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(addr = %conn.addr(), %path, error = %e, "handler failed");
                // Never answer an error reply with another error reply.
                if !inbound_was_error {
                    let mut reply = Message::error_reply(e);
                    reply.path = path;
                    let _ = conn.send(reply).await;
                }
            }
        }
    }
}
