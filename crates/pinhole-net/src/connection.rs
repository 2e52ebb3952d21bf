//! Virtual per-address connections over the shared socket.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use pinhole_core::Message;

use crate::error::NetError;

/// A virtual channel to one remote address.
///
/// Created on first traffic in either direction and kept until the
/// dispatcher tears down. Cheap to clone — clones share the outbound
/// queue handle and the secret cell.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    addr: SocketAddr,
    outbound: mpsc::Sender<Message>,
    /// Link secret. Bound by a key-agreement step; the server greeting
    /// path may replace it (rekey from the same source address).
    secret: RwLock<Option<[u8; 32]>>,
}

impl Connection {
    pub(crate) fn new(addr: SocketAddr, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            inner: Arc::new(Inner {
                addr,
                outbound,
                secret: RwLock::new(None),
            }),
        }
    }

    /// The remote address this connection is scoped to.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Queue a message for transmission, stamping the remote address if
    /// the caller left it unset. Blocks while the outbound queue is full.
    pub async fn send(&self, mut message: Message) -> Result<(), NetError> {
        if message.addr.is_none() {
            message.addr = Some(self.inner.addr);
        }
        self.inner
            .outbound
            .send(message)
            .await
            .map_err(|_| NetError::QueueClosed)
    }

    /// The link secret, once key agreement has bound one.
    pub fn secret(&self) -> Option<[u8; 32]> {
        *self.inner.secret.read()
    }

    /// Bind the link secret.
    pub fn set_secret(&self, secret: [u8; 32]) {
        *self.inner.secret.write() = Some(secret);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.inner.addr)
            .field("has_secret", &self.secret().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinhole_core::wire::route;

    fn connection() -> (Connection, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(4);
        (Connection::new("127.0.0.1:4000".parse().unwrap(), tx), rx)
    }

    #[tokio::test]
    async fn send_stamps_remote_address() {
        let (conn, mut rx) = connection();
        conn.send(Message::new(route::GREETING)).await.unwrap();

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.addr, Some(conn.addr()));
    }

    #[tokio::test]
    async fn send_keeps_existing_address() {
        let (conn, mut rx) = connection();
        let elsewhere: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let mut message = Message::new(route::ESTABLISH);
        message.addr = Some(elsewhere);
        conn.send(message).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().addr, Some(elsewhere));
    }

    #[test]
    fn secret_starts_empty_and_binds() {
        let (conn, _rx) = connection();
        assert_eq!(conn.secret(), None);

        conn.set_secret([3u8; 32]);
        assert_eq!(conn.secret(), Some([3u8; 32]));

        // Rekey path: a later greeting replaces the secret.
        conn.set_secret([4u8; 32]);
        assert_eq!(conn.secret(), Some([4u8; 32]));
    }

    #[test]
    fn clones_share_the_secret_cell() {
        let (conn, _rx) = connection();
        let clone = conn.clone();
        conn.set_secret([9u8; 32]);
        assert_eq!(clone.secret(), Some([9u8; 32]));
    }
}
