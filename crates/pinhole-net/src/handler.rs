//! Path-routed message handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use pinhole_core::Message;

use crate::connection::Connection;
use crate::error::NetError;

/// A handler bound to one or more message paths.
///
/// `Ok(Some(reply))` queues the reply on the originating connection,
/// `Ok(None)` sends nothing, and `Err` becomes an error reply.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, conn: &Connection, msg: Message) -> Result<Option<Message>, NetError>;
}

/// Maps message paths to handlers. One handler value may be registered
/// under several paths.
///
/// A path with no handler is silently dropped — unknown paths may come
/// from a newer protocol revision and must not amplify.
#[derive(Default, Clone)]
pub struct HandlerTable {
    routes: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `path`, replacing any previous registration.
    pub fn insert(&mut self, path: &str, handler: Arc<dyn MessageHandler>) {
        self.routes.insert(path.to_string(), handler);
    }

    /// The handler for `path`, if one is registered.
    pub fn get(&self, path: &str) -> Option<Arc<dyn MessageHandler>> {
        self.routes.get(path).cloned()
    }
}
