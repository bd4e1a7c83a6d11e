use std::sync::Arc;

use parking_lot::Mutex;
use pier_proto::methods;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::rpc::{NotificationHandler, RpcClient};
use crate::session::{ChatSession, MessageStore, WeakChatSession};
use crate::terminal::{TerminalClient, TerminalRouter};
use crate::transport::{SocketTransportFactory, TransportFactory};

/// Routes inbound notifications to the chat session or the terminal
/// router. Anything else is logged and dropped.
struct NotificationDispatcher {
    chat: WeakChatSession,
    terminals: TerminalRouter,
}

impl NotificationHandler for NotificationDispatcher {
    fn handle_notification(&self, method: &str, params: Value) {
        if methods::is_session_update(method) {
            if let Some(chat) = self.chat.upgrade() {
                chat.handle_update(&params);
            }
            return;
        }
        if self.terminals.handle_notification(method, &params) {
            return;
        }
        debug!(target: "pier::rpc", method, "unhandled notification");
    }
}

/// Everything the app needs for one agent server: the RPC client, the chat
/// session bound to it, and terminal access.
pub struct AgentConnection {
    rpc: RpcClient,
    chat: ChatSession,
    terminals: TerminalClient,
}

impl AgentConnection {
    pub fn new(config: ClientConfig, store: Arc<dyn MessageStore>) -> Self {
        let factory = Arc::new(SocketTransportFactory::new(config.clone()));
        Self::with_factory(config, factory, store)
    }

    pub fn with_factory(
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let server_key = config.server_key();
        let rpc = RpcClient::with_factory(config, factory);
        let router = TerminalRouter::new();
        let chat = ChatSession::new(rpc.clone(), store, server_key);
        rpc.set_notification_handler(Arc::new(NotificationDispatcher {
            chat: chat.downgrade(),
            terminals: router.clone(),
        }));
        let terminals = TerminalClient::new(rpc.clone(), router);
        Self {
            rpc,
            chat,
            terminals,
        }
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn chat(&self) -> &ChatSession {
        &self.chat
    }

    pub fn terminals(&self) -> &TerminalClient {
        &self.terminals
    }

    /// Disconnect, fail pending requests, and end every terminal
    /// subscription.
    pub fn shutdown(&self) {
        self.rpc.shutdown();
        self.terminals.router().clear();
    }
}

/// Holds the connection for the currently selected server. Selecting a new
/// server tears the old one down completely before the new one exists, so
/// the two never share a live socket or subscriptions.
#[derive(Default)]
pub struct ConnectionSlot {
    current: Mutex<Option<Arc<AgentConnection>>>,
}

impl ConnectionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<AgentConnection>> {
        self.current.lock().clone()
    }

    /// Replace the active connection with `build()`'s result.
    pub fn select<F>(&self, build: F) -> Arc<AgentConnection>
    where
        F: FnOnce() -> AgentConnection,
    {
        let mut current = self.current.lock();
        if let Some(previous) = current.take() {
            info!(target: "pier::rpc", endpoint = %previous.rpc().config().endpoint, "switching servers");
            previous.shutdown();
        }
        let next = Arc::new(build());
        *current = Some(next.clone());
        next
    }

    pub fn clear(&self) {
        if let Some(previous) = self.current.lock().take() {
            previous.shutdown();
        }
    }
}
