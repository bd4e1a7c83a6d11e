use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use pier_proto::{method_not_found, Request, Response, ResponseOutcome, RpcErrorObject, WireMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::pending::{PendingTable, RpcResponse};
use crate::config::{ClientConfig, Endpoint};
use crate::error::RpcError;
use crate::transport::{
    ConnectionState, EventSink, EventStream, SocketTransportFactory, SourcedEvent, Transport,
    TransportEvent, TransportFactory,
};

const SERVICE_EVENT_CAPACITY: usize = 64;

/// Lifecycle notices for UI collaborators. Purely informational; the client
/// acts on them itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    State(ConnectionState),
    RetryScheduled { attempt: u32, delay: Duration },
    FallbackAttempt { endpoint: Endpoint },
    RetryExhausted { attempts: u32 },
    TransportError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub retries_exhausted: bool,
}

/// Receives every inbound notification, in arrival order, on the client's
/// event task. Must not block.
pub trait NotificationHandler: Send + Sync {
    fn handle_notification(&self, method: &str, params: Value);
}

impl<F> NotificationHandler for F
where
    F: Fn(&str, Value) + Send + Sync,
{
    fn handle_notification(&self, method: &str, params: Value) {
        self(method, params)
    }
}

/// Answers requests the agent sends to us.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject>;
}

struct ActiveLink {
    source: u64,
    transport: Arc<dyn Transport>,
}

enum Fallback {
    Idle,
    /// Holds the original link while the alternate endpoint is tried.
    Trying(ActiveLink),
    Spent,
}

struct Recovery {
    attempts: u32,
    timer: Option<JoinHandle<()>>,
    fallback: Fallback,
}

impl Recovery {
    fn reset(&mut self) {
        self.attempts = 0;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if matches!(self.fallback, Fallback::Spent) {
            self.fallback = Fallback::Idle;
        }
    }
}

struct Inner {
    config: ClientConfig,
    factory: Arc<dyn TransportFactory>,
    sink: EventSink,
    link: RwLock<ActiveLink>,
    next_source: AtomicU64,
    next_id: AtomicU64,
    pending: Arc<PendingTable>,
    status: watch::Sender<LinkStatus>,
    service_events: broadcast::Sender<ServiceEvent>,
    notifications: RwLock<Option<Arc<dyn NotificationHandler>>>,
    requests: RwLock<Option<Arc<dyn RequestHandler>>>,
    recovery: Mutex<Recovery>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// JSON-RPC client over one logical agent connection.
///
/// Owns the transport, correlates responses with callers, forwards
/// notifications, and rebuilds the link after failures: up to
/// `retry.max_retries` attempts with doubling delays, preceded by a single
/// WebSocket attempt on `port + offset` when a TCP endpoint is refused.
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    /// Must be called inside a Tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        let factory = Arc::new(SocketTransportFactory::new(config.clone()));
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: ClientConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (sink, events) = EventSink::channel();
        let transport = factory.create(&config.endpoint, sink.with_source(1));
        let (status, _) = watch::channel(LinkStatus {
            state: ConnectionState::Disconnected,
            retries_exhausted: false,
        });
        let (service_events, _) = broadcast::channel(SERVICE_EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            config,
            factory,
            sink,
            link: RwLock::new(ActiveLink {
                source: 1,
                transport,
            }),
            next_source: AtomicU64::new(2),
            next_id: AtomicU64::new(1),
            pending: Arc::new(PendingTable::default()),
            status,
            service_events,
            notifications: RwLock::new(None),
            requests: RwLock::new(None),
            recovery: Mutex::new(Recovery {
                attempts: 0,
                timer: None,
                fallback: Fallback::Idle,
            }),
            pump: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let pump = tokio::spawn(run_pump(Arc::downgrade(&inner), events));
        *inner.pump.lock() = Some(pump);
        Self { inner }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The endpoint currently in use, which differs from the configured one
    /// while the WebSocket fallback is active.
    pub fn endpoint(&self) -> Endpoint {
        self.inner.transport().endpoint().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    pub fn service_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.service_events.subscribe()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn set_notification_handler(&self, handler: Arc<dyn NotificationHandler>) {
        *self.inner.notifications.write() = Some(handler);
    }

    pub fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.inner.requests.write() = Some(handler);
    }

    /// Start connecting with a fresh retry budget. Returns once the attempt
    /// is underway; use [`RpcClient::wait_connected`] for the outcome.
    pub fn connect(&self) -> Result<(), RpcError> {
        self.inner.ensure_open()?;
        self.inner.recovery.lock().reset();
        self.inner
            .status
            .send_modify(|status| status.retries_exhausted = false);
        self.inner.transport().connect()?;
        Ok(())
    }

    /// Drop the current connection and start over with a fresh budget.
    pub fn reconnect(&self) -> Result<(), RpcError> {
        self.inner.ensure_open()?;
        self.inner.recovery.lock().reset();
        self.inner.transport().disconnect();
        self.inner.pending.reject_all(&RpcError::Disconnected);
        self.connect()
    }

    /// Close the link without scheduling recovery. Pending requests fail
    /// with [`RpcError::Disconnected`].
    pub fn disconnect(&self) {
        self.inner.recovery.lock().reset();
        self.inner.transport().disconnect();
        let rejected = self.inner.pending.reject_all(&RpcError::Disconnected);
        debug!(target: "pier::rpc", rejected, "disconnected");
    }

    /// Resolves once connected, or fails when the retry budget is spent.
    pub async fn wait_connected(&self) -> Result<(), RpcError> {
        let mut status = self.inner.status.subscribe();
        let reached = *status
            .wait_for(|status| {
                status.state == ConnectionState::Connected || status.retries_exhausted
            })
            .await
            .map_err(|_| RpcError::Shutdown)?;
        if reached.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(RpcError::RetryExhausted {
                attempts: self.inner.config.retry.max_retries,
            })
        }
    }

    pub async fn send_request(&self, method: &str, params: Value) -> Result<RpcResponse, RpcError> {
        self.inner.ensure_open()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let call = self.inner.pending.register(id);
        self.inner
            .transport()
            .send(&WireMessage::request(id, method, params))?;
        debug!(target: "pier::rpc", id, method, "request sent");
        call.wait().await
    }

    /// Typed wrapper over [`RpcClient::send_request`].
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params =
            serde_json::to_value(params).map_err(|err| RpcError::Encode(err.to_string()))?;
        let response = self.send_request(method, params).await?;
        serde_json::from_value(response.result)
            .map_err(|err| RpcError::InvalidResponse(format!("{method}: {err}")))
    }

    pub fn send_notification(&self, method: &str, params: Value) -> Result<(), RpcError> {
        self.inner.ensure_open()?;
        self.inner
            .transport()
            .send(&WireMessage::notification(method, params))?;
        trace!(target: "pier::rpc", method, "notification sent");
        Ok(())
    }

    /// Tear the client down for good: no more retries, pending requests
    /// rejected, handlers released. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.recovery.lock().reset();
        self.inner.transport().disconnect();
        self.inner.pending.reject_all(&RpcError::Disconnected);
        *self.inner.notifications.write() = None;
        *self.inner.requests.write() = None;
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        self.inner.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
        });
        info!(target: "pier::rpc", endpoint = %self.inner.config.endpoint, "client shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

async fn run_pump(inner: Weak<Inner>, mut events: EventStream) {
    while let Some(SourcedEvent { source, event }) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(source, event);
    }
}

impl Inner {
    fn transport(&self) -> Arc<dyn Transport> {
        self.link.read().transport.clone()
    }

    fn ensure_open(&self) -> Result<(), RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RpcError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn handle_event(self: &Arc<Self>, source: u64, event: TransportEvent) {
        if source != self.link.read().source {
            trace!(target: "pier::rpc", source, "ignoring event from replaced transport");
            return;
        }
        match event {
            TransportEvent::StateChanged(state) => self.on_state(state),
            TransportEvent::Message(message) => self.dispatch(message),
            TransportEvent::Error(error) => {
                warn!(target: "pier::rpc", endpoint = %self.transport().endpoint(), error = %error, "transport error");
                let _ = self
                    .service_events
                    .send(ServiceEvent::TransportError(error.to_string()));
            }
            TransportEvent::Decode(error) => {
                warn!(target: "pier::rpc", error = %error, "dropping undecodable inbound data");
            }
        }
    }

    fn on_state(self: &Arc<Self>, state: ConnectionState) {
        self.status.send_modify(|status| {
            status.state = state;
            if state == ConnectionState::Connected {
                status.retries_exhausted = false;
            }
        });
        let _ = self.service_events.send(ServiceEvent::State(state));
        match state {
            ConnectionState::Connected => {
                info!(target: "pier::rpc", endpoint = %self.transport().endpoint(), "connected");
                let mut recovery = self.recovery.lock();
                recovery.reset();
                recovery.fallback = Fallback::Idle;
            }
            ConnectionState::Disconnected => {
                let rejected = self.pending.reject_all(&RpcError::Disconnected);
                if rejected > 0 {
                    debug!(target: "pier::rpc", rejected, "rejected pending requests on close");
                }
            }
            ConnectionState::Failed => {
                self.pending.reject_all(&RpcError::Disconnected);
                self.recover();
            }
            ConnectionState::Connecting => {}
        }
    }

    fn recover(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut recovery = self.recovery.lock();

        if matches!(recovery.fallback, Fallback::Idle) {
            let current = self.transport().endpoint().clone();
            let alternate = self
                .config
                .fallback_port_offset
                .and_then(|offset| current.websocket_fallback(offset));
            if let Some(alternate) = alternate {
                let original = self.replace_link(self.create_link(&alternate));
                recovery.fallback = Fallback::Trying(original);
                drop(recovery);
                info!(target: "pier::rpc", from = %current, to = %alternate, "tcp connect failed; trying websocket");
                let _ = self.service_events.send(ServiceEvent::FallbackAttempt {
                    endpoint: alternate,
                });
                self.connect_current();
                return;
            }
        }

        if let Fallback::Trying(original) =
            std::mem::replace(&mut recovery.fallback, Fallback::Spent)
        {
            warn!(target: "pier::rpc", "websocket fallback failed; retrying original endpoint");
            let fallback = self.replace_link(original);
            fallback.transport.disconnect();
        }

        let policy = self.config.retry;
        if recovery.attempts >= policy.max_retries {
            let attempts = recovery.attempts;
            recovery.timer = None;
            drop(recovery);
            warn!(target: "pier::rpc", attempts, "giving up reconnecting");
            self.status
                .send_modify(|status| status.retries_exhausted = true);
            let _ = self
                .service_events
                .send(ServiceEvent::RetryExhausted { attempts });
            return;
        }

        recovery.attempts += 1;
        let attempt = recovery.attempts;
        let delay = policy.delay_for(attempt);
        let weak = Arc::downgrade(self);
        recovery.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.connect_current();
            }
        }));
        drop(recovery);
        info!(target: "pier::rpc", attempt, ?delay, "reconnect scheduled");
        let _ = self
            .service_events
            .send(ServiceEvent::RetryScheduled { attempt, delay });
    }

    fn create_link(&self, endpoint: &Endpoint) -> ActiveLink {
        let source = self.next_source.fetch_add(1, Ordering::SeqCst);
        ActiveLink {
            source,
            transport: self.factory.create(endpoint, self.sink.with_source(source)),
        }
    }

    fn replace_link(&self, next: ActiveLink) -> ActiveLink {
        std::mem::replace(&mut *self.link.write(), next)
    }

    fn connect_current(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(error) = self.transport().connect() {
            warn!(target: "pier::rpc", error = %error, "connect attempt rejected");
        }
    }

    fn dispatch(self: &Arc<Self>, message: WireMessage) {
        match message {
            WireMessage::Response(response) => {
                let Some(id) = response.id.as_ref().and_then(|id| id.as_u64()) else {
                    warn!(target: "pier::rpc", outcome = ?response.outcome, "response without usable id");
                    return;
                };
                let outcome = match response.outcome {
                    ResponseOutcome::Result(result) => Ok(RpcResponse { id, result }),
                    ResponseOutcome::Error(error) => Err(RpcError::from(error)),
                };
                if !self.pending.resolve(id, outcome) {
                    debug!(target: "pier::rpc", id, "dropping response for unknown request");
                }
            }
            WireMessage::Notification(notification) => {
                let handler = self.notifications.read().clone();
                match handler {
                    Some(handler) => handler.handle_notification(
                        &notification.method,
                        notification.params.unwrap_or(Value::Null),
                    ),
                    None => {
                        debug!(target: "pier::rpc", method = %notification.method, "no notification handler")
                    }
                }
            }
            WireMessage::Request(request) => self.answer(request),
        }
    }

    fn answer(self: &Arc<Self>, request: Request) {
        let handler = self.requests.read().clone();
        let transport = self.transport();
        tokio::spawn(async move {
            let Request { id, method, params } = request;
            let reply = match handler {
                Some(handler) => {
                    match handler
                        .handle_request(&method, params.unwrap_or(Value::Null))
                        .await
                    {
                        Ok(result) => WireMessage::result(id, result),
                        Err(error) => WireMessage::Response(Response {
                            id: Some(id),
                            outcome: ResponseOutcome::Error(error),
                        }),
                    }
                }
                None => method_not_found(Some(id), &method),
            };
            if let Err(error) = transport.send(&reply) {
                warn!(target: "pier::rpc", method = %method, error = %error, "failed to answer agent request");
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.recovery.get_mut().timer.take() {
            timer.abort();
        }
        self.link.get_mut().transport.disconnect();
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}
