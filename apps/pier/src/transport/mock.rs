//! In-process transport for tests. Connect outcomes are scripted per
//! endpoint, outbound messages are captured, and the test plays the agent
//! by injecting inbound messages.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use pier_proto::WireMessage;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use super::codec::decode_text_frame;
use super::{ConnectionState, EventSink, Transport, TransportEvent, TransportFactory};
use crate::config::Endpoint;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse,
}

#[derive(Default)]
struct MockScript {
    outcomes: Mutex<HashMap<String, VecDeque<ConnectOutcome>>>,
    attempts: Mutex<Vec<String>>,
}

impl MockScript {
    fn next(&self, endpoint: &Endpoint) -> ConnectOutcome {
        let url = endpoint.url();
        self.attempts.lock().push(url.clone());
        self.outcomes
            .lock()
            .get_mut(&url)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ConnectOutcome::Accept)
    }
}

pub struct MockTransport {
    endpoint: Endpoint,
    events: EventSink,
    state: Mutex<ConnectionState>,
    script: Arc<MockScript>,
    connects: AtomicUsize,
    sent_tx: mpsc::UnboundedSender<WireMessage>,
    sent_rx: AsyncMutex<mpsc::UnboundedReceiver<WireMessage>>,
}

impl MockTransport {
    fn new(endpoint: Endpoint, events: EventSink, script: Arc<MockScript>) -> Self {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Self {
            endpoint,
            events,
            state: Mutex::new(ConnectionState::Disconnected),
            script,
            connects: AtomicUsize::new(0),
            sent_tx,
            sent_rx: AsyncMutex::new(sent_rx),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Deliver a message as if the agent had sent it.
    pub fn inject(&self, message: WireMessage) {
        self.events.emit(TransportEvent::Message(message));
    }

    /// Deliver raw frame text through the WebSocket frame decoder.
    pub fn inject_frame(&self, text: &str) {
        for decoded in decode_text_frame(text) {
            let event = match decoded {
                Ok(message) => TransportEvent::Message(message),
                Err(error) => TransportEvent::Decode(error),
            };
            self.events.emit(event);
        }
    }

    /// Simulate the peer vanishing mid-session.
    pub fn drop_connection(&self) {
        let mut state = self.state.lock();
        if *state != ConnectionState::Connected {
            return;
        }
        self.events.emit(TransportEvent::Error(TransportError::AbnormalClose(
            "mock connection dropped".into(),
        )));
        self.transition(&mut state, ConnectionState::Failed);
    }

    /// Next message the client sent, waiting if none is queued yet.
    pub async fn next_sent(&self) -> Option<WireMessage> {
        self.sent_rx.lock().await.recv().await
    }

    pub fn try_next_sent(&self) -> Option<WireMessage> {
        self.sent_rx.try_lock().ok()?.try_recv().ok()
    }

    fn transition(&self, state: &mut ConnectionState, next: ConnectionState) {
        *state = next;
        self.events.emit(TransportEvent::StateChanged(next));
    }
}

impl Transport for MockTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.can_connect() {
            return Ok(());
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.transition(&mut state, ConnectionState::Connecting);
        match self.script.next(&self.endpoint) {
            ConnectOutcome::Accept => self.transition(&mut state, ConnectionState::Connected),
            ConnectOutcome::Refuse => {
                self.events.emit(TransportEvent::Error(TransportError::Refused(format!(
                    "{} refused (scripted)",
                    self.endpoint
                ))));
                self.transition(&mut state, ConnectionState::Failed);
            }
        }
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.state.lock();
        if *state != ConnectionState::Disconnected {
            self.transition(&mut state, ConnectionState::Disconnected);
        }
    }

    fn send(&self, message: &WireMessage) -> Result<(), TransportError> {
        if *self.state.lock() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.sent_tx
            .send(message.clone())
            .map_err(|_| TransportError::NotConnected)
    }
}

/// Factory handing out [`MockTransport`]s and remembering every one it
/// built.
#[derive(Default)]
pub struct MockFactory {
    script: Arc<MockScript>,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue connect outcomes for `endpoint`; unscripted attempts succeed.
    pub fn script(&self, endpoint: &Endpoint, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.script
            .outcomes
            .lock()
            .entry(endpoint.url())
            .or_default()
            .extend(outcomes);
    }

    /// Endpoint urls of every connect attempt, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.script.attempts.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().last().cloned()
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().clone()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, endpoint: &Endpoint, events: EventSink) -> Arc<dyn Transport> {
        let transport = Arc::new(MockTransport::new(
            endpoint.clone(),
            events,
            self.script.clone(),
        ));
        self.created.lock().push(transport.clone());
        transport
    }
}
