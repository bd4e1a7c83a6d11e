//! Connection bookkeeping shared by the socket transports.
//!
//! Every connect attempt gets a fresh epoch. The driver task carries its
//! epoch into each callback, and anything it reports after the link moved on
//! (disconnect, newer attempt) is dropped under the same lock that changed
//! the state, so owners never observe events from a dead attempt.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::codec::Decoded;
use super::{ConnectionState, EventSink, TransportEvent};
use crate::config::Endpoint;
use crate::error::TransportError;

pub(crate) struct Link {
    endpoint: Endpoint,
    events: EventSink,
    inner: Mutex<LinkInner>,
}

struct LinkInner {
    state: ConnectionState,
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    pub(crate) fn new(endpoint: Endpoint, events: EventSink) -> Self {
        Self {
            endpoint,
            events,
            inner: Mutex::new(LinkInner {
                state: ConnectionState::Disconnected,
                epoch: 0,
                outbound: None,
                task: None,
            }),
        }
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Moves to `Connecting` and returns the new epoch, or `None` when an
    /// attempt is already underway or established.
    pub(crate) fn begin_connect(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        if !inner.state.can_connect() {
            return None;
        }
        inner.epoch += 1;
        self.transition(&mut inner, ConnectionState::Connecting);
        debug!(target: "pier::transport", endpoint = %self.endpoint, epoch = inner.epoch, "connecting");
        Some(inner.epoch)
    }

    pub(crate) fn attach_task(&self, epoch: u64, task: JoinHandle<()>) {
        let mut inner = self.inner.lock();
        if inner.epoch == epoch && inner.state != ConnectionState::Disconnected {
            inner.task = Some(task);
        } else {
            task.abort();
        }
    }

    /// Returns false when the attempt is stale and the driver should stop.
    pub(crate) fn mark_connected(
        &self,
        epoch: u64,
        outbound: mpsc::UnboundedSender<String>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.outbound = Some(outbound);
        self.transition(&mut inner, ConnectionState::Connected);
        debug!(target: "pier::transport", endpoint = %self.endpoint, epoch, "connected");
        true
    }

    pub(crate) fn fail(&self, epoch: u64, error: TransportError) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return;
        }
        debug!(target: "pier::transport", endpoint = %self.endpoint, epoch, error = %error, "link failed");
        inner.outbound = None;
        inner.task = None;
        self.events.emit(TransportEvent::Error(error));
        self.transition(&mut inner, ConnectionState::Failed);
    }

    /// Graceful close initiated by the peer.
    pub(crate) fn closed(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return;
        }
        inner.outbound = None;
        inner.task = None;
        self.transition(&mut inner, ConnectionState::Disconnected);
    }

    pub(crate) fn deliver(&self, epoch: u64, decoded: Decoded) {
        let inner = self.inner.lock();
        if inner.epoch != epoch {
            trace!(target: "pier::transport", epoch, "dropping message from stale attempt");
            return;
        }
        let event = match decoded {
            Ok(message) => TransportEvent::Message(message),
            Err(error) => TransportEvent::Decode(error),
        };
        self.events.emit(event);
    }

    pub(crate) fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.outbound = None;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        if inner.state != ConnectionState::Disconnected {
            self.transition(&mut inner, ConnectionState::Disconnected);
        }
    }

    pub(crate) fn send_text(&self, text: String) -> Result<(), TransportError> {
        let inner = self.inner.lock();
        if inner.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        inner
            .outbound
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .send(text)
            .map_err(|_| TransportError::NotConnected)
    }

    fn transition(&self, inner: &mut LinkInner, state: ConnectionState) {
        inner.state = state;
        self.events.emit(TransportEvent::StateChanged(state));
    }
}
