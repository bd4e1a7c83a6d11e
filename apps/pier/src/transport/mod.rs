use std::sync::Arc;

use pier_proto::WireMessage;
use tokio::sync::mpsc;

use crate::config::{ClientConfig, Endpoint};
use crate::error::{DecodeError, TransportError};

pub mod codec;
mod link;
pub mod mock;
pub mod tcp;
pub mod websocket;

pub use codec::{decode_text_frame, encode_message, StreamDecoder};
pub use tcp::TcpTransport;
pub use websocket::WebSocketTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    /// States from which `connect` starts a new attempt.
    pub fn can_connect(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// Everything a transport reports to its owner. Delivered in order over a
/// single channel so the consumer sees one linear history per link.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Message(WireMessage),
    Error(TransportError),
    Decode(DecodeError),
}

/// An event tagged with the id of the transport that produced it, so the
/// owner can ignore a transport it has already replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedEvent {
    pub source: u64,
    pub event: TransportEvent,
}

pub type EventStream = mpsc::UnboundedReceiver<SourcedEvent>;

#[derive(Debug, Clone)]
pub struct EventSink {
    source: u64,
    tx: mpsc::UnboundedSender<SourcedEvent>,
}

impl EventSink {
    pub fn channel() -> (EventSink, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { source: 0, tx }, rx)
    }

    /// A sink feeding the same stream under a different source id.
    pub fn with_source(&self, source: u64) -> EventSink {
        EventSink {
            source,
            tx: self.tx.clone(),
        }
    }

    pub fn source(&self) -> u64 {
        self.source
    }

    /// Returns false once the receiving side is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(SourcedEvent {
                source: self.source,
                event,
            })
            .is_ok()
    }
}

/// A message-level link to one agent endpoint.
///
/// Implementations never block the caller on network I/O: `connect` only
/// moves the link to `Connecting` and the outcome arrives later as a
/// [`TransportEvent::StateChanged`].
pub trait Transport: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    fn state(&self) -> ConnectionState;

    /// Start connecting. A no-op unless the link is `Disconnected` or
    /// `Failed`.
    fn connect(&self) -> Result<(), TransportError>;

    /// Close the link and emit `Disconnected`. Events still in flight from
    /// the closed attempt are discarded.
    fn disconnect(&self);

    /// Queue one message. Fails with [`TransportError::NotConnected`]
    /// unless the link is `Connected`.
    fn send(&self, message: &WireMessage) -> Result<(), TransportError>;
}

/// Builds transports for an endpoint; swapped for a scripted factory in
/// tests.
pub trait TransportFactory: Send + Sync {
    fn create(&self, endpoint: &Endpoint, events: EventSink) -> Arc<dyn Transport>;
}

/// Picks WebSocket or TCP from the endpoint scheme.
#[derive(Debug, Clone)]
pub struct SocketTransportFactory {
    config: ClientConfig,
}

impl SocketTransportFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for SocketTransportFactory {
    fn create(&self, endpoint: &Endpoint, events: EventSink) -> Arc<dyn Transport> {
        if endpoint.is_byte_stream() {
            Arc::new(TcpTransport::new(
                endpoint.clone(),
                self.config.connect_timeout,
                events,
            ))
        } else {
            Arc::new(WebSocketTransport::new(
                endpoint.clone(),
                self.config.connect_timeout,
                self.config.ws_newline_terminated,
                events,
            ))
        }
    }
}
