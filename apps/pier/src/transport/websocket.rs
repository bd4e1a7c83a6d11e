use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pier_proto::WireMessage;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::codec::{decode_text_frame, encode_message};
use super::link::Link;
use super::{ConnectionState, EventSink, Transport};
use crate::config::Endpoint;
use crate::error::{DecodeError, TransportError};

/// WebSocket implementation of the Transport trait. One JSON-RPC message
/// per text frame outbound; inbound frames may carry several
/// newline-separated messages.
pub struct WebSocketTransport {
    link: Arc<Link>,
    connect_timeout: Duration,
    newline_terminated: bool,
}

impl WebSocketTransport {
    pub fn new(
        endpoint: Endpoint,
        connect_timeout: Duration,
        newline_terminated: bool,
        events: EventSink,
    ) -> Self {
        Self {
            link: Arc::new(Link::new(endpoint, events)),
            connect_timeout,
            newline_terminated,
        }
    }
}

impl Transport for WebSocketTransport {
    fn endpoint(&self) -> &Endpoint {
        self.link.endpoint()
    }

    fn state(&self) -> ConnectionState {
        self.link.state()
    }

    fn connect(&self) -> Result<(), TransportError> {
        let Some(epoch) = self.link.begin_connect() else {
            return Ok(());
        };
        let link = self.link.clone();
        let timeout = self.connect_timeout;
        let task = tokio::spawn(async move {
            run_connection(link, epoch, timeout).await;
        });
        self.link.attach_task(epoch, task);
        Ok(())
    }

    fn disconnect(&self) {
        self.link.disconnect();
    }

    fn send(&self, message: &WireMessage) -> Result<(), TransportError> {
        self.link
            .send_text(encode_message(message, self.newline_terminated))
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.link.disconnect();
    }
}

async fn run_connection(link: Arc<Link>, epoch: u64, timeout: Duration) {
    let url = link.endpoint().url();
    let stream = match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(err)) => {
            link.fail(epoch, TransportError::Refused(err.to_string()));
            return;
        }
        Err(_) => {
            link.fail(epoch, TransportError::Timeout(timeout));
            return;
        }
    };

    let (tx_out, rx_out) = mpsc::unbounded_channel::<String>();
    if !link.mark_connected(epoch, tx_out) {
        return;
    }
    handle_websocket(stream, rx_out, &link, epoch).await;
}

async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<String>,
    link: &Link,
    epoch: u64,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            outbound = rx_out.recv() => match outbound {
                Some(text) => {
                    if let Err(err) = ws_sender.send(Message::Text(text)).await {
                        link.fail(epoch, TransportError::AbnormalClose(err.to_string()));
                        return;
                    }
                }
                None => {
                    // Sender dropped by disconnect.
                    let _ = ws_sender.close().await;
                    return;
                }
            },
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    trace!(target: "pier::transport", bytes = text.len(), "ws frame");
                    for decoded in decode_text_frame(&text) {
                        link.deliver(epoch, decoded);
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        for decoded in decode_text_frame(&text) {
                            link.deliver(epoch, decoded);
                        }
                    }
                    Err(_) => link.deliver(epoch, Err(DecodeError::Utf8)),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(target: "pier::transport", ?frame, "peer closed websocket");
                    link.closed(epoch);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    link.fail(epoch, TransportError::AbnormalClose(err.to_string()));
                    return;
                }
                None => {
                    link.fail(
                        epoch,
                        TransportError::AbnormalClose("stream ended without close frame".into()),
                    );
                    return;
                }
            },
        }
    }
}
