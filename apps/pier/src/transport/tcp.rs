use std::sync::Arc;
use std::time::Duration;

use pier_proto::WireMessage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::codec::{encode_message, StreamDecoder};
use super::link::Link;
use super::{ConnectionState, EventSink, Transport};
use crate::config::Endpoint;
use crate::error::TransportError;

const READ_CHUNK: usize = 8 * 1024;

/// Raw TCP link. Outbound messages are newline-terminated; inbound bytes go
/// through [`StreamDecoder`] since the peer may not delimit at all.
pub struct TcpTransport {
    link: Arc<Link>,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(endpoint: Endpoint, connect_timeout: Duration, events: EventSink) -> Self {
        Self {
            link: Arc::new(Link::new(endpoint, events)),
            connect_timeout,
        }
    }
}

impl Transport for TcpTransport {
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
        self.link.send_text(encode_message(message, true))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.link.disconnect();
    }
}

async fn run_connection(link: Arc<Link>, epoch: u64, timeout: Duration) {
    let addr = link.endpoint().socket_addr();
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr.as_str())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            link.fail(epoch, TransportError::Refused(err.to_string()));
            return;
        }
        Err(_) => {
            link.fail(epoch, TransportError::Timeout(timeout));
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    let (tx_out, rx_out) = mpsc::unbounded_channel::<String>();
    if !link.mark_connected(epoch, tx_out) {
        return;
    }
    handle_stream(stream, rx_out, &link, epoch).await;
}

async fn handle_stream(
    stream: TcpStream,
    mut rx_out: mpsc::UnboundedReceiver<String>,
    link: &Link,
    epoch: u64,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = StreamDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            outbound = rx_out.recv() => match outbound {
                Some(text) => {
                    if let Err(err) = writer.write_all(text.as_bytes()).await {
                        link.fail(epoch, TransportError::Io(err.to_string()));
                        return;
                    }
                }
                None => {
                    let _ = writer.shutdown().await;
                    return;
                }
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(
                        target: "pier::transport",
                        pending = decoder.buffered(),
                        "peer closed tcp stream"
                    );
                    link.closed(epoch);
                    return;
                }
                Ok(n) => {
                    trace!(target: "pier::transport", bytes = n, "tcp read");
                    for decoded in decoder.push(&buf[..n]) {
                        link.deliver(epoch, decoded);
                    }
                }
                Err(err) => {
                    link.fail(epoch, TransportError::AbnormalClose(err.to_string()));
                    return;
                }
            },
        }
    }
}
