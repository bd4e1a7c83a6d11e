//! Standalone PTY bridge: every WebSocket connection gets its own shell.
//! Text frames carry [`TerminalFrame`] JSON in both directions.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use pier_proto::TerminalFrame;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ShellConfig;
use crate::error::ShellError;
use crate::pty::{join_or_abort, pump_output, PtyProcess, PtyWriter, SpawnConfig};

/// How long a closed session waits for the last output before giving up on
/// the pump.
const PUMP_GRACE: Duration = Duration::from_secs(2);

pub fn router(config: Arc<ShellConfig>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(config)
}

async fn ws_handler(
    State(config): State<Arc<ShellConfig>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, config))
}

async fn handle_socket(socket: WebSocket, config: Arc<ShellConfig>) {
    if let Err(err) = serve_terminal(socket, config).await {
        warn!(target: "pier_shell::ws", error = %err, "terminal session ended with error");
    }
}

async fn serve_terminal(socket: WebSocket, config: Arc<ShellConfig>) -> Result<(), ShellError> {
    let spawn = SpawnConfig::new(config.shell_command(None), config.cols, config.rows);
    let (process, reader, writer) = PtyProcess::spawn(spawn).map_err(ShellError::Pty)?;
    let process = Arc::new(process);
    info!(target: "pier_shell::ws", shell = %config.shell, "terminal session started");

    let (mut sink, mut stream) = socket.split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<TerminalFrame>();

    let pump = tokio::spawn({
        let process = process.clone();
        async move {
            let code = pump_output(reader, &process, |data| {
                frames_tx.send(TerminalFrame::Output { data }).is_ok()
            })
            .await
            .unwrap_or_else(|err| {
                warn!(target: "pier_shell::ws", error = %err, "failed to collect exit status");
                -1
            });
            let _ = frames_tx.send(TerminalFrame::Exit { code });
        }
    });

    let mut sender = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let exit = matches!(frame, TerminalFrame::Exit { .. });
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!(target: "pier_shell::ws", error = %err, "failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
            if exit {
                let _ = sink.close().await;
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut sender => break,
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Err(err) = apply_frame(&text, &process, &writer).await {
                        warn!(target: "pier_shell::ws", error = %err, "rejected client frame");
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if let Err(err) = writer.write_async(bytes).await {
                        warn!(target: "pier_shell::ws", error = %err, "failed to write raw input");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(target: "pier_shell::ws", error = %err, "websocket receive failed");
                    break;
                }
            },
        }
    }

    // Client gone or shell exited; either way the child must not outlive
    // the connection.
    process.shutdown();
    sender.abort();
    join_or_abort(pump, PUMP_GRACE).await;
    info!(target: "pier_shell::ws", "terminal session closed");
    Ok(())
}

async fn apply_frame(
    text: &str,
    process: &PtyProcess,
    writer: &PtyWriter,
) -> Result<(), ShellError> {
    match serde_json::from_str::<TerminalFrame>(text)? {
        TerminalFrame::Input { data } => writer
            .write_async(data.into_bytes())
            .await
            .map_err(ShellError::Pty),
        TerminalFrame::Resize { cols, rows } => process.resize(cols, rows).map_err(ShellError::Pty),
        frame => {
            debug!(target: "pier_shell::ws", ?frame, "ignoring server-to-client frame from client");
            Ok(())
        }
    }
}
