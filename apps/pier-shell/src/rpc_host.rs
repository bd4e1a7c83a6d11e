//! Terminal service over newline-delimited JSON-RPC on plain TCP.
//!
//! Terminals belong to the connection that spawned them: output and exit
//! notifications go only to that connection, and losing the connection
//! kills every terminal it owns.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use pier_proto::{
    methods, CloseParams, ConnectTmuxParams, ExitParams, InputParams, OutputParams, Request,
    ResizeParams, Response, ResponseOutcome, RpcErrorObject, SpawnParams, TerminalSession,
    TerminalSource, WireMessage, ERROR_INVALID_REQUEST, ERROR_METHOD_NOT_FOUND, ERROR_PARSE,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::ShellConfig;
use crate::error::ShellError;
use crate::pty::{join_or_abort, pump_output, Command, PtyProcess, PtyWriter, SpawnConfig};

pub const PROTOCOL_VERSION: u64 = 1;

/// Output pumps of killed terminals get this long to flush their exit
/// notifications before the connection's writer is torn down.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Accept connections forever, one task per client.
pub async fn serve(listener: TcpListener, config: Arc<ShellConfig>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await.context("accept rpc client")?;
        let config = config.clone();
        tokio::spawn(async move {
            info!(target: "pier_shell::rpc", %peer, "rpc client connected");
            if let Err(err) = handle_connection(socket, config).await {
                warn!(target: "pier_shell::rpc", %peer, error = %err, "rpc connection failed");
            }
            info!(target: "pier_shell::rpc", %peer, "rpc client disconnected");
        });
    }
}

async fn handle_connection(socket: TcpStream, config: Arc<ShellConfig>) -> Result<(), ShellError> {
    let (read, mut write) = socket.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let mut line = message.to_value().to_string();
            line.push('\n');
            if let Err(err) = write.write_all(line.as_bytes()).await {
                debug!(target: "pier_shell::rpc", error = %err, "write to rpc client failed");
                break;
            }
        }
    });

    let host = TerminalHost::new(config, outbound_tx);
    let mut lines = BufReader::new(read).lines();
    let outcome = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(reply) = host.handle_line(&line).await {
                    host.send(reply);
                }
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(ShellError::Io(err)),
        }
    };

    host.close_all();
    drop(host);
    join_or_abort(writer, DRAIN_GRACE).await;
    outcome
}

struct HostedTerminal {
    session: TerminalSession,
    process: Arc<PtyProcess>,
    writer: PtyWriter,
}

impl Drop for HostedTerminal {
    fn drop(&mut self) {
        self.process.shutdown();
    }
}

/// Per-connection terminal registry and method dispatcher.
pub struct TerminalHost {
    config: Arc<ShellConfig>,
    terminals: Arc<DashMap<String, HostedTerminal>>,
    outbound: mpsc::UnboundedSender<WireMessage>,
}

impl TerminalHost {
    pub fn new(config: Arc<ShellConfig>, outbound: mpsc::UnboundedSender<WireMessage>) -> Self {
        Self {
            config,
            terminals: Arc::new(DashMap::new()),
            outbound,
        }
    }

    fn send(&self, message: WireMessage) {
        let _ = self.outbound.send(message);
    }

    /// Handle one NDJSON line; returns the reply to send, if any.
    pub async fn handle_line(&self, line: &str) -> Option<WireMessage> {
        if line.trim().is_empty() {
            return None;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => return Some(WireMessage::error(None, ERROR_PARSE, err.to_string())),
        };
        match WireMessage::from_value(value) {
            Ok(WireMessage::Request(request)) => Some(self.respond(request).await),
            Ok(WireMessage::Notification(notification)) => {
                debug!(target: "pier_shell::rpc", method = %notification.method, "ignoring notification");
                None
            }
            Ok(WireMessage::Response(_)) => None,
            Err(err) => Some(WireMessage::error(None, ERROR_INVALID_REQUEST, err.to_string())),
        }
    }

    async fn respond(&self, request: Request) -> WireMessage {
        let params = request.params.unwrap_or(Value::Null);
        trace!(target: "pier_shell::rpc", method = %request.method, "request");
        let outcome = match self.dispatch(&request.method, params).await {
            Ok(result) => ResponseOutcome::Result(result),
            Err(error) => ResponseOutcome::Error(error),
        };
        WireMessage::Response(Response {
            id: Some(request.id),
            outcome,
        })
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject> {
        let result = match method {
            methods::INITIALIZE => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "agentCapabilities": {"terminal": true},
                "serverInfo": {"name": "pier-shell", "version": env!("CARGO_PKG_VERSION")}
            })),
            methods::TERMINAL_SPAWN => parse::<SpawnParams>(params)
                .and_then(|params| self.spawn(params))
                .map(|session| json!({ "terminal": session })),
            methods::TERMINAL_CONNECT_TMUX => parse::<ConnectTmuxParams>(params)
                .and_then(|params| self.connect_tmux(params))
                .map(|session| json!({ "terminal": session })),
            methods::TERMINAL_LIST => Ok(json!({ "terminals": self.list() })),
            methods::TERMINAL_INPUT => match parse::<InputParams>(params) {
                Ok(params) => self.input(params).await,
                Err(err) => Err(err),
            },
            methods::TERMINAL_RESIZE => {
                parse::<ResizeParams>(params).and_then(|params| self.resize(params))
            }
            methods::TERMINAL_CLOSE => {
                parse::<CloseParams>(params).and_then(|params| self.close(params))
            }
            other => {
                return Err(RpcErrorObject::new(
                    ERROR_METHOD_NOT_FOUND,
                    format!("method not found: {other}"),
                ));
            }
        };
        result.map_err(|err| err.to_rpc())
    }

    fn spawn(&self, params: SpawnParams) -> Result<TerminalSession, ShellError> {
        let command = self.config.shell_command(params.cwd.as_deref());
        let name = params.name.unwrap_or_else(|| self.config.shell_name());
        self.start(command, name, TerminalSource::Pty, params.cols, params.rows)
    }

    fn connect_tmux(&self, params: ConnectTmuxParams) -> Result<TerminalSession, ShellError> {
        if params.session.trim().is_empty() {
            return Err(ShellError::InvalidParams("tmux session name is empty".into()));
        }
        let command = Command::new("tmux")
            .args(["new-session", "-A", "-s", params.session.as_str()])
            .env("TERM", "xterm-256color");
        self.start(command, params.session, TerminalSource::Tmux, params.cols, params.rows)
    }

    fn start(
        &self,
        command: Command,
        name: String,
        source: TerminalSource,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> Result<TerminalSession, ShellError> {
        let spawn = SpawnConfig::new(
            command,
            cols.unwrap_or(self.config.cols),
            rows.unwrap_or(self.config.rows),
        );
        let (process, reader, writer) = PtyProcess::spawn(spawn).map_err(ShellError::Pty)?;
        let process = Arc::new(process);
        let session = TerminalSession {
            id: Uuid::new_v4().to_string(),
            name,
            source,
        };
        info!(target: "pier_shell::rpc", terminal_id = %session.id, name = %session.name, ?source, "terminal started");

        self.terminals.insert(
            session.id.clone(),
            HostedTerminal {
                session: session.clone(),
                process: process.clone(),
                writer,
            },
        );

        let terminal_id = session.id.clone();
        let outbound = self.outbound.clone();
        let terminals = self.terminals.clone();
        tokio::spawn(async move {
            let code = pump_output(reader, &process, |data| {
                outbound
                    .send(notification(
                        methods::TERMINAL_OUTPUT,
                        &OutputParams {
                            terminal_id: terminal_id.clone(),
                            data,
                        },
                    ))
                    .is_ok()
            })
            .await
            .unwrap_or(-1);
            debug!(target: "pier_shell::rpc", %terminal_id, code, "terminal exited");
            let _ = outbound.send(notification(
                methods::TERMINAL_EXIT,
                &ExitParams {
                    terminal_id: terminal_id.clone(),
                    code,
                },
            ));
            terminals.remove(&terminal_id);
        });

        Ok(session)
    }

    fn list(&self) -> Vec<TerminalSession> {
        let mut sessions: Vec<_> = self
            .terminals
            .iter()
            .map(|entry| entry.value().session.clone())
            .collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    async fn input(&self, params: InputParams) -> Result<Value, ShellError> {
        let writer = self.terminal(&params.terminal_id)?.writer.clone();
        writer
            .write_async(params.data.into_bytes())
            .await
            .map_err(ShellError::Pty)?;
        Ok(json!({}))
    }

    fn resize(&self, params: ResizeParams) -> Result<Value, ShellError> {
        let terminal = self.terminal(&params.terminal_id)?;
        terminal
            .process
            .resize(params.cols, params.rows)
            .map_err(ShellError::Pty)?;
        Ok(json!({}))
    }

    fn close(&self, params: CloseParams) -> Result<Value, ShellError> {
        match self.terminals.remove(&params.terminal_id) {
            Some(_) => {
                info!(target: "pier_shell::rpc", terminal_id = %params.terminal_id, "terminal closed");
                Ok(json!({}))
            }
            None => Err(ShellError::UnknownTerminal(params.terminal_id)),
        }
    }

    fn terminal(
        &self,
        terminal_id: &str,
    ) -> Result<dashmap::mapref::one::Ref<'_, String, HostedTerminal>, ShellError> {
        self.terminals
            .get(terminal_id)
            .ok_or_else(|| ShellError::UnknownTerminal(terminal_id.to_string()))
    }

    /// Kill every terminal this connection owns.
    pub fn close_all(&self) {
        let count = self.terminals.len();
        self.terminals.clear();
        if count > 0 {
            info!(target: "pier_shell::rpc", count, "killed terminals of closed connection");
        }
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, ShellError> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|err| ShellError::InvalidParams(err.to_string()))
}

fn notification<T: Serialize>(method: &str, params: &T) -> WireMessage {
    WireMessage::notification(method, serde_json::to_value(params).unwrap_or_default())
}
