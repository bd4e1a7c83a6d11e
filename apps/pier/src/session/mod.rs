//! Chat session controller: owns the active transcript, turns agent
//! notifications into transcript updates, and persists finished turns.

mod store;

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use pier_proto::methods;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::reducer::{apply_actions, notification_session_id, parse_notification, Action, ChatMessage};
use crate::rpc::RpcClient;
use crate::transport::ConnectionState;

pub use store::{InMemoryStore, MessageStore, SessionSummary};

pub const PROTOCOL_VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPhase {
    Idle,
    /// Prompt sent, nothing streamed back yet.
    Prompting,
    Streaming,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatSnapshot {
    pub session_id: Option<String>,
    pub phase: ChatPhase,
    pub messages: Vec<ChatMessage>,
    pub streaming_message_id: Option<String>,
    pub stop_reason: Option<String>,
    /// Link state when the snapshot was taken. Live changes come from
    /// [`RpcClient::status`].
    pub connection: ConnectionState,
}

/// Told about every transcript change. Called on the connection's event
/// task, so implementations must not block.
pub trait ChatObserver: Send + Sync {
    fn chat_changed(&self, snapshot: &ChatSnapshot);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, alias = "isDir")]
    pub is_directory: bool,
}

struct ChatState {
    session_id: Option<String>,
    messages: Vec<ChatMessage>,
    streaming_message_id: Option<String>,
    phase: ChatPhase,
    stop_reason: Option<String>,
    /// Bumped by every prompt, cancel and session switch. A prompt reply
    /// only closes the turn it was sent for.
    turn: u64,
}

impl ChatState {
    fn snapshot(&self, connection: ConnectionState) -> ChatSnapshot {
        ChatSnapshot {
            session_id: self.session_id.clone(),
            phase: self.phase,
            messages: self.messages.clone(),
            streaming_message_id: self.streaming_message_id.clone(),
            stop_reason: self.stop_reason.clone(),
            connection,
        }
    }
}

struct PersistJob {
    session_id: String,
    messages: Vec<ChatMessage>,
}

struct SessionInner {
    rpc: RpcClient,
    store: Arc<dyn MessageStore>,
    server_key: String,
    state: Mutex<ChatState>,
    observer: RwLock<Option<Arc<dyn ChatObserver>>>,
    persist: mpsc::UnboundedSender<PersistJob>,
}

#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

/// Non-owning handle for notification dispatch, so the RPC client's handler
/// does not keep the session alive.
#[derive(Clone)]
pub struct WeakChatSession(Weak<SessionInner>);

impl WeakChatSession {
    pub fn upgrade(&self) -> Option<ChatSession> {
        self.0.upgrade().map(|inner| ChatSession { inner })
    }
}

impl ChatSession {
    /// Must be called inside a Tokio runtime; spawns the persistence task.
    pub fn new(rpc: RpcClient, store: Arc<dyn MessageStore>, server_key: impl Into<String>) -> Self {
        let server_key = server_key.into();
        let (persist, jobs) = mpsc::unbounded_channel();
        tokio::spawn(run_persistence(store.clone(), server_key.clone(), jobs));
        Self {
            inner: Arc::new(SessionInner {
                rpc,
                store,
                server_key,
                state: Mutex::new(ChatState {
                    session_id: None,
                    messages: Vec::new(),
                    streaming_message_id: None,
                    phase: ChatPhase::Idle,
                    stop_reason: None,
                    turn: 0,
                }),
                observer: RwLock::new(None),
                persist,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakChatSession {
        WeakChatSession(Arc::downgrade(&self.inner))
    }

    pub fn set_observer(&self, observer: Arc<dyn ChatObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.inner.state.lock().snapshot(self.inner.rpc.state())
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.state.lock().messages.clone()
    }

    pub fn active_session_id(&self) -> Option<String> {
        self.inner.state.lock().session_id.clone()
    }

    pub fn phase(&self) -> ChatPhase {
        self.inner.state.lock().phase
    }

    pub async fn initialize(&self) -> Result<Value, SessionError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientCapabilities": {
                "fs": {"readTextFile": false, "writeTextFile": false},
                "terminal": true
            },
            "clientInfo": {"name": "pier", "version": env!("CARGO_PKG_VERSION")}
        });
        let response = self.inner.rpc.send_request(methods::INITIALIZE, params).await?;
        Ok(response.result)
    }

    /// Create a session on the agent and make it the active, empty one.
    pub async fn new_session(&self, cwd: &str) -> Result<String, SessionError> {
        let response = self
            .inner
            .rpc
            .send_request(methods::SESSION_NEW, json!({"cwd": cwd, "mcpServers": []}))
            .await?;
        let session_id = response
            .result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::InvalidResponse("session/new without sessionId".into()))?
            .to_string();
        info!(target: "pier::session", session_id = %session_id, "session created");
        self.activate(&session_id, Vec::new());
        Ok(session_id)
    }

    /// Ask the agent to replay `session_id` into an empty transcript.
    pub async fn load_session(&self, session_id: &str, cwd: &str) -> Result<(), SessionError> {
        self.activate(session_id, Vec::new());
        self.inner
            .rpc
            .send_request(
                methods::SESSION_LOAD,
                json!({"sessionId": session_id, "cwd": cwd, "mcpServers": []}),
            )
            .await?;
        self.finish_replay();
        Ok(())
    }

    /// Reattach to a live session without replay. The local transcript is
    /// kept when the session is already active, else restored from cache.
    pub async fn resume_session(&self, session_id: &str) -> Result<(), SessionError> {
        if self.active_session_id().as_deref() != Some(session_id) {
            let cached = self.cached_messages(session_id).await;
            self.activate(session_id, cached);
        }
        self.inner
            .rpc
            .send_request(methods::SESSION_RESUME, json!({"sessionId": session_id}))
            .await?;
        Ok(())
    }

    /// Switch to a session picked from the list: show the cached transcript
    /// at once, then resume it, or replay it when nothing is cached.
    pub async fn select_session(&self, session_id: &str, cwd: &str) -> Result<(), SessionError> {
        let cached = self.cached_messages(session_id).await;
        if cached.is_empty() {
            return self.load_session(session_id, cwd).await;
        }
        self.activate(session_id, cached);
        self.inner
            .rpc
            .send_request(methods::SESSION_RESUME, json!({"sessionId": session_id}))
            .await?;
        Ok(())
    }

    /// Sessions known to the agent. Falls back to the last cached list when
    /// the agent cannot be asked.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, SessionError> {
        match self
            .inner
            .rpc
            .send_request(methods::SESSION_LIST, json!({}))
            .await
        {
            Ok(response) => {
                let sessions = parse_sessions(response.result);
                if let Err(err) = self
                    .inner
                    .store
                    .save_sessions(&self.inner.server_key, &sessions)
                    .await
                {
                    warn!(target: "pier::session", error = %err, "failed to cache session list");
                }
                Ok(sessions)
            }
            Err(err) => {
                let cached = match self.inner.store.fetch_sessions(&self.inner.server_key).await {
                    Ok(cached) => cached,
                    Err(store_err) => {
                        warn!(target: "pier::session", error = %store_err, "failed to read cached session list");
                        Vec::new()
                    }
                };
                warn!(
                    target: "pier::session",
                    error = %err,
                    cached = cached.len(),
                    "session/list failed; serving cached list"
                );
                Ok(cached)
            }
        }
    }

    pub async fn set_mode(&self, mode_id: &str) -> Result<(), SessionError> {
        let session_id = self.require_session()?;
        self.inner
            .rpc
            .send_request(
                methods::SESSION_SET_MODE,
                json!({"sessionId": session_id, "modeId": mode_id}),
            )
            .await?;
        Ok(())
    }

    /// Send a prompt and wait for the turn to end. The user message is
    /// echoed into the transcript immediately; agent output streams in via
    /// notifications while this is pending. Returns the stop reason.
    pub async fn send_prompt(&self, text: &str) -> Result<String, SessionError> {
        let session_id = self.require_session()?;
        let turn = self.begin_turn(text);
        let outcome = self
            .inner
            .rpc
            .send_request(
                methods::SESSION_PROMPT,
                json!({
                    "sessionId": session_id,
                    "prompt": [{"type": "text", "text": text}]
                }),
            )
            .await;
        match outcome {
            Ok(response) => {
                let reason = response
                    .result
                    .get("stopReason")
                    .and_then(Value::as_str)
                    .unwrap_or("end_turn")
                    .to_string();
                self.end_turn(turn, &reason);
                Ok(reason)
            }
            Err(err) => {
                warn!(target: "pier::session", error = %err, "prompt failed");
                self.end_turn(turn, "error");
                Err(err.into())
            }
        }
    }

    /// Ask the agent to stop the current turn. The transcript closes the
    /// open message right away.
    pub fn cancel_prompt(&self) -> Result<(), SessionError> {
        let session_id = self.require_session()?;
        self.inner
            .rpc
            .send_notification(methods::SESSION_CANCEL, json!({"sessionId": session_id}))?;
        self.inner.state.lock().turn += 1;
        self.commit(&[Action::stop("cancelled")], None);
        Ok(())
    }

    pub async fn fs_list(&self, path: &str) -> Result<Vec<FsEntry>, SessionError> {
        let response = self
            .inner
            .rpc
            .send_request(methods::FS_LIST, json!({"path": path}))
            .await?;
        let entries = match response.result {
            Value::Object(mut map) => map.remove("entries").unwrap_or(Value::Array(Vec::new())),
            other => other,
        };
        serde_json::from_value(entries).map_err(|err| SessionError::InvalidResponse(err.to_string()))
    }

    /// Feed one `session/update` payload. Updates naming another session
    /// are ignored.
    pub fn handle_update(&self, params: &Value) {
        let active = self.active_session_id();
        if let (Some(incoming), Some(active)) = (notification_session_id(params), active.as_deref()) {
            if incoming != active {
                debug!(target: "pier::session", incoming, active, "ignoring update for inactive session");
                return;
            }
        }
        let actions = parse_notification(params);
        if actions.is_empty() {
            return;
        }
        self.commit(&actions, None);
    }

    fn require_session(&self) -> Result<String, SessionError> {
        self.active_session_id().ok_or(SessionError::NoActiveSession)
    }

    async fn cached_messages(&self, session_id: &str) -> Vec<ChatMessage> {
        match self
            .inner
            .store
            .fetch_messages(&self.inner.server_key, session_id)
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                warn!(target: "pier::session", error = %err, session_id, "failed to read cached transcript");
                Vec::new()
            }
        }
    }

    fn activate(&self, session_id: &str, messages: Vec<ChatMessage>) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            state.session_id = Some(session_id.to_string());
            state.messages = messages;
            state.streaming_message_id = None;
            state.phase = ChatPhase::Idle;
            state.stop_reason = None;
            state.turn += 1;
            state.snapshot(self.inner.rpc.state())
        };
        self.notify(&snapshot);
    }

    /// Close whatever the replay left open without recording a stop.
    fn finish_replay(&self) {
        let (snapshot, job) = {
            let mut state = self.inner.state.lock();
            if let Some(id) = state.streaming_message_id.take() {
                if let Some(message) = state.messages.iter_mut().find(|message| message.id == id) {
                    message.is_streaming = false;
                }
            }
            state.phase = ChatPhase::Idle;
            let job = state.session_id.clone().map(|session_id| PersistJob {
                session_id,
                messages: state.messages.clone(),
            });
            (state.snapshot(self.inner.rpc.state()), job)
        };
        self.notify(&snapshot);
        if let Some(job) = job {
            let _ = self.inner.persist.send(job);
        }
    }

    /// Echo the user's text and start a new turn; returns its token.
    fn begin_turn(&self, text: &str) -> u64 {
        let turn = {
            let mut state = self.inner.state.lock();
            state.turn += 1;
            state.turn
        };
        self.commit(
            &[Action::UserMessage {
                text: text.to_string(),
            }],
            Some(ChatPhase::Prompting),
        );
        turn
    }

    /// Close the turn with `reason` unless a cancel, a newer prompt or a
    /// session switch has superseded it.
    fn end_turn(&self, turn: u64, reason: &str) {
        self.apply(&[Action::stop(reason)], None, Some(turn));
    }

    fn commit(&self, actions: &[Action], phase: Option<ChatPhase>) {
        self.apply(actions, phase, None);
    }

    fn apply(&self, actions: &[Action], phase: Option<ChatPhase>, turn: Option<u64>) {
        let (snapshot, job) = {
            let mut state = self.inner.state.lock();
            if let Some(turn) = turn.filter(|turn| *turn != state.turn) {
                debug!(target: "pier::session", turn, current = state.turn, "ignoring reply to a superseded prompt");
                return;
            }
            let messages = std::mem::take(&mut state.messages);
            let cursor = state.streaming_message_id.take();
            let reduction = apply_actions(messages, actions, cursor);
            state.messages = reduction.messages;
            state.streaming_message_id = reduction.streaming_message_id;
            let mut job = None;
            if let Some(reason) = reduction.stop_reason {
                state.stop_reason = Some(reason);
                state.phase = ChatPhase::Idle;
                job = state.session_id.clone().map(|session_id| PersistJob {
                    session_id,
                    messages: state.messages.clone(),
                });
            } else if let Some(phase) = phase {
                state.phase = phase;
            } else if state.streaming_message_id.is_some() {
                state.phase = ChatPhase::Streaming;
            }
            (state.snapshot(self.inner.rpc.state()), job)
        };
        self.notify(&snapshot);
        if let Some(job) = job {
            let _ = self.inner.persist.send(job);
        }
    }

    fn notify(&self, snapshot: &ChatSnapshot) {
        let observer = self.inner.observer.read().clone();
        if let Some(observer) = observer {
            observer.chat_changed(snapshot);
        }
    }
}

async fn run_persistence(
    store: Arc<dyn MessageStore>,
    server_key: String,
    mut jobs: mpsc::UnboundedReceiver<PersistJob>,
) {
    while let Some(job) = jobs.recv().await {
        if let Err(err) = store
            .save_messages(&server_key, &job.session_id, &job.messages)
            .await
        {
            warn!(target: "pier::session", error = %err, session_id = %job.session_id, "failed to persist transcript");
        }
    }
}

fn parse_sessions(result: Value) -> Vec<SessionSummary> {
    let list = match result {
        Value::Object(mut map) => map.remove("sessions").unwrap_or(Value::Null),
        other => other,
    };
    let Value::Array(entries) = list else {
        return Vec::new();
    };
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<SessionSummary>(entry) {
            Ok(summary) => Some(summary),
            Err(err) => {
                debug!(target: "pier::session", error = %err, "skipping malformed session entry");
                None
            }
        })
        .collect()
}
