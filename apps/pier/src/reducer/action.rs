//! Stage one of the reducer: turn one `session/update` payload into a flat
//! list of actions. No state is consulted here.

use pier_proto::{
    AgentEvent, ContentBlock, LegacyUpdate, SessionUpdate, ToolInvocation, ToolOutcome,
    UpdatePayload,
};
use serde_json::Value;
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    UserMessage {
        text: String,
    },
    AppendText {
        text: String,
    },
    ToolCall {
        id: Option<String>,
        name: String,
        input: Value,
    },
    ToolResult {
        id: Option<String>,
        result: Value,
    },
    Thought {
        text: String,
    },
    Image {
        url: String,
    },
    AgentEvent {
        event_type: String,
        label: String,
        detail: Option<String>,
    },
    Stop {
        reason: String,
    },
}

impl Action {
    pub fn stop(reason: impl Into<String>) -> Self {
        Action::Stop {
            reason: reason.into(),
        }
    }
}

impl From<ToolInvocation> for Action {
    fn from(call: ToolInvocation) -> Self {
        Action::ToolCall {
            id: call.id,
            name: call.name,
            input: call.input,
        }
    }
}

impl From<ToolOutcome> for Action {
    fn from(outcome: ToolOutcome) -> Self {
        Action::ToolResult {
            id: outcome.id,
            result: outcome.result,
        }
    }
}

impl From<AgentEvent> for Action {
    fn from(event: AgentEvent) -> Self {
        Action::AgentEvent {
            event_type: event.event_type,
            label: event.label,
            detail: event.detail,
        }
    }
}

/// Session id named by the payload, if any.
pub fn notification_session_id(params: &Value) -> Option<&str> {
    params
        .get("sessionId")
        .or_else(|| params.get("session_id"))
        .and_then(Value::as_str)
}

/// Unknown or empty payloads yield no actions.
pub fn parse_notification(params: &Value) -> Vec<Action> {
    match UpdatePayload::parse(params) {
        Some(UpdatePayload::Structured { update, .. }) => structured_actions(update),
        Some(UpdatePayload::Legacy(legacy)) => legacy_actions(legacy),
        None => Vec::new(),
    }
}

fn structured_actions(update: SessionUpdate) -> Vec<Action> {
    match update {
        SessionUpdate::UserMessageChunk(ContentBlock::Text { text }) => {
            vec![Action::UserMessage { text }]
        }
        SessionUpdate::UserMessageChunk(other) => {
            trace!(target: "pier::reducer", block = ?other, "ignoring non-text user chunk");
            Vec::new()
        }
        SessionUpdate::AgentMessageChunk(block) => content_actions(block),
        SessionUpdate::AgentThoughtChunk { text } => vec![Action::Thought { text }],
        SessionUpdate::AgentMessageStart => Vec::new(),
        SessionUpdate::AgentMessageEnd => vec![Action::stop("end_turn")],
        SessionUpdate::ToolCallStart(call) => vec![call.into()],
        SessionUpdate::ToolCallEnd(outcome) => vec![outcome.into()],
        SessionUpdate::AgentEvent(event) => vec![event.into()],
        SessionUpdate::Unrecognized { kind } => {
            trace!(target: "pier::reducer", kind = %kind, "ignoring unrecognized session update");
            Vec::new()
        }
    }
}

fn content_actions(block: ContentBlock) -> Vec<Action> {
    match block {
        ContentBlock::Text { text } => vec![Action::AppendText { text }],
        ContentBlock::ToolCall(call) => vec![call.into()],
        ContentBlock::ToolResult(outcome) => vec![outcome.into()],
        ContentBlock::Thought { text } => vec![Action::Thought { text }],
        ContentBlock::Image { url } => vec![Action::Image { url }],
        ContentBlock::Unrecognized { kind } => {
            trace!(target: "pier::reducer", kind = %kind, "ignoring unrecognized content block");
            Vec::new()
        }
    }
}

fn legacy_actions(legacy: LegacyUpdate) -> Vec<Action> {
    let mut actions = Vec::new();
    let kind = legacy.kind.as_deref();

    if let Some(text) = legacy.text {
        actions.push(match kind {
            Some("user_message" | "user") => Action::UserMessage { text },
            Some("thought") => Action::Thought { text },
            _ => Action::AppendText { text },
        });
    }
    if let Some(call) = legacy.tool_call {
        actions.push(call.into());
    }
    if let Some(outcome) = legacy.tool_result {
        actions.push(outcome.into());
    }
    if let Some(text) = legacy.thought {
        actions.push(Action::Thought { text });
    }
    match legacy.stop_reason {
        Some(reason) => actions.push(Action::Stop { reason }),
        None if matches!(kind, Some("stop" | "end_turn")) => actions.push(Action::stop("end_turn")),
        None => {}
    }
    if actions.is_empty() {
        if let Some(text) = legacy.message_content {
            actions.push(Action::AppendText { text });
        }
    }
    actions
}
