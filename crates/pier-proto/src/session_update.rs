//! Typed view over `session/update` notification params.
//!
//! Agents send two generations of payloads: the structured ACP shape
//! (`params.update.sessionUpdate` discriminator) and an older flat shape
//! where the presence of a field selects the meaning. Both are parsed into
//! closed enums here; anything unknown lands in an `Unrecognized` variant
//! instead of failing, so newer agents never break older apps.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePayload {
    Structured {
        session_id: Option<String>,
        update: SessionUpdate,
    },
    Legacy(LegacyUpdate),
}

impl UpdatePayload {
    /// Returns `None` only when `params` is not an object at all.
    pub fn parse(params: &Value) -> Option<Self> {
        if !params.is_object() {
            return None;
        }
        let session_id = string_field(params, &["sessionId", "session_id"]);
        let update = params.get("update");
        if let Some(kind) = update
            .and_then(|update| update.get("sessionUpdate"))
            .and_then(Value::as_str)
        {
            let update = update.unwrap_or(&Value::Null);
            return Some(UpdatePayload::Structured {
                session_id,
                update: SessionUpdate::parse(kind, update),
            });
        }
        let flat = match update {
            Some(inner) if inner.is_object() => inner,
            _ => params,
        };
        Some(UpdatePayload::Legacy(LegacyUpdate::parse(flat)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    UserMessageChunk(ContentBlock),
    AgentMessageChunk(ContentBlock),
    AgentThoughtChunk { text: String },
    AgentMessageStart,
    AgentMessageEnd,
    ToolCallStart(ToolInvocation),
    ToolCallEnd(ToolOutcome),
    AgentEvent(AgentEvent),
    Unrecognized { kind: String },
}

impl SessionUpdate {
    pub fn parse(kind: &str, update: &Value) -> Self {
        let content = update.get("content").unwrap_or(&Value::Null);
        match kind {
            "user_message_chunk" => SessionUpdate::UserMessageChunk(ContentBlock::parse(content)),
            "agent_message_chunk" => SessionUpdate::AgentMessageChunk(ContentBlock::parse(content)),
            "agent_thought_chunk" => {
                let text = string_field(update, &["text"])
                    .or_else(|| string_field(content, &["text", "thought"]))
                    .or_else(|| content.as_str().map(str::to_string))
                    .unwrap_or_default();
                SessionUpdate::AgentThoughtChunk { text }
            }
            "agent_message_start" => SessionUpdate::AgentMessageStart,
            "agent_message_end" => SessionUpdate::AgentMessageEnd,
            "tool_call_start" | "tool_call" => {
                SessionUpdate::ToolCallStart(ToolInvocation::parse(update))
            }
            "tool_call_end" => SessionUpdate::ToolCallEnd(ToolOutcome::parse(update)),
            "tool_call_update" => match update.get("status").and_then(Value::as_str) {
                Some("completed" | "failed") => {
                    SessionUpdate::ToolCallEnd(ToolOutcome::parse(update))
                }
                _ => SessionUpdate::Unrecognized {
                    kind: kind.to_string(),
                },
            },
            "plan" => SessionUpdate::AgentEvent(AgentEvent::plan(update)),
            "current_mode_update" => SessionUpdate::AgentEvent(AgentEvent::mode(update)),
            "available_commands_update" => {
                SessionUpdate::AgentEvent(AgentEvent::commands(update))
            }
            other => SessionUpdate::Unrecognized {
                kind: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text { text: String },
    ToolCall(ToolInvocation),
    ToolResult(ToolOutcome),
    Thought { text: String },
    Image { url: String },
    Unrecognized { kind: String },
}

impl ContentBlock {
    pub fn parse(content: &Value) -> Self {
        if let Some(text) = content.as_str() {
            return ContentBlock::Text {
                text: text.to_string(),
            };
        }
        let kind = content.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "text" => ContentBlock::Text {
                text: string_field(content, &["text"]).unwrap_or_default(),
            },
            "tool_call" | "toolCall" => ContentBlock::ToolCall(ToolInvocation::parse(content)),
            "tool_result" | "toolResult" => ContentBlock::ToolResult(ToolOutcome::parse(content)),
            "thought" => ContentBlock::Thought {
                text: string_field(content, &["text", "thought"]).unwrap_or_default(),
            },
            "image" => match image_url(content) {
                Some(url) => ContentBlock::Image { url },
                None => ContentBlock::Unrecognized {
                    kind: kind.to_string(),
                },
            },
            other => ContentBlock::Unrecognized {
                kind: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: Option<String>,
    pub name: String,
    pub input: Value,
}

impl ToolInvocation {
    pub fn parse(value: &Value) -> Self {
        Self {
            id: string_field(value, &["toolCallId", "toolUseId", "id"]),
            name: string_field(value, &["toolName", "name", "title", "kind"])
                .unwrap_or_else(|| "tool".to_string()),
            input: first_field(value, &["input", "rawInput", "arguments", "args"])
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub id: Option<String>,
    pub result: Value,
}

impl ToolOutcome {
    pub fn parse(value: &Value) -> Self {
        if !value.is_object() {
            return Self {
                id: None,
                result: value.clone(),
            };
        }
        Self {
            id: string_field(value, &["toolCallId", "toolUseId", "id"]),
            result: first_field(value, &["result", "rawOutput", "output", "content"])
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentEvent {
    pub event_type: String,
    pub label: String,
    pub detail: Option<String>,
}

impl AgentEvent {
    fn plan(update: &Value) -> Self {
        let entries: Vec<String> = update
            .get("entries")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| string_field(entry, &["content", "title"]))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            event_type: "plan".into(),
            label: format!("Plan ({} steps)", entries.len()),
            detail: (!entries.is_empty()).then(|| entries.join("\n")),
        }
    }

    fn mode(update: &Value) -> Self {
        let mode = string_field(update, &["currentModeId", "modeId"]).unwrap_or_default();
        Self {
            event_type: "mode".into(),
            label: format!("Mode: {mode}"),
            detail: None,
        }
    }

    fn commands(update: &Value) -> Self {
        let names: Vec<String> = update
            .get("availableCommands")
            .and_then(Value::as_array)
            .map(|commands| {
                commands
                    .iter()
                    .filter_map(|command| string_field(command, &["name"]))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            event_type: "commands".into(),
            label: format!("{} commands available", names.len()),
            detail: (!names.is_empty()).then(|| names.join(", ")),
        }
    }
}

/// The pre-ACP flat payload. Every field is optional; the reducer decides
/// which actions the present fields produce.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyUpdate {
    pub kind: Option<String>,
    pub text: Option<String>,
    pub tool_call: Option<ToolInvocation>,
    pub tool_result: Option<ToolOutcome>,
    pub thought: Option<String>,
    pub stop_reason: Option<String>,
    pub message_content: Option<String>,
}

impl LegacyUpdate {
    pub fn parse(value: &Value) -> Self {
        Self {
            kind: string_field(value, &["kind"]),
            text: string_field(value, &["text"]),
            tool_call: value
                .get("toolCall")
                .filter(|call| call.is_object())
                .map(ToolInvocation::parse),
            tool_result: value
                .get("toolResult")
                .filter(|result| !result.is_null())
                .map(ToolOutcome::parse),
            thought: string_field(value, &["thought"]),
            stop_reason: string_field(value, &["stopReason"]),
            message_content: value
                .get("message")
                .and_then(|message| message.get("content"))
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

fn first_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|candidate| !candidate.is_null())
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(Value::as_str)
        .map(str::to_string)
}

fn image_url(content: &Value) -> Option<String> {
    if let Some(url) = string_field(content, &["url", "uri"]) {
        return Some(url);
    }
    let data = string_field(content, &["data"])?;
    let mime = string_field(content, &["mimeType"]).unwrap_or_else(|| "image/png".into());
    Some(format!("data:{mime};base64,{data}"))
}
