use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallSegment {
    pub tool_name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub is_complete: bool,
    /// Set once the same call id has been started more than once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ToolCallSegment {
    pub fn new(tool_call_id: Option<String>, tool_name: String, input: Value) -> Self {
        Self {
            tool_name,
            input,
            result: None,
            is_complete: false,
            call_count: None,
            completed_count: None,
            tool_call_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageSegment {
    Text {
        content: String,
    },
    ToolCall(ToolCallSegment),
    Thought {
        content: String,
    },
    Image {
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    Artifact {
        artifact_id: String,
    },
    #[serde(rename_all = "camelCase")]
    AgentEvent {
        event_type: String,
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    /// Concatenation of the text segments, kept for previews and search.
    pub content: String,
    pub segments: Vec<MessageSegment>,
    pub is_streaming: bool,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: new_message_id(),
            role: Role::User,
            segments: vec![MessageSegment::Text {
                content: text.clone(),
            }],
            content: text,
            is_streaming: false,
            timestamp: now_millis(),
        }
    }

    /// An open assistant message with no segments yet.
    pub fn streaming_assistant() -> Self {
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            content: String::new(),
            segments: Vec::new(),
            is_streaming: true,
            timestamp: now_millis(),
        }
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallSegment> {
        self.segments.iter().filter_map(|segment| match segment {
            MessageSegment::ToolCall(call) => Some(call),
            _ => None,
        })
    }
}

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
