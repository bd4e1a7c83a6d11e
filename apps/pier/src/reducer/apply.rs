//! Stage two of the reducer: fold actions into the transcript.

use super::action::Action;
use super::model::{ChatMessage, MessageSegment, ToolCallSegment};

/// Result of folding a batch of actions.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub messages: Vec<ChatMessage>,
    /// Id of the assistant message still open for streaming, if any.
    pub streaming_message_id: Option<String>,
    /// Set when the batch contained a stop.
    pub stop_reason: Option<String>,
}

/// Deterministic apart from freshly minted message ids and timestamps. An
/// empty batch returns the inputs untouched.
pub fn apply_actions(
    messages: Vec<ChatMessage>,
    actions: &[Action],
    streaming_message_id: Option<String>,
) -> Reduction {
    let mut fold = Fold {
        messages,
        cursor: streaming_message_id,
        stop_reason: None,
    };
    for action in actions {
        fold.apply(action);
    }
    Reduction {
        messages: fold.messages,
        streaming_message_id: fold.cursor,
        stop_reason: fold.stop_reason,
    }
}

struct Fold {
    messages: Vec<ChatMessage>,
    cursor: Option<String>,
    stop_reason: Option<String>,
}

impl Fold {
    fn apply(&mut self, action: &Action) {
        match action {
            Action::UserMessage { text } => {
                self.close_stream();
                self.messages.push(ChatMessage::user(text.clone()));
            }
            Action::AppendText { text } => {
                let index = self.open_stream(true);
                let message = &mut self.messages[index];
                message.content.push_str(text);
                match message.segments.last_mut() {
                    Some(MessageSegment::Text { content }) => content.push_str(text),
                    _ => message.segments.push(MessageSegment::Text {
                        content: text.clone(),
                    }),
                }
            }
            Action::ToolCall { id, name, input } => {
                let index = self.open_stream(false);
                let segments = &mut self.messages[index].segments;
                let repeated = match id {
                    Some(id) => segments.iter_mut().rev().find_map(|segment| match segment {
                        MessageSegment::ToolCall(call)
                            if !call.is_complete && call.tool_call_id.as_ref() == Some(id) =>
                        {
                            Some(call)
                        }
                        _ => None,
                    }),
                    None => None,
                };
                match repeated {
                    Some(call) => call.call_count = Some(call.call_count.unwrap_or(1) + 1),
                    None => segments.push(MessageSegment::ToolCall(ToolCallSegment::new(
                        id.clone(),
                        name.clone(),
                        input.clone(),
                    ))),
                }
            }
            Action::ToolResult { id, result } => {
                let Some(index) = self.stream_index() else {
                    return;
                };
                let segments = &mut self.messages[index].segments;
                if let Some(call) = find_incomplete_call(segments, id.as_deref()) {
                    let completed = call.completed_count.unwrap_or(0) + 1;
                    if call.call_count.is_some() {
                        call.completed_count = Some(completed);
                    }
                    if completed >= call.call_count.unwrap_or(1) {
                        call.result = Some(result.clone());
                        call.is_complete = true;
                    }
                }
            }
            Action::Thought { text } => {
                self.push_segment(MessageSegment::Thought {
                    content: text.clone(),
                });
            }
            Action::Image { url } => {
                self.push_segment(MessageSegment::Image { url: url.clone() });
            }
            Action::AgentEvent {
                event_type,
                label,
                detail,
            } => {
                self.push_segment(MessageSegment::AgentEvent {
                    event_type: event_type.clone(),
                    label: label.clone(),
                    detail: detail.clone(),
                });
            }
            Action::Stop { reason } => {
                self.close_stream();
                self.stop_reason = Some(reason.clone());
            }
        }
    }

    /// Index of the open assistant message. A cursor naming no streaming
    /// message counts as no stream and is cleared.
    fn stream_index(&mut self) -> Option<usize> {
        let id = self.cursor.as_deref()?;
        let found = self
            .messages
            .iter()
            .rposition(|message| message.is_streaming && message.id == id);
        if found.is_none() {
            self.cursor = None;
        }
        found
    }

    fn open_stream(&mut self, seed_text: bool) -> usize {
        if let Some(index) = self.stream_index() {
            return index;
        }
        let mut message = ChatMessage::streaming_assistant();
        if seed_text {
            message.segments.push(MessageSegment::Text {
                content: String::new(),
            });
        }
        self.cursor = Some(message.id.clone());
        self.messages.push(message);
        self.messages.len() - 1
    }

    fn close_stream(&mut self) {
        if let Some(index) = self.stream_index() {
            self.messages[index].is_streaming = false;
        }
        self.cursor = None;
    }

    fn push_segment(&mut self, segment: MessageSegment) {
        let index = self.open_stream(false);
        self.messages[index].segments.push(segment);
    }
}

/// The call a result belongs to: the incomplete call with the same id,
/// else the nearest incomplete call scanning backwards.
fn find_incomplete_call<'a>(
    segments: &'a mut [MessageSegment],
    id: Option<&str>,
) -> Option<&'a mut ToolCallSegment> {
    let by_id = id.and_then(|id| {
        segments.iter().rposition(|segment| {
            matches!(segment, MessageSegment::ToolCall(call)
                if !call.is_complete && call.tool_call_id.as_deref() == Some(id))
        })
    });
    let index = by_id.or_else(|| {
        segments.iter().rposition(
            |segment| matches!(segment, MessageSegment::ToolCall(call) if !call.is_complete),
        )
    })?;
    match &mut segments[index] {
        MessageSegment::ToolCall(call) => Some(call),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::model::Role;
    use serde_json::json;

    fn text(value: &str) -> Action {
        Action::AppendText { text: value.into() }
    }

    fn call(id: Option<&str>, name: &str) -> Action {
        Action::ToolCall {
            id: id.map(str::to_string),
            name: name.into(),
            input: json!({"path": "/tmp"}),
        }
    }

    fn result(id: Option<&str>, value: serde_json::Value) -> Action {
        Action::ToolResult {
            id: id.map(str::to_string),
            result: value,
        }
    }

    #[test]
    fn empty_batch_is_identity() {
        let messages = vec![ChatMessage::user("hi")];
        let reduction = apply_actions(messages.clone(), &[], Some("dangling".into()));
        assert_eq!(reduction.messages, messages);
        assert_eq!(reduction.streaming_message_id.as_deref(), Some("dangling"));
        assert_eq!(reduction.stop_reason, None);
    }

    #[test]
    fn streamed_text_then_stop() {
        let first = apply_actions(Vec::new(), &[text("Hello")], None);
        assert_eq!(first.messages.len(), 1);
        let open = &first.messages[0];
        assert_eq!(open.role, Role::Assistant);
        assert!(open.is_streaming);
        assert_eq!(first.streaming_message_id.as_deref(), Some(open.id.as_str()));

        let second = apply_actions(
            first.messages,
            &[text(" world"), Action::stop("end_turn")],
            first.streaming_message_id,
        );
        let message = &second.messages[0];
        assert_eq!(message.content, "Hello world");
        assert_eq!(
            message.segments,
            vec![MessageSegment::Text {
                content: "Hello world".into()
            }]
        );
        assert!(!message.is_streaming);
        assert_eq!(second.streaming_message_id, None);
        assert_eq!(second.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn user_message_closes_open_stream() {
        let reduction = apply_actions(
            Vec::new(),
            &[text("partial"), Action::UserMessage { text: "next".into() }],
            None,
        );
        assert_eq!(reduction.messages.len(), 2);
        assert!(!reduction.messages[0].is_streaming);
        assert_eq!(reduction.messages[1].role, Role::User);
        assert_eq!(reduction.streaming_message_id, None);
    }

    #[test]
    fn text_after_tool_call_starts_new_segment() {
        let reduction = apply_actions(
            Vec::new(),
            &[text("Looking"), call(Some("t1"), "ls"), text("Found it")],
            None,
        );
        let segments = &reduction.messages[0].segments;
        assert_eq!(segments.len(), 3);
        assert!(matches!(segments[1], MessageSegment::ToolCall(_)));
        assert_eq!(reduction.messages[0].content, "LookingFound it");
    }

    #[test]
    fn result_without_id_completes_nearest_open_call() {
        let reduction = apply_actions(
            Vec::new(),
            &[
                call(Some("a"), "read"),
                call(Some("b"), "write"),
                result(None, json!("ok")),
            ],
            None,
        );
        let calls: Vec<_> = reduction.messages[0].tool_calls().collect();
        assert!(!calls[0].is_complete);
        assert!(calls[1].is_complete);
        assert_eq!(calls[1].result, Some(json!("ok")));
    }

    #[test]
    fn result_by_id_reaches_earlier_call() {
        let reduction = apply_actions(
            Vec::new(),
            &[
                call(Some("a"), "read"),
                call(Some("b"), "write"),
                result(Some("a"), json!(1)),
            ],
            None,
        );
        let calls: Vec<_> = reduction.messages[0].tool_calls().collect();
        assert!(calls[0].is_complete);
        assert!(!calls[1].is_complete);
    }

    #[test]
    fn repeated_call_id_needs_every_result() {
        let reduction = apply_actions(
            Vec::new(),
            &[
                call(Some("t1"), "grep"),
                call(Some("t1"), "grep"),
                result(Some("t1"), json!("first")),
            ],
            None,
        );
        let segment = reduction.messages[0].tool_calls().next().cloned().unwrap();
        assert_eq!(segment.call_count, Some(2));
        assert_eq!(segment.completed_count, Some(1));
        assert!(!segment.is_complete);
        assert_eq!(segment.result, None);

        let done = apply_actions(
            reduction.messages,
            &[result(Some("t1"), json!("second"))],
            reduction.streaming_message_id,
        );
        let segment = done.messages[0].tool_calls().next().cloned().unwrap();
        assert!(segment.is_complete);
        assert_eq!(segment.completed_count, Some(2));
        assert_eq!(segment.result, Some(json!("second")));
    }

    #[test]
    fn result_without_open_stream_is_dropped() {
        let messages = vec![ChatMessage::user("hi")];
        let reduction = apply_actions(messages.clone(), &[result(None, json!(1))], None);
        assert_eq!(reduction.messages, messages);
    }

    #[test]
    fn stale_cursor_opens_fresh_message() {
        let reduction = apply_actions(Vec::new(), &[text("x")], Some("gone".into()));
        assert_eq!(reduction.messages.len(), 1);
        assert_ne!(reduction.streaming_message_id.as_deref(), Some("gone"));
    }

    #[test]
    fn thought_and_event_open_stream_without_text() {
        let reduction = apply_actions(
            Vec::new(),
            &[
                Action::Thought {
                    text: "hmm".into(),
                },
                Action::AgentEvent {
                    event_type: "mode".into(),
                    label: "Mode: code".into(),
                    detail: None,
                },
            ],
            None,
        );
        let message = &reduction.messages[0];
        assert_eq!(message.content, "");
        assert_eq!(message.segments.len(), 2);
        assert!(message.is_streaming);
    }
}
