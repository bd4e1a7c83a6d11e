//! Turns the agent's `session/update` stream into a chat transcript.
//!
//! [`parse_notification`] maps one payload to actions; [`apply_actions`]
//! folds actions into the message list. Both are pure so the session
//! controller can replay and test them without a connection.

mod action;
mod apply;
mod model;

pub use action::{notification_session_id, parse_notification, Action};
pub use apply::{apply_actions, Reduction};
pub use model::{new_message_id, now_millis, ChatMessage, MessageSegment, Role, ToolCallSegment};
