mod support;

use std::sync::Arc;
use std::time::Duration;

use pier_client_core::reducer::{MessageSegment, Role};
use pier_client_core::session::{ChatPhase, InMemoryStore, MessageStore, SessionSummary};
use pier_client_core::transport::mock::{MockFactory, MockTransport};
use pier_client_core::{AgentConnection, SessionError};
use pier_proto::{WireMessage, ERROR_INTERNAL};
use serde_json::{json, Value};

use support::{config, expect_notification, expect_request, params, AGENT_URL};

struct Harness {
    connection: AgentConnection,
    agent: Arc<MockTransport>,
    store: Arc<InMemoryStore>,
}

async fn harness() -> Harness {
    let factory = MockFactory::new();
    let store = Arc::new(InMemoryStore::new());
    let connection = AgentConnection::with_factory(config(AGENT_URL), factory.clone(), store.clone());
    connection.rpc().connect().unwrap();
    connection.rpc().wait_connected().await.unwrap();
    let agent = factory.latest().unwrap();
    Harness {
        connection,
        agent,
        store,
    }
}

fn update(session_id: &str, update: Value) -> WireMessage {
    WireMessage::notification(
        "session/update",
        json!({"sessionId": session_id, "update": update}),
    )
}

fn text_chunk(session_id: &str, text: &str) -> WireMessage {
    update(
        session_id,
        json!({"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": text}}),
    )
}

impl Harness {
    /// Answer `session/new` with `session_id`.
    async fn open_session(&self, session_id: &str) {
        let chat = self.connection.chat().clone();
        let created = tokio::spawn(async move { chat.new_session("/work").await });
        let request = expect_request(self.agent.next_sent().await);
        assert_eq!(request.method, "session/new");
        assert_eq!(params(&request)["cwd"], "/work");
        self.agent
            .inject(WireMessage::result(request.id, json!({"sessionId": session_id})));
        assert_eq!(created.await.unwrap().unwrap(), session_id);
    }

    async fn wait_for_phase(&self, phase: ChatPhase) {
        for _ in 0..200 {
            if self.connection.chat().phase() == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("chat never reached {phase:?}");
    }

    async fn persisted(&self, session_id: &str) -> Vec<pier_client_core::reducer::ChatMessage> {
        let server_key = self.connection.rpc().config().server_key();
        for _ in 0..100 {
            let saved = self.store.fetch_messages(&server_key, session_id).await.unwrap();
            if !saved.is_empty() {
                return saved;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transcript for {session_id} was never persisted");
    }
}

#[tokio::test]
async fn prompt_streams_reply_and_persists_turn() {
    let h = harness().await;
    h.open_session("s1").await;

    let chat = h.connection.chat().clone();
    let prompt = tokio::spawn(async move { chat.send_prompt("hi").await });

    let request = expect_request(h.agent.next_sent().await);
    assert_eq!(request.method, "session/prompt");
    assert_eq!(
        params(&request),
        json!({"sessionId": "s1", "prompt": [{"type": "text", "text": "hi"}]})
    );
    assert_eq!(h.connection.chat().phase(), ChatPhase::Prompting);

    h.agent.inject(text_chunk("s1", "Hello"));
    h.agent.inject(text_chunk("s1", " world"));
    h.agent
        .inject(WireMessage::result(request.id, json!({"stopReason": "end_turn"})));

    assert_eq!(prompt.await.unwrap().unwrap(), "end_turn");

    let snapshot = h.connection.chat().snapshot();
    assert_eq!(snapshot.phase, ChatPhase::Idle);
    assert_eq!(snapshot.stop_reason.as_deref(), Some("end_turn"));
    assert_eq!(snapshot.streaming_message_id, None);
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(snapshot.messages[0].role, Role::User);
    assert_eq!(snapshot.messages[0].content, "hi");
    assert_eq!(snapshot.messages[1].role, Role::Assistant);
    assert_eq!(snapshot.messages[1].content, "Hello world");
    assert!(!snapshot.messages[1].is_streaming);

    let saved = h.persisted("s1").await;
    assert_eq!(saved, snapshot.messages);
}

#[tokio::test]
async fn tool_calls_and_results_land_in_one_message() {
    let h = harness().await;
    h.open_session("s1").await;

    h.agent.inject(update(
        "s1",
        json!({"sessionUpdate": "tool_call", "toolCallId": "t1", "title": "read", "rawInput": {"path": "a.rs"}}),
    ));
    h.agent.inject(text_chunk("s1", "checking"));
    h.agent.inject(update(
        "s1",
        json!({"sessionUpdate": "tool_call_update", "toolCallId": "t1", "status": "completed", "rawOutput": "ok"}),
    ));
    h.agent
        .inject(update("s1", json!({"sessionUpdate": "agent_message_end"})));

    // An unrelated round trip orders the assertions after the updates.
    let chat = h.connection.chat().clone();
    let listing = tokio::spawn(async move { chat.fs_list("/").await });
    let request = expect_request(h.agent.next_sent().await);
    h.agent.inject(WireMessage::result(
        request.id,
        json!({"entries": [{"name": "src", "isDir": true}]}),
    ));
    let entries = listing.await.unwrap().unwrap();
    assert!(entries[0].is_directory);

    let messages = h.connection.chat().messages();
    assert_eq!(messages.len(), 1);
    let reply = &messages[0];
    assert!(!reply.is_streaming);
    assert_eq!(reply.content, "checking");
    let calls: Vec<_> = reply.tool_calls().collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].tool_name, "read");
    assert_eq!(calls[0].result, Some(json!("ok")));
    assert!(calls[0].is_complete);
    assert!(matches!(
        reply.segments.last(),
        Some(MessageSegment::Text { content }) if content == "checking"
    ));
}

#[tokio::test]
async fn updates_for_other_sessions_are_ignored() {
    let h = harness().await;
    h.open_session("s1").await;

    h.agent.inject(text_chunk("other", "not for us"));
    h.agent.inject(text_chunk("s1", "for us"));

    let chat = h.connection.chat().clone();
    let listing = tokio::spawn(async move { chat.fs_list("/").await });
    let request = expect_request(h.agent.next_sent().await);
    h.agent.inject(WireMessage::result(request.id, json!([])));
    assert!(listing.await.unwrap().unwrap().is_empty());

    let messages = h.connection.chat().messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "for us");
}

#[tokio::test]
async fn cancel_closes_the_turn_locally_and_notifies_agent() {
    let h = harness().await;
    h.open_session("s1").await;

    let chat = h.connection.chat().clone();
    let prompt = tokio::spawn(async move { chat.send_prompt("long task").await });
    let request = expect_request(h.agent.next_sent().await);
    h.agent.inject(text_chunk("s1", "working"));

    h.wait_for_phase(ChatPhase::Streaming).await;
    h.connection.chat().cancel_prompt().unwrap();

    let cancel = expect_notification(h.agent.next_sent().await);
    assert_eq!(cancel.method, "session/cancel");
    assert_eq!(cancel.params, Some(json!({"sessionId": "s1"})));
    let snapshot = h.connection.chat().snapshot();
    assert_eq!(snapshot.stop_reason.as_deref(), Some("cancelled"));
    assert!(snapshot.messages.iter().all(|message| !message.is_streaming));

    h.agent
        .inject(WireMessage::result(request.id, json!({"stopReason": "cancelled"})));
    assert_eq!(prompt.await.unwrap().unwrap(), "cancelled");
}

#[tokio::test]
async fn late_reply_to_cancelled_prompt_leaves_next_turn_open() {
    let h = harness().await;
    h.open_session("s1").await;

    let chat = h.connection.chat().clone();
    let first = tokio::spawn(async move { chat.send_prompt("A").await });
    let first_request = expect_request(h.agent.next_sent().await);
    h.agent.inject(text_chunk("s1", "a-out"));
    h.wait_for_phase(ChatPhase::Streaming).await;
    h.connection.chat().cancel_prompt().unwrap();
    expect_notification(h.agent.next_sent().await);

    let chat = h.connection.chat().clone();
    let second = tokio::spawn(async move { chat.send_prompt("B").await });
    let second_request = expect_request(h.agent.next_sent().await);
    h.agent.inject(text_chunk("s1", "b-part1"));
    h.wait_for_phase(ChatPhase::Streaming).await;

    h.agent.inject(WireMessage::result(
        first_request.id,
        json!({"stopReason": "cancelled"}),
    ));
    assert_eq!(first.await.unwrap().unwrap(), "cancelled");
    assert_eq!(h.connection.chat().phase(), ChatPhase::Streaming);

    h.agent.inject(text_chunk("s1", " b-part2"));
    h.agent.inject(WireMessage::result(
        second_request.id,
        json!({"stopReason": "end_turn"}),
    ));
    assert_eq!(second.await.unwrap().unwrap(), "end_turn");

    let transcript: Vec<_> = h
        .connection
        .chat()
        .messages()
        .iter()
        .map(|message| (message.content.clone(), message.is_streaming))
        .collect();
    assert_eq!(
        transcript,
        [
            ("A".to_string(), false),
            ("a-out".to_string(), false),
            ("B".to_string(), false),
            ("b-part1 b-part2".to_string(), false),
        ]
    );
}

#[tokio::test]
async fn failed_prompt_ends_stream_with_error() {
    let h = harness().await;
    h.open_session("s1").await;

    let chat = h.connection.chat().clone();
    let prompt = tokio::spawn(async move { chat.send_prompt("boom").await });
    let request = expect_request(h.agent.next_sent().await);
    h.agent.inject(text_chunk("s1", "partial"));
    h.agent
        .inject(WireMessage::error(Some(request.id), ERROR_INTERNAL, "agent crashed"));

    assert!(matches!(prompt.await.unwrap(), Err(SessionError::Rpc(_))));
    let snapshot = h.connection.chat().snapshot();
    assert_eq!(snapshot.phase, ChatPhase::Idle);
    assert_eq!(snapshot.stop_reason.as_deref(), Some("error"));
    assert_eq!(snapshot.messages[1].content, "partial");
    assert!(!snapshot.messages[1].is_streaming);
}

#[tokio::test]
async fn prompt_without_session_is_rejected() {
    let h = harness().await;
    assert!(matches!(
        h.connection.chat().send_prompt("hi").await,
        Err(SessionError::NoActiveSession)
    ));
    assert!(h.agent.try_next_sent().is_none());
}

#[tokio::test]
async fn session_list_falls_back_to_cache() {
    let h = harness().await;

    let chat = h.connection.chat().clone();
    let first = tokio::spawn(async move { chat.list_sessions().await });
    let request = expect_request(h.agent.next_sent().await);
    assert_eq!(request.method, "session/list");
    h.agent.inject(WireMessage::result(
        request.id,
        json!({"sessions": [{"sessionId": "s1", "title": "refactor"}, {"sessionId": "s2"}]}),
    ));
    let sessions = first.await.unwrap().unwrap();
    assert_eq!(
        sessions[0],
        SessionSummary {
            session_id: "s1".into(),
            title: Some("refactor".into()),
            cwd: None,
            updated_at: None,
        }
    );

    let chat = h.connection.chat().clone();
    let second = tokio::spawn(async move { chat.list_sessions().await });
    let request = expect_request(h.agent.next_sent().await);
    h.agent
        .inject(WireMessage::error(Some(request.id), ERROR_INTERNAL, "unavailable"));
    assert_eq!(second.await.unwrap().unwrap(), sessions);
}

#[tokio::test]
async fn failed_session_list_without_cache_is_empty() {
    let h = harness().await;

    let chat = h.connection.chat().clone();
    let listing = tokio::spawn(async move { chat.list_sessions().await });
    let request = expect_request(h.agent.next_sent().await);
    assert_eq!(request.method, "session/list");
    h.agent
        .inject(WireMessage::error(Some(request.id), ERROR_INTERNAL, "down"));
    assert_eq!(listing.await.unwrap().unwrap(), Vec::<SessionSummary>::new());
}

#[tokio::test]
async fn load_replays_history_into_empty_transcript() {
    let h = harness().await;

    let chat = h.connection.chat().clone();
    let load = tokio::spawn(async move { chat.select_session("old", "/work").await });
    let request = expect_request(h.agent.next_sent().await);
    assert_eq!(request.method, "session/load");
    assert_eq!(params(&request)["sessionId"], "old");

    h.agent.inject(update(
        "old",
        json!({"sessionUpdate": "user_message_chunk", "content": {"type": "text", "text": "earlier question"}}),
    ));
    h.agent.inject(text_chunk("old", "earlier answer"));
    h.agent.inject(WireMessage::result(request.id, Value::Null));
    load.await.unwrap().unwrap();

    let snapshot = h.connection.chat().snapshot();
    assert_eq!(snapshot.session_id.as_deref(), Some("old"));
    assert_eq!(snapshot.phase, ChatPhase::Idle);
    let contents: Vec<_> = snapshot.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["earlier question", "earlier answer"]);
    assert!(snapshot.messages.iter().all(|message| !message.is_streaming));

    // Cached now, so selecting again resumes instead of replaying.
    h.persisted("old").await;
    let chat = h.connection.chat().clone();
    let again = tokio::spawn(async move { chat.select_session("old", "/work").await });
    let request = expect_request(h.agent.next_sent().await);
    assert_eq!(request.method, "session/resume");
    assert_eq!(h.connection.chat().messages().len(), 2);
    h.agent.inject(WireMessage::result(request.id, Value::Null));
    again.await.unwrap().unwrap();
}
