use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pier_client_core::rpc::NotificationHandler;
use pier_client_core::{ClientConfig, ConnectionState, Endpoint, RpcClient};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

fn client_for(url: &str) -> RpcClient {
    let mut config = ClientConfig::new(Endpoint::parse(url).unwrap());
    config.fallback_port_offset = None;
    config.connect_timeout = Duration::from_secs(2);
    RpcClient::new(config)
}

fn collect_notifications(client: &RpcClient) -> mpsc::UnboundedReceiver<(String, Value)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn NotificationHandler> = Arc::new(move |method: &str, params: Value| {
        let _ = tx.send((method.to_string(), params));
    });
    client.set_notification_handler(handler);
    rx
}

#[tokio::test]
async fn tcp_reassembles_responses_split_across_writes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let request: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(request["method"], "initialize");

        let notification = json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {"text": "brace } inside \"quotes\" {"}
        })
        .to_string();
        let response = json!({"jsonrpc": "2.0", "id": request["id"], "result": {"ok": true}}).to_string();
        // Notification and response without newlines, split mid-object.
        let payload = format!("{notification}{response}");
        let (head, tail) = payload.split_at(payload.len() / 2);
        write.write_all(head.as_bytes()).await.unwrap();
        write.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        write.write_all(tail.as_bytes()).await.unwrap();
        write.flush().await.unwrap();
        // Hold the socket open until the client is done.
        let _ = lines.next_line().await;
    });

    let client = client_for(&format!("tcp://127.0.0.1:{port}"));
    let mut notifications = collect_notifications(&client);
    client.connect().unwrap();
    client.wait_connected().await.unwrap();

    let response = client.send_request("initialize", json!({})).await.unwrap();
    assert_eq!(response.result, json!({"ok": true}));
    let (method, params) = notifications.recv().await.unwrap();
    assert_eq!(method, "session/update");
    assert_eq!(params["text"], "brace } inside \"quotes\" {");

    client.shutdown();
    let _ = server.await;
}

#[tokio::test]
async fn tcp_sends_newline_terminated_json() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(socket).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = seen_tx.send(line);
        }
    });

    let client = client_for(&format!("tcp://127.0.0.1:{port}"));
    client.connect().unwrap();
    client.wait_connected().await.unwrap();
    client
        .send_notification("session/cancel", json!({"sessionId": "s1"}))
        .unwrap();

    let line = seen_rx.recv().await.unwrap();
    let sent: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(
        sent,
        json!({"jsonrpc": "2.0", "method": "session/cancel", "params": {"sessionId": "s1"}})
    );
    client.shutdown();
}

#[tokio::test]
async fn websocket_frame_may_carry_several_messages() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
        while let Some(Ok(frame)) = ws.next().await {
            let Message::Text(text) = frame else {
                continue;
            };
            let request: Value = serde_json::from_str(&text).unwrap();
            let notification = json!({"jsonrpc": "2.0", "method": "terminal/output", "params": {"terminalId": "t1", "data": "hi"}});
            let response = json!({"jsonrpc": "2.0", "id": request["id"], "result": request["params"]});
            ws.send(Message::Text(format!("{notification}\n{response}\n")))
                .await
                .unwrap();
        }
    });

    let client = client_for(&format!("ws://127.0.0.1:{port}"));
    let mut notifications = collect_notifications(&client);
    client.connect().unwrap();
    client.wait_connected().await.unwrap();

    let response = client
        .send_request("fs/list", json!({"path": "/"}))
        .await
        .unwrap();
    assert_eq!(response.result, json!({"path": "/"}));
    let (method, params) = notifications.recv().await.unwrap();
    assert_eq!(method, "terminal/output");
    assert_eq!(params["data"], "hi");
    client.shutdown();
}

#[tokio::test]
async fn websocket_close_from_peer_is_a_clean_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
        // Wait for the first request, then close without answering.
        let _ = ws.next().await;
        let _ = ws.close(None).await;
        while ws.next().await.is_some() {}
    });

    let client = client_for(&format!("ws://127.0.0.1:{port}"));
    client.connect().unwrap();
    client.wait_connected().await.unwrap();

    let outcome = client.send_request("session/list", json!({})).await;
    assert_eq!(outcome.unwrap_err(), pier_client_core::RpcError::Disconnected);

    let mut status = client.status();
    status
        .wait_for(|status| status.state == ConnectionState::Disconnected)
        .await
        .unwrap();
    client.shutdown();
}

#[tokio::test]
async fn refused_port_reports_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = client_for(&format!("tcp://127.0.0.1:{port}"));
    let mut events = client.service_events();
    client.connect().unwrap();

    loop {
        match events.recv().await.unwrap() {
            pier_client_core::ServiceEvent::RetryScheduled { attempt, .. } => {
                assert_eq!(attempt, 1);
                break;
            }
            _ => continue,
        }
    }
    assert_ne!(client.state(), ConnectionState::Connected);
    client.shutdown();
}
