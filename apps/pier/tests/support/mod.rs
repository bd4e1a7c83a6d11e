#![allow(dead_code)]

use std::sync::Arc;

use pier_client_core::transport::mock::{MockFactory, MockTransport};
use pier_client_core::{ClientConfig, Endpoint, RpcClient};
use pier_proto::{Notification, Request, WireMessage};
use serde_json::Value;

pub const AGENT_URL: &str = "ws://agent.test:8765";

pub fn config(url: &str) -> ClientConfig {
    ClientConfig::new(Endpoint::parse(url).expect("test endpoint"))
}

pub async fn connected_client() -> (RpcClient, Arc<MockFactory>, Arc<MockTransport>) {
    let factory = MockFactory::new();
    let client = RpcClient::with_factory(config(AGENT_URL), factory.clone());
    client.connect().expect("connect");
    client.wait_connected().await.expect("connected");
    let agent = factory.latest().expect("transport created");
    (client, factory, agent)
}

pub fn expect_request(message: Option<WireMessage>) -> Request {
    match message {
        Some(WireMessage::Request(request)) => request,
        other => panic!("expected request, got {other:?}"),
    }
}

pub fn expect_notification(message: Option<WireMessage>) -> Notification {
    match message {
        Some(WireMessage::Notification(notification)) => notification,
        other => panic!("expected notification, got {other:?}"),
    }
}

pub fn params(request: &Request) -> Value {
    request.params.clone().unwrap_or(Value::Null)
}
