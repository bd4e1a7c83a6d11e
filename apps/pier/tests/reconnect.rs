mod support;

use std::time::Duration;

use pier_client_core::transport::mock::{ConnectOutcome, MockFactory};
use pier_client_core::{ConnectionState, Endpoint, RpcClient, RpcError, ServiceEvent};
use tokio::sync::broadcast;
use tokio::time::Instant;

use support::config;

fn drain(events: &mut broadcast::Receiver<ServiceEvent>) -> Vec<ServiceEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn scheduled(events: &[ServiceEvent]) -> Vec<(u32, Duration)> {
    events
        .iter()
        .filter_map(|event| match event {
            ServiceEvent::RetryScheduled { attempt, delay } => Some((*attempt, *delay)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn refused_endpoint_backs_off_then_gives_up() {
    let factory = MockFactory::new();
    let endpoint = Endpoint::parse("ws://agent.test:8765").unwrap();
    factory.script(&endpoint, [ConnectOutcome::Refuse; 4]);
    let client = RpcClient::with_factory(config("ws://agent.test:8765"), factory.clone());
    let mut events = client.service_events();

    let started = Instant::now();
    client.connect().unwrap();
    let outcome = client.wait_connected().await;

    assert_eq!(outcome, Err(RpcError::RetryExhausted { attempts: 3 }));
    assert_eq!(factory.attempts().len(), 4);
    assert!(started.elapsed() >= Duration::from_millis(1500 + 3000 + 6000));
    assert!(client.status().borrow().retries_exhausted);

    let seen = drain(&mut events);
    assert_eq!(
        scheduled(&seen),
        vec![
            (1, Duration::from_millis(1500)),
            (2, Duration::from_millis(3000)),
            (3, Duration::from_millis(6000)),
        ]
    );
    let exhausted: Vec<_> = seen
        .iter()
        .filter(|event| matches!(event, ServiceEvent::RetryExhausted { .. }))
        .collect();
    assert_eq!(exhausted, vec![&ServiceEvent::RetryExhausted { attempts: 3 }]);

    // Nothing further is scheduled once the budget is spent.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(factory.attempts().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn manual_reconnect_after_exhaustion_starts_a_fresh_budget() {
    let factory = MockFactory::new();
    let endpoint = Endpoint::parse("ws://agent.test:8765").unwrap();
    factory.script(&endpoint, [ConnectOutcome::Refuse; 4]);
    let client = RpcClient::with_factory(config("ws://agent.test:8765"), factory.clone());

    client.connect().unwrap();
    assert!(client.wait_connected().await.is_err());

    client.reconnect().unwrap();
    client.wait_connected().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(!client.status().borrow().retries_exhausted);
    assert_eq!(factory.attempts().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn success_after_a_refusal_resets_the_budget() {
    let factory = MockFactory::new();
    let endpoint = Endpoint::parse("ws://agent.test:8765").unwrap();
    factory.script(&endpoint, [ConnectOutcome::Refuse]);
    let client = RpcClient::with_factory(config("ws://agent.test:8765"), factory.clone());
    let mut events = client.service_events();

    client.connect().unwrap();
    client.wait_connected().await.unwrap();
    assert_eq!(factory.attempts().len(), 2);
    assert_eq!(
        scheduled(&drain(&mut events)),
        vec![(1, Duration::from_millis(1500))]
    );

    // A later outage starts counting from one again.
    factory.latest().unwrap().drop_connection();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(factory.attempts().len(), 3);
    assert_eq!(
        scheduled(&drain(&mut events)),
        vec![(1, Duration::from_millis(1500))]
    );
}

#[tokio::test(start_paused = true)]
async fn refused_tcp_falls_back_to_websocket_on_next_port() {
    let factory = MockFactory::new();
    let tcp = Endpoint::parse("tcp://agent.test:9000").unwrap();
    factory.script(&tcp, [ConnectOutcome::Refuse]);
    let client = RpcClient::with_factory(config("tcp://agent.test:9000"), factory.clone());
    let mut events = client.service_events();

    let started = Instant::now();
    client.connect().unwrap();
    client.wait_connected().await.unwrap();

    assert_eq!(client.endpoint().url(), "ws://agent.test:9001");
    assert_eq!(
        factory.attempts(),
        vec!["tcp://agent.test:9000", "ws://agent.test:9001"]
    );
    // The fallback is immediate, not a scheduled retry.
    assert!(started.elapsed() < Duration::from_millis(1500));
    let seen = drain(&mut events);
    assert!(scheduled(&seen).is_empty());
    assert!(seen.contains(&ServiceEvent::FallbackAttempt {
        endpoint: Endpoint::parse("ws://agent.test:9001").unwrap(),
    }));
}

#[tokio::test(start_paused = true)]
async fn failed_fallback_returns_to_tcp_and_retries_there() {
    let factory = MockFactory::new();
    let tcp = Endpoint::parse("tcp://agent.test:9000").unwrap();
    let ws = Endpoint::parse("ws://agent.test:9001").unwrap();
    factory.script(&tcp, [ConnectOutcome::Refuse; 4]);
    factory.script(&ws, [ConnectOutcome::Refuse]);
    let client = RpcClient::with_factory(config("tcp://agent.test:9000"), factory.clone());

    client.connect().unwrap();
    assert_eq!(
        client.wait_connected().await,
        Err(RpcError::RetryExhausted { attempts: 3 })
    );
    assert_eq!(
        factory.attempts(),
        vec![
            "tcp://agent.test:9000",
            "ws://agent.test:9001",
            "tcp://agent.test:9000",
            "tcp://agent.test:9000",
            "tcp://agent.test:9000",
        ]
    );
    assert_eq!(client.endpoint(), tcp);
}

#[tokio::test(start_paused = true)]
async fn fallback_can_be_disabled() {
    let factory = MockFactory::new();
    let tcp = Endpoint::parse("tcp://agent.test:9000").unwrap();
    factory.script(&tcp, [ConnectOutcome::Refuse]);
    let mut settings = config("tcp://agent.test:9000");
    settings.fallback_port_offset = None;
    let client = RpcClient::with_factory(settings, factory.clone());

    client.connect().unwrap();
    client.wait_connected().await.unwrap();
    assert_eq!(
        factory.attempts(),
        vec!["tcp://agent.test:9000", "tcp://agent.test:9000"]
    );
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_does_not_reconnect() {
    let (client, factory, _agent) = support::connected_client().await;
    client.disconnect();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(factory.attempts().len(), 1);
}
