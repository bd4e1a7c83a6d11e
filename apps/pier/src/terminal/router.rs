use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use pier_proto::{methods, ExitParams, OutputParams};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Output(String),
    Exit(i32),
}

#[derive(Default)]
struct RouterInner {
    next_subscriber: u64,
    slots: HashMap<String, HashMap<u64, mpsc::UnboundedSender<TerminalEvent>>>,
}

/// Fans `terminal/output` and `terminal/exit` notifications out to the
/// consumers that subscribed to each terminal id. Exit and close release the
/// id's slot, which ends every subscription to it.
#[derive(Clone, Default)]
pub struct TerminalRouter {
    inner: Arc<Mutex<RouterInner>>,
}

impl TerminalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, terminal_id: &str) -> TerminalSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.next_subscriber += 1;
        let subscriber = inner.next_subscriber;
        inner
            .slots
            .entry(terminal_id.to_string())
            .or_default()
            .insert(subscriber, tx);
        TerminalSubscription {
            router: self.clone(),
            terminal_id: terminal_id.to_string(),
            subscriber,
            events: rx,
        }
    }

    pub fn subscriber_count(&self, terminal_id: &str) -> usize {
        self.inner
            .lock()
            .slots
            .get(terminal_id)
            .map_or(0, HashMap::len)
    }

    /// Deliver to every subscriber of `terminal_id`; returns how many got
    /// it. An exit also releases the slot.
    pub fn route(&self, terminal_id: &str, event: TerminalEvent) -> usize {
        let mut inner = self.inner.lock();
        let releases = matches!(event, TerminalEvent::Exit(_));
        let delivered = match inner.slots.get_mut(terminal_id) {
            Some(subscribers) => {
                subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
                subscribers.len()
            }
            None => 0,
        };
        if releases {
            inner.slots.remove(terminal_id);
        }
        if delivered == 0 {
            trace!(target: "pier::terminal", terminal_id, "no subscriber for terminal event");
        }
        delivered
    }

    /// Forget `terminal_id` entirely. Open subscriptions see end-of-stream.
    pub fn release(&self, terminal_id: &str) {
        if self.inner.lock().slots.remove(terminal_id).is_some() {
            debug!(target: "pier::terminal", terminal_id, "released terminal slot");
        }
    }

    pub fn clear(&self) {
        self.inner.lock().slots.clear();
    }

    /// Returns false for methods this router does not own.
    pub fn handle_notification(&self, method: &str, params: &Value) -> bool {
        match method {
            methods::TERMINAL_OUTPUT => {
                match serde_json::from_value::<OutputParams>(params.clone()) {
                    Ok(output) => {
                        self.route(&output.terminal_id, TerminalEvent::Output(output.data));
                    }
                    Err(err) => warn!(target: "pier::terminal", error = %err, "malformed terminal output"),
                }
                true
            }
            methods::TERMINAL_EXIT => {
                match serde_json::from_value::<ExitParams>(params.clone()) {
                    Ok(exit) => {
                        debug!(target: "pier::terminal", terminal_id = %exit.terminal_id, code = exit.code, "terminal exited");
                        self.route(&exit.terminal_id, TerminalEvent::Exit(exit.code));
                    }
                    Err(err) => warn!(target: "pier::terminal", error = %err, "malformed terminal exit"),
                }
                true
            }
            _ => false,
        }
    }

    fn unsubscribe(&self, terminal_id: &str, subscriber: u64) {
        let mut inner = self.inner.lock();
        if let Some(subscribers) = inner.slots.get_mut(terminal_id) {
            subscribers.remove(&subscriber);
            if subscribers.is_empty() {
                inner.slots.remove(terminal_id);
            }
        }
    }
}

/// One consumer's view of a terminal. Dropping it unsubscribes.
pub struct TerminalSubscription {
    router: TerminalRouter,
    terminal_id: String,
    subscriber: u64,
    events: mpsc::UnboundedReceiver<TerminalEvent>,
}

impl TerminalSubscription {
    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    /// `None` once the terminal exited or was closed.
    pub async fn recv(&mut self) -> Option<TerminalEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TerminalEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for TerminalSubscription {
    fn drop(&mut self) {
        self.router.unsubscribe(&self.terminal_id, self.subscriber);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn output_reaches_only_matching_subscriber() {
        let router = TerminalRouter::new();
        let mut first = router.subscribe("t1");
        let mut second = router.subscribe("t2");

        assert!(router.handle_notification(
            methods::TERMINAL_OUTPUT,
            &json!({"terminalId": "t1", "data": "ls\r\n"})
        ));
        assert_eq!(first.recv().await, Some(TerminalEvent::Output("ls\r\n".into())));
        assert_eq!(second.try_recv(), None);
    }

    #[tokio::test]
    async fn exit_releases_slot() {
        let router = TerminalRouter::new();
        let mut sub = router.subscribe("t1");
        router.handle_notification(methods::TERMINAL_EXIT, &json!({"terminalId": "t1", "code": 2}));
        assert_eq!(sub.recv().await, Some(TerminalEvent::Exit(2)));
        assert_eq!(sub.recv().await, None);
        assert_eq!(router.subscriber_count("t1"), 0);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let router = TerminalRouter::new();
        let sub = router.subscribe("t1");
        let other = router.subscribe("t1");
        assert_eq!(router.subscriber_count("t1"), 2);
        drop(sub);
        assert_eq!(router.subscriber_count("t1"), 1);
        drop(other);
        assert_eq!(router.route("t1", TerminalEvent::Output("x".into())), 0);
    }

    #[test]
    fn ignores_foreign_methods() {
        let router = TerminalRouter::new();
        assert!(!router.handle_notification("session/update", &json!({})));
    }
}
