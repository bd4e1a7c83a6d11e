use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::RpcError;

/// A successful reply to one of our requests.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: u64,
    pub result: Value,
}

type Completion = oneshot::Sender<Result<RpcResponse, RpcError>>;

/// Outstanding requests keyed by id. Every entry leaves the table exactly
/// once: resolved by a response, rejected on disconnect, or removed when
/// the caller stops waiting.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<u64, Completion>>,
}

impl PendingTable {
    pub(crate) fn register(self: &Arc<Self>, id: u64) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(id, tx);
        PendingCall {
            id,
            table: self.clone(),
            rx,
        }
    }

    /// Returns false when no request with `id` is outstanding.
    pub(crate) fn resolve(&self, id: u64, outcome: Result<RpcResponse, RpcError>) -> bool {
        let Some(tx) = self.entries.lock().remove(&id) else {
            return false;
        };
        let _ = tx.send(outcome);
        true
    }

    pub(crate) fn reject_all(&self, error: &RpcError) -> usize {
        let drained: Vec<Completion> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn forget(&self, id: u64) {
        self.entries.lock().remove(&id);
    }
}

/// The caller's half of a pending request. Dropping it before completion
/// removes the entry so late responses are discarded.
pub(crate) struct PendingCall {
    id: u64,
    table: Arc<PendingTable>,
    rx: oneshot::Receiver<Result<RpcResponse, RpcError>>,
}

impl PendingCall {
    pub(crate) async fn wait(mut self) -> Result<RpcResponse, RpcError> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Disconnected),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.table.forget(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_removes_entry_once() {
        let table = Arc::new(PendingTable::default());
        let call = table.register(1);
        assert!(table.resolve(
            1,
            Ok(RpcResponse {
                id: 1,
                result: json!(true)
            })
        ));
        assert!(!table.resolve(1, Err(RpcError::Disconnected)));
        assert_eq!(call.wait().await.unwrap().result, json!(true));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn dropped_call_leaves_no_entry() {
        let table = Arc::new(PendingTable::default());
        let call = table.register(9);
        assert_eq!(table.len(), 1);
        drop(call);
        assert_eq!(table.len(), 0);
        assert!(!table.resolve(9, Err(RpcError::Disconnected)));
    }

    #[tokio::test]
    async fn reject_all_fails_every_waiter() {
        let table = Arc::new(PendingTable::default());
        let first = table.register(1);
        let second = table.register(2);
        assert_eq!(table.reject_all(&RpcError::Disconnected), 2);
        assert_eq!(first.wait().await, Err(RpcError::Disconnected));
        assert_eq!(second.wait().await, Err(RpcError::Disconnected));
    }
}
