use pier_proto::{
    methods, CloseParams, ConnectTmuxParams, InputParams, ResizeParams, SpawnParams,
    TerminalSession,
};
use serde_json::Value;

use super::router::{TerminalRouter, TerminalSubscription};
use crate::error::RpcError;
use crate::rpc::RpcClient;

/// Remote terminal operations over the agent connection. Output arrives as
/// notifications and is delivered through [`TerminalRouter`]
/// subscriptions.
#[derive(Clone)]
pub struct TerminalClient {
    rpc: RpcClient,
    router: TerminalRouter,
}

impl TerminalClient {
    pub fn new(rpc: RpcClient, router: TerminalRouter) -> Self {
        Self { rpc, router }
    }

    pub fn router(&self) -> &TerminalRouter {
        &self.router
    }

    /// Subscribe before sending input so no output is missed.
    pub fn subscribe(&self, terminal_id: &str) -> TerminalSubscription {
        self.router.subscribe(terminal_id)
    }

    pub async fn spawn(&self, params: SpawnParams) -> Result<TerminalSession, RpcError> {
        let response = self
            .rpc
            .send_request(methods::TERMINAL_SPAWN, to_params(&params)?)
            .await?;
        session_from(response.result)
    }

    pub async fn connect_tmux(
        &self,
        session: &str,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> Result<TerminalSession, RpcError> {
        let params = ConnectTmuxParams {
            session: session.to_string(),
            cols,
            rows,
        };
        let response = self
            .rpc
            .send_request(methods::TERMINAL_CONNECT_TMUX, to_params(&params)?)
            .await?;
        session_from(response.result)
    }

    pub async fn list(&self) -> Result<Vec<TerminalSession>, RpcError> {
        let response = self
            .rpc
            .send_request(methods::TERMINAL_LIST, Value::Object(Default::default()))
            .await?;
        let list = match response.result {
            Value::Object(mut map) => map.remove("terminals").unwrap_or(Value::Array(Vec::new())),
            other => other,
        };
        serde_json::from_value(list)
            .map_err(|err| RpcError::InvalidResponse(format!("terminal/list: {err}")))
    }

    pub async fn input(&self, terminal_id: &str, data: &str) -> Result<(), RpcError> {
        let params = InputParams {
            terminal_id: terminal_id.to_string(),
            data: data.to_string(),
        };
        self.rpc
            .send_request(methods::TERMINAL_INPUT, to_params(&params)?)
            .await?;
        Ok(())
    }

    pub async fn resize(&self, terminal_id: &str, cols: u16, rows: u16) -> Result<(), RpcError> {
        let params = ResizeParams {
            terminal_id: terminal_id.to_string(),
            cols,
            rows,
        };
        self.rpc
            .send_request(methods::TERMINAL_RESIZE, to_params(&params)?)
            .await?;
        Ok(())
    }

    /// Closes the remote terminal and releases its slot, even when the
    /// agent reports an error.
    pub async fn close(&self, terminal_id: &str) -> Result<(), RpcError> {
        let params = CloseParams {
            terminal_id: terminal_id.to_string(),
        };
        let outcome = self
            .rpc
            .send_request(methods::TERMINAL_CLOSE, to_params(&params)?)
            .await;
        self.router.release(terminal_id);
        outcome.map(|_| ())
    }
}

fn to_params<T: serde::Serialize>(params: &T) -> Result<Value, RpcError> {
    serde_json::to_value(params).map_err(|err| RpcError::Encode(err.to_string()))
}

/// Accepts a bare descriptor or one wrapped as `{"terminal": {...}}`.
fn session_from(result: Value) -> Result<TerminalSession, RpcError> {
    let descriptor = match result {
        Value::Object(mut map) if map.contains_key("terminal") => {
            map.remove("terminal").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(descriptor)
        .map_err(|err| RpcError::InvalidResponse(format!("terminal descriptor: {err}")))
}
