use std::time::Duration;

use pier_proto::{ProtocolError, RpcErrorObject};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed abnormally: {0}")]
    AbnormalClose(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("io error: {0}")]
    Io(String),
}

/// A span of inbound bytes that could not be turned into a message. Never
/// fatal for the connection.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Json(String),
    #[error("invalid utf-8 in frame")]
    Utf8,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    #[error("rpc error {code}: {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("connection lost before a response arrived")]
    Disconnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("gave up reconnecting after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
    #[error("unexpected response payload: {0}")]
    InvalidResponse(String),
    #[error("failed to encode params: {0}")]
    Encode(String),
    #[error("client has been shut down")]
    Shutdown,
}

impl RpcError {
    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<RpcErrorObject> for RpcError {
    fn from(error: RpcErrorObject) -> Self {
        RpcError::Protocol {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("no active session")]
    NoActiveSession,
    #[error("agent returned an unexpected payload: {0}")]
    InvalidResponse(String),
}
