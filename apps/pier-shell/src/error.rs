use pier_proto::{RpcErrorObject, ERROR_INTERNAL, ERROR_INVALID_PARAMS};

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("invalid {key}: {value:?}")]
    Config { key: &'static str, value: String },
    #[error("pty: {0:#}")]
    Pty(#[source] anyhow::Error),
    #[error("unknown terminal {0}")]
    UnknownTerminal(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ShellError {
    /// JSON-RPC error object reported to the caller of a terminal method.
    pub fn to_rpc(&self) -> RpcErrorObject {
        let code = match self {
            ShellError::UnknownTerminal(_) | ShellError::InvalidParams(_) => ERROR_INVALID_PARAMS,
            _ => ERROR_INTERNAL,
        };
        RpcErrorObject::new(code, self.to_string())
    }
}
