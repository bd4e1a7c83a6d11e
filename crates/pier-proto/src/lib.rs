//! Wire definitions shared by the pier client core and the pier-shell host.
//! Kept free of runtime dependencies so the same shapes can be mirrored in
//! the mobile app without pulling in tokio or the transport stack.

pub mod jsonrpc;
pub mod methods;
pub mod session_update;
pub mod terminal;

pub use jsonrpc::{
    is_jsonrpc_envelope, method_not_found, Notification,
    ProtocolError, Request, RequestId, Response, ResponseOutcome, RpcErrorObject, WireMessage,
    ERROR_INTERNAL, ERROR_INVALID_PARAMS, ERROR_INVALID_REQUEST, ERROR_METHOD_NOT_FOUND,
    ERROR_PARSE, JSONRPC_VERSION,
};
pub use session_update::{
    AgentEvent, ContentBlock, LegacyUpdate, SessionUpdate, ToolInvocation, ToolOutcome,
    UpdatePayload,
};
pub use terminal::{
    CloseParams, ConnectTmuxParams, ExitParams, InputParams, OutputParams, ResizeParams,
    SpawnParams, TerminalFrame, TerminalSession, TerminalSource,
};
