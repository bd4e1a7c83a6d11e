//! Client core for driving a coding agent from a phone: a reconnecting
//! JSON-RPC 2.0 client over WebSocket or raw TCP, a reducer that turns
//! streamed `session/update` notifications into a chat transcript, and
//! remote terminal plumbing.

pub mod config;
pub mod connection;
pub mod error;
pub mod reducer;
pub mod rpc;
pub mod session;
pub mod telemetry;
pub mod terminal;
pub mod transport;

pub use config::{ClientConfig, Endpoint, RetryPolicy, Scheme};
pub use connection::{AgentConnection, ConnectionSlot};
pub use error::{DecodeError, RpcError, SessionError, TransportError};
pub use rpc::{RpcClient, RpcResponse, ServiceEvent};
pub use transport::ConnectionState;
