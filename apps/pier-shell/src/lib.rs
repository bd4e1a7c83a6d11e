//! Host side of pier's terminal bridge: pseudo-terminals exposed over a
//! per-connection WebSocket protocol and over JSON-RPC `terminal/*` calls.

pub mod config;
pub mod error;
pub mod pty;
pub mod rpc_host;
pub mod telemetry;
pub mod utf8;
pub mod ws;

pub use config::ShellConfig;
pub use error::ShellError;
