mod client;
mod router;

pub use client::TerminalClient;
pub use router::{TerminalEvent, TerminalRouter, TerminalSubscription};
