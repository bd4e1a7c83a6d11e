mod client;
mod pending;

pub use client::{
    LinkStatus, NotificationHandler, RequestHandler, RpcClient, ServiceEvent,
};
pub use pending::RpcResponse;
