//! Streaming Proxy
//!
//! Downstream WebSocket server: client control protocol, per-client
//! bounded queues and session handling.

pub mod protocol;
pub mod queue;
pub mod server;

pub use protocol::{ControlError, ControlRequest, OutboundFrame};
pub use queue::{OutboundQueue, SharedQueue};
pub use server::{ProxyServer, ProxyServerError};
