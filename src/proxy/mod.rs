//! Upstream plumbing: HTTP forwarding, header policy, WebSocket bridging.

pub mod forwarder;
pub mod headers;
pub mod websocket;

pub use forwarder::{ForwardError, ForwarderOptions, HttpForwarder};
pub use websocket::{bridge, BridgeError, BridgeOptions};
