//! Byte relay between a browser WebSocket and an upstream tunnel.

pub mod pump;

pub use pump::ProxyPump;
