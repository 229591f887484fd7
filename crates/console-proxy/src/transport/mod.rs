//! Browser-facing transport.

pub mod websocket;

pub use websocket::{Frame, WsFrame, WS_PROTOCOL};
