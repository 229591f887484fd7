//! Upstream side: TLS dial plus the HTTP CONNECT handshake.

pub mod connector;
pub mod tls;

pub use connector::TunnelConnector;
