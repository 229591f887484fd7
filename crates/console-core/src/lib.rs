//! console-core: shared library for the console proxy.
//!
//! Provides the AES-CBC token codec, session descriptor parsing and
//! validation, the hot-swappable encryption secret, and the error taxonomy
//! used across the proxy.

pub mod codec;
pub mod descriptor;
pub mod error;
pub mod secret;

// Re-export commonly used items at crate root.
pub use descriptor::{open_token, seal_token, SessionDescriptor};
pub use error::{ConnectStage, ConsoleError, ConsoleResult};
pub use secret::{EncryptorSecret, SecretCell};
