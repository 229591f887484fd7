use std::fmt;
use thiserror::Error;

/// Stage of the upstream tunnel handshake that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    /// The tunnel URL could not be parsed or has no host.
    Url,
    /// TCP connect to the upstream host failed.
    Dial,
    /// TLS handshake failed.
    Tls,
    /// Writing the CONNECT request failed.
    Write,
    /// Reading the response header block failed.
    Read,
    /// The upstream answered with something other than `HTTP/1.1 200 OK`.
    Status,
}

impl fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectStage::Url => "url",
            ConnectStage::Dial => "dial",
            ConnectStage::Tls => "tls",
            ConnectStage::Write => "write",
            ConnectStage::Read => "read",
            ConnectStage::Status => "status",
        };
        f.write_str(s)
    }
}

/// Errors produced by the console proxy.
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("ciphertext too short: {0} bytes")]
    TruncatedCiphertext(usize),

    #[error("invalid session descriptor: {0}")]
    Validation(String),

    #[error("session not found: {0}")]
    Lookup(String),

    #[error("upstream connect failed at {stage}: {reason}")]
    Connect { stage: ConnectStage, reason: String },

    #[error("relay io error: {0}")]
    ProxyIo(String),

    #[error("session capacity reached ({0})")]
    Capacity(usize),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConsoleError {
    /// Shorthand for building a [`ConsoleError::Connect`].
    pub fn connect(stage: ConnectStage, reason: impl fmt::Display) -> Self {
        ConsoleError::Connect {
            stage,
            reason: reason.to_string(),
        }
    }
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;
