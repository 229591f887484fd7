//! Upstream tunnel establishment.
//!
//! Dials the hypervisor over TLS and performs the console handshake:
//!
//! ```text
//! CONNECT <path?query> HTTP/1.0\r\n
//! Host: <host>\r\n
//! Cookie: session_id=<tunnel session>\r\n
//! \r\n
//! ```
//!
//! The reply's status line must read exactly `HTTP/1.1 200 OK`. After the
//! blank line that ends the reply headers the stream carries raw console
//! bytes.

use super::tls;
use crate::config::UpstreamConfig;
use console_core::{ConnectStage, ConsoleError, ConsoleResult, SessionDescriptor};
use rustls::pki_types::ServerName;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::{Host, Url};

/// The only status line accepted from the upstream.
pub const EXPECTED_STATUS: &str = "HTTP/1.1 200 OK";

/// Upper bound on the reply header block.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// An established tunnel. Bytes the upstream sent right after its header
/// block are kept in the read buffer.
pub type TunnelStream = BufReader<TlsStream<TcpStream>>;

/// Where and how to dial for one descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Host to dial (IPv6 literals without brackets).
    pub dial_host: String,
    /// Value for the `Host` header.
    pub host_header: String,
    /// Path plus query sent in the CONNECT line.
    pub request_uri: String,
}

impl TunnelTarget {
    /// Derive the target from a tunnel URL.
    pub fn from_url(url: &Url) -> ConsoleResult<Self> {
        let dial_host = match url.host() {
            Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(ConsoleError::connect(ConnectStage::Url, "tunnel URL has no host")),
        };

        // host_str keeps IPv6 brackets, which is what the Host header wants.
        let host = url.host_str().unwrap_or_default();
        let host_header = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let request_uri = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };

        Ok(Self {
            dial_host,
            host_header,
            request_uri,
        })
    }

    /// The literal CONNECT request for `tunnel_session`.
    pub fn request(&self, tunnel_session: &str) -> String {
        format!(
            "CONNECT {} HTTP/1.0\r\nHost: {}\r\nCookie: session_id={}\r\n\r\n",
            self.request_uri, self.host_header, tunnel_session
        )
    }
}

/// Opens upstream console tunnels.
pub struct TunnelConnector {
    tls: TlsConnector,
    port: u16,
    connect_timeout: Duration,
}

impl TunnelConnector {
    pub fn new(config: &UpstreamConfig) -> ConsoleResult<Self> {
        let client_config = tls::client_config(&config.trust)?;
        Ok(Self {
            tls: TlsConnector::from(Arc::new(client_config)),
            port: config.port,
            connect_timeout: config.connect_timeout,
        })
    }

    /// Dial the descriptor's tunnel URL and complete the CONNECT handshake.
    ///
    /// On any failure the partially opened connection is dropped (closed)
    /// and the error names the stage that failed.
    pub async fn connect(&self, descriptor: &SessionDescriptor) -> ConsoleResult<TunnelStream> {
        let url = descriptor
            .tunnel_url()
            .map_err(|e| ConsoleError::connect(ConnectStage::Url, e))?;
        let target = TunnelTarget::from_url(&url)?;

        let result = self.handshake(&target, &descriptor.client_tunnel_session).await;
        match &result {
            Ok(_) => info!(host = %target.dial_host, port = self.port, "upstream tunnel established"),
            Err(e) => warn!(host = %target.dial_host, port = self.port, error = %e, "upstream tunnel failed"),
        }
        result
    }

    async fn handshake(&self, target: &TunnelTarget, tunnel_session: &str) -> ConsoleResult<TunnelStream> {
        let limit = self.connect_timeout;

        let tcp = bounded(limit, ConnectStage::Dial, async {
            TcpStream::connect((target.dial_host.as_str(), self.port))
                .await
                .map_err(|e| ConsoleError::connect(ConnectStage::Dial, e))
        })
        .await?;
        let _ = tcp.set_nodelay(true);

        let server_name = ServerName::try_from(target.dial_host.clone())
            .map_err(|e| ConsoleError::connect(ConnectStage::Tls, e))?;
        let mut stream = bounded(limit, ConnectStage::Tls, async {
            self.tls
                .connect(server_name, tcp)
                .await
                .map_err(|e| ConsoleError::connect(ConnectStage::Tls, e))
        })
        .await?;

        let request = target.request(tunnel_session);
        bounded(limit, ConnectStage::Write, async {
            let sent = async {
                stream.write_all(request.as_bytes()).await?;
                stream.flush().await
            }
            .await;
            sent.map_err(|e| ConsoleError::connect(ConnectStage::Write, e))
        })
        .await?;

        let mut reader = BufReader::new(stream);
        bounded(limit, ConnectStage::Read, read_reply(&mut reader)).await?;
        Ok(reader)
    }
}

/// Read the reply header block, checking the status line.
async fn read_reply<R>(reader: &mut R) -> ConsoleResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0usize;
    let mut first = true;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConsoleError::connect(ConnectStage::Read, e))?;
        if n == 0 {
            return Err(ConsoleError::connect(
                ConnectStage::Read,
                "connection closed before end of headers",
            ));
        }
        total += n;
        if total > MAX_HEADER_BYTES {
            return Err(ConsoleError::connect(ConnectStage::Read, "reply headers too large"));
        }

        let text = line.trim_end_matches(['\r', '\n']);
        if first {
            if text != EXPECTED_STATUS {
                return Err(ConsoleError::connect(
                    ConnectStage::Status,
                    format!("unexpected status line {text:?}"),
                ));
            }
            first = false;
            continue;
        }
        if text.is_empty() {
            return Ok(());
        }
        debug!(header = %text, "upstream reply header");
    }
}

/// Run `fut`, failing with a timeout at `stage` once `limit` passes.
async fn bounded<T, F>(limit: Duration, stage: ConnectStage, fut: F) -> ConsoleResult<T>
where
    F: Future<Output = ConsoleResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConsoleError::connect(stage, format!("timed out after {limit:?}"))),
    }
}
