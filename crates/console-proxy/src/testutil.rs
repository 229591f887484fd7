//! Test helpers: a stub TLS upstream that speaks the console handshake.

use console_core::SessionDescriptor;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

pub const CONSOLE_UUID: &str = "9389b857-7a15-a4eb-63dc-50e09b262838";
pub const TUNNEL_SESSION: &str = "OpaqueRef:d965e329-c32b-2c9c-a33c-66cafe6214c3";

/// A valid descriptor whose tunnel URL points at `host`.
pub fn descriptor_for(host: &str) -> SessionDescriptor {
    SessionDescriptor {
        client_host_address: host.to_string(),
        client_host_port: -1,
        client_tunnel_url: format!("https://{host}/console?uuid={CONSOLE_UUID}"),
        client_tunnel_session: TUNNEL_SESSION.to_string(),
        ..Default::default()
    }
}

/// One accepted upstream connection, positioned after the CONNECT request.
pub struct StubConnection {
    pub request: String,
    pub stream: TlsStream<TcpStream>,
}

/// Single-connection TLS server that reads a CONNECT request and answers
/// with a canned reply.
pub struct StubUpstream {
    pub port: u16,
    rx: oneshot::Receiver<StubConnection>,
}

impl StubUpstream {
    pub async fn start(reply: &str) -> Self {
        let acceptor = tls_acceptor();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let reply = reply.as_bytes().to_vec();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut stream = acceptor.accept(tcp).await.unwrap();

            // Byte at a time so tunnel bytes after the request stay unread.
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                if stream.read(&mut byte).await.unwrap() == 0 {
                    break;
                }
                request.push(byte[0]);
            }

            stream.write_all(&reply).await.unwrap();
            stream.flush().await.unwrap();
            let _ = tx.send(StubConnection {
                request: String::from_utf8_lossy(&request).into_owned(),
                stream,
            });
        });

        Self { port, rx }
    }

    /// Wait for the handshake to finish and take the connection.
    pub async fn accept(self) -> StubConnection {
        tokio::time::timeout(Duration::from_secs(5), self.rx)
            .await
            .expect("stub upstream timed out")
            .expect("stub upstream task failed")
    }
}

fn tls_acceptor() -> TlsAcceptor {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert.cert.der().clone()], key.into())
    .unwrap();
    TlsAcceptor::from(Arc::new(config))
}
