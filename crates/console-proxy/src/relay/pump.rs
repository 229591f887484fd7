//! Bidirectional relay between one WebSocket and one tunnel stream.
//!
//! Each direction runs as its own task. Whichever leg ends first closes the
//! session link, which wakes the other leg, and releases the session from the
//! registry. A leg that ends because the link was closed from outside (a newer
//! browser took the session over) finds it is no longer current and leaves
//! the registry entry alone.

use crate::session::{Link, SessionRegistry};
use crate::transport::{Frame, WsFrame};
use console_core::{ConsoleError, ConsoleResult};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Largest chunk read from the tunnel per WebSocket message.
pub const RELAY_BUFFER_SIZE: usize = 1024;

/// Longest a finished leg waits to close its outbound half.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay for one attached session.
#[derive(Clone)]
pub struct ProxyPump {
    registry: Arc<SessionRegistry>,
    session_id: String,
    link: Link,
    idle_timeout: Option<Duration>,
}

impl ProxyPump {
    pub fn new(
        registry: Arc<SessionRegistry>,
        session_id: String,
        link: Link,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            session_id,
            link,
            idle_timeout,
        }
    }

    /// Relay until either side fails or the link is closed.
    ///
    /// Returns once both legs have exited. By then the session has been
    /// released, unless another connection superseded it.
    pub async fn run<S, M, E, T>(self, ws: S, tunnel: T)
    where
        S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + Unpin + 'static,
        M: WsFrame + Send + 'static,
        E: Display + Send + 'static,
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let session_id = self.session_id.clone();
        if !self.registry.activate(&session_id, &self.link).await {
            info!(session_id = %session_id, "session superseded before relay start");
            self.link.close();
            return;
        }
        info!(session_id = %session_id, "relay started");

        let (ws_tx, ws_rx) = ws.split();
        let (tunnel_rx, tunnel_tx) = tokio::io::split(tunnel);

        let upstream = tokio::spawn(self.clone().tunnel_to_ws(tunnel_rx, ws_tx));
        let downstream = tokio::spawn(self.clone().ws_to_tunnel(ws_rx, tunnel_tx));
        let (up, down) = tokio::join!(upstream, downstream);
        for joined in [up, down] {
            if let Err(e) = joined {
                warn!(session_id = %session_id, error = %e, "relay task panicked");
            }
        }

        let state = self.registry.state(&session_id).await;
        info!(session_id = %session_id, ?state, "relay finished");
    }

    async fn tunnel_to_ws<R, W, M, E>(self, mut tunnel: R, mut ws: W)
    where
        R: AsyncRead + Unpin,
        W: Sink<M, Error = E> + Unpin,
        M: WsFrame,
        E: Display,
    {
        let mut watch = self.link.watch();
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

        let result = loop {
            let n = tokio::select! {
                _ = watch.closed() => break Ok(()),
                read = deadline(self.idle_timeout, tunnel.read(&mut buf)) => match read {
                    Some(Ok(0)) => {
                        debug!(session_id = %self.session_id, "tunnel closed by upstream");
                        break Ok(());
                    }
                    Some(Ok(n)) => n,
                    Some(Err(e)) => break Err(proxy_io("tunnel read", e)),
                    None => break Err(proxy_io("tunnel read", "idle timeout")),
                },
            };

            let message = M::binary(buf[..n].to_vec());
            tokio::select! {
                _ = watch.closed() => break Ok(()),
                sent = deadline(self.idle_timeout, ws.send(message)) => match sent {
                    Some(Ok(())) => {}
                    Some(Err(e)) => break Err(proxy_io("websocket send", e)),
                    None => break Err(proxy_io("websocket send", "idle timeout")),
                },
            }
        };

        self.link.close();
        if deadline(Some(self.teardown_limit()), ws.close()).await.is_none() {
            debug!(session_id = %self.session_id, "websocket close timed out");
        }
        drop(tunnel);
        self.finish("tunnel->websocket", result).await;
    }

    async fn ws_to_tunnel<S, W, M, E>(self, mut ws: S, mut tunnel: W)
    where
        S: Stream<Item = Result<M, E>> + Unpin,
        W: AsyncWrite + Unpin,
        M: WsFrame,
        E: Display,
    {
        let mut watch = self.link.watch();

        let result = loop {
            let data = tokio::select! {
                _ = watch.closed() => break Ok(()),
                next = deadline(self.idle_timeout, ws.next()) => match next {
                    Some(Some(Ok(message))) => match message.classify() {
                        Frame::Data(data) => data,
                        Frame::Control => continue,
                        Frame::Close => {
                            debug!(session_id = %self.session_id, "websocket closed by browser");
                            break Ok(());
                        }
                    },
                    Some(Some(Err(e))) => break Err(proxy_io("websocket read", e)),
                    Some(None) => break Ok(()),
                    None => break Err(proxy_io("websocket read", "idle timeout")),
                },
            };

            tokio::select! {
                _ = watch.closed() => break Ok(()),
                written = deadline(self.idle_timeout, write_chunk(&mut tunnel, &data)) => match written {
                    Some(Ok(())) => {}
                    Some(Err(e)) => break Err(proxy_io("tunnel write", e)),
                    None => break Err(proxy_io("tunnel write", "idle timeout")),
                },
            }
        };

        self.link.close();
        if deadline(Some(self.teardown_limit()), tunnel.shutdown()).await.is_none() {
            debug!(session_id = %self.session_id, "tunnel shutdown timed out");
        }
        drop(tunnel);
        self.finish("websocket->tunnel", result).await;
    }

    /// A stalled peer must not hold the other half open past this.
    fn teardown_limit(&self) -> Duration {
        self.idle_timeout
            .map_or(TEARDOWN_TIMEOUT, |idle| idle.min(TEARDOWN_TIMEOUT))
    }

    /// Log the leg outcome, wake the other leg, and release the session.
    async fn finish(&self, leg: &str, result: ConsoleResult<()>) {
        match result {
            Ok(()) => debug!(session_id = %self.session_id, leg, "relay leg ended"),
            Err(e) => warn!(session_id = %self.session_id, leg, error = %e, "relay leg failed"),
        }
        self.link.close();
        self.registry.release(&self.session_id, &self.link).await;
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(tunnel: &mut W, data: &[u8]) -> std::io::Result<()> {
    tunnel.write_all(data).await?;
    tunnel.flush().await
}

/// Await `fut`, giving up after `limit` if one is set. `None` means it expired.
async fn deadline<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn proxy_io(what: &str, e: impl Display) -> ConsoleError {
    ConsoleError::ProxyIo(format!("{what}: {e}"))
}
