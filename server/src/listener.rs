use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use rustls::ServerConfig;
use tlsecho_common::EchoError;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

/// Upper bound on one TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` so a persistent error (fd exhaustion)
/// does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// An accepted connection that completed its TLS handshake.
pub struct ServerChannel {
    stream: TlsStream<TcpStream>,
    peer:   SocketAddr,
}

impl ServerChannel {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// ALPN protocol the client agreed to, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.stream.get_ref().1.alpn_protocol()
    }

    pub fn into_stream(self) -> TlsStream<TcpStream> {
        self.stream
    }
}

/// A bound TCP socket plus the TLS configuration presented on it.
pub struct Listener {
    tcp:      TcpListener,
    acceptor: TlsAcceptor,
    addr:     SocketAddr,
}

impl Listener {
    /// Binds `addr` and prepares to present `config` to every client.
    pub async fn bind(addr: &str, config: Arc<ServerConfig>) -> Result<Self, EchoError> {
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|source| EchoError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local = tcp.local_addr().map_err(|source| EchoError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        tracing::info!("Listening on {}", local);
        Ok(Self {
            tcp,
            acceptor: TlsAcceptor::from(config),
            addr: local,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits for the next connection that completes a TLS handshake.
    ///
    /// Failed handshakes and transient accept errors are logged and skipped;
    /// the listener keeps accepting.
    pub async fn accept(&self) -> ServerChannel {
        loop {
            let (tcp, peer) = match self.accept_tcp().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Connection error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            match handshake(&self.acceptor, tcp, peer).await {
                Ok(channel) => return channel,
                Err(e) => tracing::warn!(%peer, "TLS handshake failed: {}", e),
            }
        }
    }

    pub(crate) async fn accept_tcp(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (tcp, peer) = self.tcp.accept().await?;
        tcp.set_nodelay(true)?;
        Ok((tcp, peer))
    }

    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }
}

/// Runs the server side of the handshake, bounded by [`HANDSHAKE_TIMEOUT`].
pub(crate) async fn handshake(
    acceptor: &TlsAcceptor,
    tcp: TcpStream,
    peer: SocketAddr,
) -> io::Result<ServerChannel> {
    let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;
    tracing::debug!(%peer, "TLS connection established");
    Ok(ServerChannel { stream, peer })
}
