//! Listener shell: TCP accept loop, admission control, TLS handshake and the
//! hand-off of finished connections to `axum::serve`.
//!
//! Admission is decided on the raw socket, before any TLS or HTTP work. The
//! TLS server configuration is read from the [`TlsContext`] once per
//! accepted connection, so a rotation applies to the next connection and
//! never to one that is mid-handshake.

use crate::admission::{AdmissionController, ConnectionPermit};
use crate::tls::TlsContext;
use axum::extract::connect_info::Connected;
use axum::serve::IncomingStream;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Connection metadata available to handlers as `ConnectInfo<PeerInfo>`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub remote_addr: SocketAddr,
    /// DER certificates the client presented, leaf first.
    pub certs: Arc<Vec<Vec<u8>>>,
    /// Whether the connection is TLS.
    pub tls: bool,
}

impl PeerInfo {
    fn plain(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            certs: Arc::new(Vec::new()),
            tls: false,
        }
    }

    /// The client's leaf certificate.
    pub fn leaf(&self) -> Option<&[u8]> {
        self.certs.first().map(Vec::as_slice)
    }
}

impl Connected<IncomingStream<'_, ChannelListener>> for PeerInfo {
    fn connect_info(stream: IncomingStream<'_, ChannelListener>) -> Self {
        stream.remote_addr().clone()
    }
}

enum Inner {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// An accepted connection. Holds its admission permit until closed.
pub struct ProxyStream {
    inner: Inner,
    _permit: Option<ConnectionPermit>,
}

impl AsyncRead for ProxyStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            Inner::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Inner::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            Inner::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Inner::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            Inner::Plain(s) => Pin::new(s).poll_flush(cx),
            Inner::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            Inner::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Inner::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Receives ready connections from the accept loop.
pub struct ChannelListener {
    rx: mpsc::Receiver<(ProxyStream, PeerInfo)>,
    local_addr: SocketAddr,
}

impl axum::serve::Listener for ChannelListener {
    type Io = ProxyStream;
    type Addr = PeerInfo;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.rx.recv().await {
            Some(connection) => connection,
            // The accept loop is gone; nothing will ever arrive again.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(PeerInfo::plain(self.local_addr))
    }
}

/// What a listener applies to each accepted socket.
#[derive(Clone)]
pub struct ListenerOptions {
    /// Role label for logs.
    pub role: &'static str,
    /// TLS identity; plain TCP when `None`.
    pub tls: Option<Arc<TlsContext>>,
    /// Admission control; every socket is admitted when `None`.
    pub admission: Option<Arc<AdmissionController>>,
    pub handshake_timeout: Duration,
}

/// Starts the accept loop on `tcp` and returns the listener `axum::serve`
/// pulls connections from. The loop ends once the listener is dropped.
///
/// # Errors
///
/// Returns an I/O error if the local address cannot be read.
pub fn spawn_accept_loop(tcp: TcpListener, options: ListenerOptions) -> io::Result<ChannelListener> {
    let local_addr = tcp.local_addr()?;
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(accept_loop(tcp, options, tx));
    Ok(ChannelListener { rx, local_addr })
}

async fn accept_loop(
    tcp: TcpListener,
    options: ListenerOptions,
    tx: mpsc::Sender<(ProxyStream, PeerInfo)>,
) {
    while !tx.is_closed() {
        let (socket, remote_addr) = match tcp.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(role = options.role, error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let permit = match options.admission.as_deref().map(AdmissionController::try_admit) {
            None => None,
            Some(Ok(permit)) => permit,
            Some(Err(refusal)) => {
                tracing::warn!(role = options.role, %remote_addr, reason = %refusal, "connection refused");
                continue;
            }
        };
        let _ = socket.set_nodelay(true);

        let server_config = options
            .tls
            .as_ref()
            .and_then(|tls| tls.current().server.clone());
        let tx = tx.clone();
        let role = options.role;
        let handshake_timeout = options.handshake_timeout;
        tokio::spawn(async move {
            let connection = match server_config {
                None => (
                    ProxyStream {
                        inner: Inner::Plain(socket),
                        _permit: permit,
                    },
                    PeerInfo::plain(remote_addr),
                ),
                Some(config) => {
                    let handshake = TlsAcceptor::from(config).accept(socket);
                    let stream = match tokio::time::timeout(handshake_timeout, handshake).await {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            tracing::debug!(role, %remote_addr, error = %e, "TLS handshake failed");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(role, %remote_addr, "TLS handshake timed out");
                            return;
                        }
                    };
                    let certs = stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .map(|certs| certs.iter().map(|c| c.to_vec()).collect())
                        .unwrap_or_default();
                    (
                        ProxyStream {
                            inner: Inner::Tls(Box::new(stream)),
                            _permit: permit,
                        },
                        PeerInfo {
                            remote_addr,
                            certs: Arc::new(certs),
                            tls: true,
                        },
                    )
                }
            };
            let _ = tx.send(connection).await;
        });
    }
    tracing::debug!(role = options.role, "accept loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::StaticProbe;
    use crate::config::AntiDosConfig;
    use axum::serve::Listener;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn options(admission: Option<Arc<AdmissionController>>) -> ListenerOptions {
        ListenerOptions {
            role: "test",
            tls: None,
            admission,
            handshake_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn plain_connections_are_handed_over() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let mut listener = spawn_accept_loop(tcp, options(None)).unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let (mut stream, info) = listener.accept().await;
        assert!(!info.tls);
        assert!(info.leaf().is_none());
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn refused_sockets_are_closed_and_capacity_returns() {
        let admission = Arc::new(AdmissionController::new(
            AntiDosConfig {
                max_parallel_connections: 1,
                ..AntiDosConfig::default()
            },
            Arc::new(StaticProbe::new(None)),
        ));
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let mut listener = spawn_accept_loop(tcp, options(Some(admission.clone()))).unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let (held, _) = listener.accept().await;
        assert_eq!(admission.active(), 1);

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)), "refused socket must be closed");

        drop(held);
        assert_eq!(admission.active(), 0);
        let _third = TcpStream::connect(addr).await.unwrap();
        let (_stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap();
        assert_eq!(admission.active(), 1);
    }
}
