//! Stream Layer
//!
//! Dual-role transport for the consensus runtime. The accept path
//! takes connections the mux already classified, reads the single tag
//! byte, and optionally wraps in server TLS. The dial path connects to
//! a peer, writes the tag byte first, and optionally wraps in client
//! TLS. Closing the layer shuts down the mux and its listener.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{rustls, TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

/// First byte of every consensus-transport connection
pub const CONSENSUS_TAG: u8 = 1;

/// First byte of every client-RPC connection
pub const CLIENT_TAG: u8 = 0;

/// A connection handed up by the stream layer, plain or TLS-wrapped
pub enum NodeStream {
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl NodeStream {
    /// DER bytes of the verified peer certificate, when mutual TLS is
    /// in effect
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        match self {
            NodeStream::Plain(_) => None,
            NodeStream::ServerTls(s) => s
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|c| c.as_ref().to_vec()),
            NodeStream::ClientTls(s) => s
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|c| c.as_ref().to_vec()),
        }
    }
}

impl AsyncRead for NodeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NodeStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            NodeStream::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            NodeStream::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NodeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            NodeStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            NodeStream::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            NodeStream::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NodeStream::Plain(s) => Pin::new(s).poll_flush(cx),
            NodeStream::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            NodeStream::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NodeStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            NodeStream::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            NodeStream::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Consensus-side transport over the shared listener
pub struct StreamLayer {
    incoming: Mutex<mpsc::Receiver<TcpStream>>,
    shutdown: watch::Sender<bool>,
    server_tls: Option<TlsAcceptor>,
    peer_tls: Option<TlsConnector>,
}

impl StreamLayer {
    /// Build a stream layer over the mux's consensus connection queue
    pub fn new(
        incoming: mpsc::Receiver<TcpStream>,
        shutdown: watch::Sender<bool>,
        server_tls: Option<Arc<rustls::ServerConfig>>,
        peer_tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        Self {
            incoming: Mutex::new(incoming),
            shutdown,
            server_tls: server_tls.map(TlsAcceptor::from),
            peer_tls: peer_tls.map(TlsConnector::from),
        }
    }

    /// Accept the next consensus connection.
    ///
    /// Reads exactly one byte; anything other than the consensus tag
    /// closes the connection and fails the accept.
    pub async fn accept(&self) -> Result<NodeStream> {
        let mut stream = {
            let mut incoming = self.incoming.lock().await;
            incoming.recv().await.ok_or(Error::ShuttingDown)?
        };

        let mut tag = [0u8; 1];
        stream.read_exact(&mut tag).await?;
        if tag[0] != CONSENSUS_TAG {
            return Err(Error::Network(format!(
                "not a consensus connection (tag {:#04x})",
                tag[0]
            )));
        }

        match &self.server_tls {
            Some(acceptor) => {
                let tls = acceptor.accept(stream).await?;
                Ok(NodeStream::ServerTls(Box::new(tls)))
            }
            None => Ok(NodeStream::Plain(stream)),
        }
    }

    /// Dial a peer, writing the consensus tag as the first byte
    pub async fn dial(&self, addr: &str, timeout: Duration) -> Result<NodeStream> {
        let connect = TcpStream::connect(addr);
        let mut stream = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address: addr.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(addr.to_string())),
        };
        stream.set_nodelay(true)?;
        stream.write_all(&[CONSENSUS_TAG]).await?;

        match &self.peer_tls {
            Some(connector) => {
                let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
                let name = ServerName::try_from(host.to_string())
                    .map_err(|_| Error::Network(format!("invalid TLS server name: {}", host)))?;
                let tls = connector.connect(name, stream).await?;
                Ok(NodeStream::ClientTls(Box::new(tls)))
            }
            None => Ok(NodeStream::Plain(stream)),
        }
    }

    /// Shut down the underlying listener
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}
