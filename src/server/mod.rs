//! RPC Server
//!
//! Serves the client half of the shared listener. Each connection
//! opens with the client tag byte, optionally completes a TLS
//! handshake, and then carries framed requests. The verified peer
//! certificate's common name becomes the authorization subject; with
//! no transport security the subject is empty.

pub mod api;
mod client;

pub use client::{ConsumeStream, LogClient, ProduceStream};

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::{rustls, TlsAcceptor};

use crate::auth::{Authorizer, ACTION_CONSUME, ACTION_PRODUCE, OBJECT_WILDCARD};
use crate::commitlog::Record;
use crate::distributed::DistributedLog;
use crate::error::{Error, Result};
use crate::net::{read_message, write_message, NodeStream, CLIENT_TAG};

use api::{Request, Response};

/// Poll interval while a consume stream waits at the log's tail
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// RPC server over the mux's client connection queue
pub struct RpcServer {
    log: Arc<DistributedLog>,
    authorizer: Arc<Authorizer>,
    tls: Option<TlsAcceptor>,
}

impl RpcServer {
    /// Create the server
    pub fn new(
        log: Arc<DistributedLog>,
        authorizer: Arc<Authorizer>,
        server_tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        Self {
            log,
            authorizer,
            tls: server_tls.map(TlsAcceptor::from),
        }
    }

    /// Spawn the serve loop over routed client connections
    pub fn serve(
        self: Arc<Self>,
        mut incoming: mpsc::Receiver<TcpStream>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_conn = incoming.recv() => {
                        let Some(conn) = maybe_conn else { break };
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(conn).await {
                                tracing::debug!("client connection ended: {}", e);
                            }
                        });
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("rpc server stopped");
        })
    }

    /// Drive one client connection until it closes
    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let mut tag = [0u8; 1];
        stream.read_exact(&mut tag).await?;
        if tag[0] != CLIENT_TAG {
            return Err(Error::Network(format!(
                "not a client connection (tag {:#04x})",
                tag[0]
            )));
        }

        let mut conn = match &self.tls {
            Some(acceptor) => NodeStream::ServerTls(Box::new(acceptor.accept(stream).await?)),
            None => NodeStream::Plain(stream),
        };
        let subject = peer_subject(&conn);

        loop {
            let request: Request = match read_message(&mut conn).await {
                Ok(request) => request,
                // Client hung up
                Err(_) => return Ok(()),
            };
            tracing::debug!(subject = %subject, "handling {}", request.type_name());

            match request {
                Request::Produce { record } => {
                    let response = match self.produce(&subject, record).await {
                        Ok(offset) => Response::Produce { offset },
                        Err(e) => Response::from_error(&e),
                    };
                    write_message(&mut conn, &response).await?;
                }
                Request::Consume { offset } => {
                    let response = match self.consume(&subject, offset) {
                        Ok(record) => Response::Consume { record },
                        Err(e) => Response::from_error(&e),
                    };
                    write_message(&mut conn, &response).await?;
                }
                Request::ProduceStream => {
                    return self.produce_stream(&subject, conn).await;
                }
                Request::ConsumeStream { offset } => {
                    return self.consume_stream(&subject, conn, offset).await;
                }
                Request::GetServers => {
                    let response = Response::Servers {
                        servers: self.log.get_servers(),
                    };
                    write_message(&mut conn, &response).await?;
                }
            }
        }
    }

    async fn produce(&self, subject: &str, record: Record) -> Result<u64> {
        self.authorizer
            .authorize(subject, OBJECT_WILDCARD, ACTION_PRODUCE)?;
        self.log.append(&record).await
    }

    fn consume(&self, subject: &str, offset: u64) -> Result<Record> {
        self.authorizer
            .authorize(subject, OBJECT_WILDCARD, ACTION_CONSUME)?;
        self.log.read(offset)
    }

    /// One produce per record frame, answering offsets one-for-one
    async fn produce_stream(&self, subject: &str, mut conn: NodeStream) -> Result<()> {
        loop {
            let record: Record = match read_message(&mut conn).await {
                Ok(record) => record,
                Err(_) => return Ok(()),
            };

            let response = match self.produce(subject, record).await {
                Ok(offset) => Response::Produce { offset },
                Err(e) => {
                    write_message(&mut conn, &Response::from_error(&e)).await?;
                    return Err(e);
                }
            };
            write_message(&mut conn, &response).await?;
        }
    }

    /// Stream records in offset order, waiting at the tail for new
    /// data; ends when the client disconnects
    async fn consume_stream(
        &self,
        subject: &str,
        mut conn: NodeStream,
        mut offset: u64,
    ) -> Result<()> {
        loop {
            match self.consume(subject, offset) {
                Ok(record) => {
                    write_message(&mut conn, &Response::Consume { record }).await?;
                    offset += 1;
                }
                Err(Error::OffsetOutOfRange(_)) => {
                    // Nothing at this offset yet; retry it, unless the
                    // client went away while we waited
                    let mut probe = [0u8; 1];
                    tokio::select! {
                        _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => {}
                        read = conn.read(&mut probe) => {
                            if matches!(read, Ok(0) | Err(_)) {
                                return Ok(());
                            }
                        }
                    }
                }
                Err(e) => {
                    write_message(&mut conn, &Response::from_error(&e)).await?;
                    return Err(e);
                }
            }
        }
    }
}

/// Authenticated subject of the connection: the verified peer
/// certificate's common name, or empty without mutual TLS
fn peer_subject(conn: &NodeStream) -> String {
    let Some(der) = conn.peer_certificate() else {
        return String::new();
    };

    match x509_parser::parse_x509_certificate(&der) {
        Ok((_, cert)) => cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string(),
        Err(e) => {
            tracing::warn!("unparseable peer certificate: {}", e);
            String::new()
        }
    }
}
