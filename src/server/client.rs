//! RPC Client
//!
//! Typed client for the RPC surface, used by the CLI and tests. Each
//! connection opens with the client tag byte and an optional TLS
//! handshake, mirroring the server's accept path.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{rustls, TlsConnector};

use crate::commitlog::Record;
use crate::distributed::ClusterServer;
use crate::error::{Error, Result};
use crate::net::{read_message, write_message, NodeStream, CLIENT_TAG};

use super::api::{ErrorCode, Request, Response};

/// Client for one node's RPC surface
pub struct LogClient {
    conn: NodeStream,
}

impl LogClient {
    /// Connect to a node, optionally over TLS
    pub async fn connect(addr: &str, tls: Option<Arc<rustls::ClientConfig>>) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await.map_err(|e| {
            Error::ConnectionFailed {
                address: addr.to_string(),
                reason: e.to_string(),
            }
        })?;
        stream.set_nodelay(true)?;
        stream.write_all(&[CLIENT_TAG]).await?;

        let conn = match tls {
            Some(config) => {
                let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
                let name = ServerName::try_from(host.to_string())
                    .map_err(|_| Error::Network(format!("invalid TLS server name: {}", host)))?;
                let tls_stream = TlsConnector::from(config).connect(name, stream).await?;
                NodeStream::ClientTls(Box::new(tls_stream))
            }
            None => NodeStream::Plain(stream),
        };

        Ok(Self { conn })
    }

    /// Append one record, returning its offset
    pub async fn produce(&mut self, record: Record) -> Result<u64> {
        write_message(&mut self.conn, &Request::Produce { record }).await?;
        match read_message(&mut self.conn).await? {
            Response::Produce { offset } => Ok(offset),
            Response::Error { code, message } => Err(decode_error(code, message, 0)),
            other => Err(unexpected(&other)),
        }
    }

    /// Read the record at `offset`
    pub async fn consume(&mut self, offset: u64) -> Result<Record> {
        write_message(&mut self.conn, &Request::Consume { offset }).await?;
        match read_message(&mut self.conn).await? {
            Response::Consume { record } => Ok(record),
            Response::Error { code, message } => Err(decode_error(code, message, offset)),
            other => Err(unexpected(&other)),
        }
    }

    /// List the cluster's servers
    pub async fn get_servers(&mut self) -> Result<Vec<ClusterServer>> {
        write_message(&mut self.conn, &Request::GetServers).await?;
        match read_message(&mut self.conn).await? {
            Response::Servers { servers } => Ok(servers),
            Response::Error { code, message } => Err(decode_error(code, message, 0)),
            other => Err(unexpected(&other)),
        }
    }

    /// Switch this connection into produce-streaming mode
    pub async fn produce_stream(mut self) -> Result<ProduceStream> {
        write_message(&mut self.conn, &Request::ProduceStream).await?;
        Ok(ProduceStream { conn: self.conn })
    }

    /// Open a record stream starting at `offset`
    pub async fn consume_stream(mut self, offset: u64) -> Result<ConsumeStream> {
        write_message(&mut self.conn, &Request::ConsumeStream { offset }).await?;
        Ok(ConsumeStream { conn: self.conn })
    }
}

/// Client half of a produce stream: send records, receive offsets
pub struct ProduceStream {
    conn: NodeStream,
}

impl ProduceStream {
    /// Send one record and wait for its assigned offset
    pub async fn send(&mut self, record: Record) -> Result<u64> {
        write_message(&mut self.conn, &record).await?;
        match read_message(&mut self.conn).await? {
            Response::Produce { offset } => Ok(offset),
            Response::Error { code, message } => Err(decode_error(code, message, 0)),
            other => Err(unexpected(&other)),
        }
    }
}

/// Client half of a consume stream: records arrive in offset order
pub struct ConsumeStream {
    conn: NodeStream,
}

impl ConsumeStream {
    /// Wait for the next record
    pub async fn next(&mut self) -> Result<Record> {
        match read_message(&mut self.conn).await? {
            Response::Consume { record } => Ok(record),
            Response::Error { code, message } => Err(decode_error(code, message, 0)),
            other => Err(unexpected(&other)),
        }
    }
}

/// Map a wire error back onto the closest error variant
fn decode_error(code: ErrorCode, message: String, offset: u64) -> Error {
    match code {
        ErrorCode::NotFound => Error::OffsetOutOfRange(offset),
        ErrorCode::NotLeader => Error::NotLeader(message),
        ErrorCode::PermissionDenied => Error::PermissionDenied {
            subject: String::new(),
            object: String::new(),
            action: message,
        },
        ErrorCode::Unauthenticated => Error::Unauthenticated,
        ErrorCode::Timeout => Error::Timeout(message),
        ErrorCode::Internal => Error::Rpc(message),
    }
}

fn unexpected(response: &Response) -> Error {
    Error::Rpc(format!("unexpected response: {:?}", response))
}
