//! Consensus Transport
//!
//! Request/response messaging over the stream layer: an acceptor task
//! feeding inbound messages to the node, and a per-peer client that
//! keeps one connection alive and redials on failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{Error, Result};
use crate::net::{read_message, write_message, NodeStream, StreamLayer};

use super::message::RaftMessage;

/// Channel of inbound messages paired with their reply slots
pub type InboundTx = mpsc::Sender<(RaftMessage, oneshot::Sender<RaftMessage>)>;

/// Spawn the accept loop feeding inbound peer messages to the node
pub fn spawn_acceptor(layer: Arc<StreamLayer>, inbound: InboundTx) {
    tokio::spawn(async move {
        loop {
            match layer.accept().await {
                Ok(conn) => {
                    let inbound = inbound.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(conn, inbound).await {
                            tracing::trace!("peer connection closed: {}", e);
                        }
                    });
                }
                Err(Error::ShuttingDown) => break,
                Err(e) => {
                    tracing::debug!("consensus accept error: {}", e);
                }
            }
        }
    });
}

/// Drive one inbound peer connection until it closes
async fn serve_connection(mut conn: NodeStream, inbound: InboundTx) -> Result<()> {
    loop {
        let msg: RaftMessage = read_message(&mut conn).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        inbound
            .send((msg, reply_tx))
            .await
            .map_err(|_| Error::ShuttingDown)?;

        let reply = reply_rx.await.map_err(|_| Error::ShuttingDown)?;
        write_message(&mut conn, &reply).await?;
    }
}

/// Client for one peer, reusing a single connection
pub struct PeerClient {
    addr: String,
    layer: Arc<StreamLayer>,
    conn: Mutex<Option<NodeStream>>,
    timeout: Duration,
}

impl PeerClient {
    /// Create a client for `addr`
    pub fn new(addr: String, layer: Arc<StreamLayer>, timeout: Duration) -> Self {
        Self {
            addr,
            layer,
            conn: Mutex::new(None),
            timeout,
        }
    }

    /// Address this client dials
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send a message and wait for the peer's response.
    ///
    /// A dead pooled connection is dropped and redialed once.
    pub async fn call(&self, msg: &RaftMessage) -> Result<RaftMessage> {
        let mut guard = self.conn.lock().await;

        if let Some(conn) = guard.as_mut() {
            match self.request(conn, msg).await {
                Ok(resp) => return Ok(resp),
                Err(_) => {
                    *guard = None;
                }
            }
        }

        let mut conn = self.layer.dial(&self.addr, self.timeout).await?;
        let resp = self.request(&mut conn, msg).await?;
        *guard = Some(conn);
        Ok(resp)
    }

    async fn request(&self, conn: &mut NodeStream, msg: &RaftMessage) -> Result<RaftMessage> {
        let exchange = async {
            write_message(conn, msg).await?;
            read_message(conn).await
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(self.addr.clone())),
        }
    }
}
