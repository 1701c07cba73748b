//! Listener Demultiplexer
//!
//! One TCP listener serves both consensus traffic and client RPC
//! traffic. The accept loop peeks the first byte of each connection
//! without consuming it: the consensus tag routes to the stream layer,
//! any other byte routes to the RPC server, which reads its own
//! preamble from byte zero.

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::error::Result;

use super::CONSENSUS_TAG;

/// Connection router over the shared listener
pub struct ListenerMux {
    listener: TcpListener,
    shutdown: watch::Sender<bool>,
}

impl ListenerMux {
    /// Bind the shared listener
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self { listener, shutdown })
    }

    /// Local address of the listener
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle used to stop the accept loop
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    /// Spawn the accept loop, returning the two routed connection
    /// queues (consensus, client RPC)
    pub fn serve(self) -> (mpsc::Receiver<TcpStream>, mpsc::Receiver<TcpStream>) {
        let (consensus_tx, consensus_rx) = mpsc::channel(64);
        let (rpc_tx, rpc_rx) = mpsc::channel(64);
        let listener = self.listener;
        // The accept task keeps one sender alive so the loop runs
        // until a handle actually signals shutdown
        let shutdown = self.shutdown;

        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let consensus_tx = consensus_tx.clone();
                                let rpc_tx = rpc_tx.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = route(stream, consensus_tx, rpc_tx).await {
                                        tracing::debug!("dropping connection from {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("accept error: {}", e);
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("listener mux stopped");
        });

        (consensus_rx, rpc_rx)
    }
}

/// Peek the first byte and hand the connection to its owner with the
/// byte still unread
async fn route(
    stream: TcpStream,
    consensus_tx: mpsc::Sender<TcpStream>,
    rpc_tx: mpsc::Sender<TcpStream>,
) -> Result<()> {
    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    if n == 0 {
        // Peer closed before sending anything
        return Ok(());
    }

    let target = if first[0] == CONSENSUS_TAG {
        &consensus_tx
    } else {
        &rpc_tx
    };

    target
        .send(stream)
        .await
        .map_err(|_| crate::Error::ShuttingDown)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::CLIENT_TAG;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_routes_by_first_byte() {
        let mux = ListenerMux::bind("127.0.0.1:0").await.unwrap();
        let addr = mux.local_addr().unwrap();
        let (mut consensus_rx, mut rpc_rx) = mux.serve();

        let mut raft_conn = TcpStream::connect(addr).await.unwrap();
        raft_conn.write_all(&[CONSENSUS_TAG]).await.unwrap();

        let mut client_conn = TcpStream::connect(addr).await.unwrap();
        client_conn.write_all(&[CLIENT_TAG]).await.unwrap();

        let routed_raft = consensus_rx.recv().await.unwrap();
        let mut tag = [0u8; 1];
        routed_raft.peek(&mut tag).await.unwrap();
        assert_eq!(tag[0], CONSENSUS_TAG);

        let routed_client = rpc_rx.recv().await.unwrap();
        routed_client.peek(&mut tag).await.unwrap();
        assert_eq!(tag[0], CLIENT_TAG);
    }
}
