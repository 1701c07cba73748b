//! Node Agent
//!
//! Wires a full node together: the shared listener and its
//! demultiplexer, the replicated log, the RPC server, and gossip
//! membership, torn down in the reverse order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio_rustls::rustls;

use crate::auth::Authorizer;
use crate::cluster::ClusterHandler;
use crate::config::{ConsensusConfig, SegmentConfig};
use crate::discovery::{Membership, MembershipConfig, RPC_ADDR_TAG};
use crate::distributed::{DistributedConfig, DistributedLog};
use crate::error::{Error, Result};
use crate::net::{ListenerMux, StreamLayer};
use crate::server::RpcServer;

/// Agent configuration
#[derive(Clone)]
pub struct AgentConfig {
    /// Unique node name
    pub node_name: String,
    /// Gossip bind address (host:port)
    pub bind_addr: String,
    /// Port for the shared RPC/consensus listener (0 picks a free one)
    pub rpc_port: u16,
    /// Data directory
    pub data_dir: PathBuf,
    /// Bootstrap the cluster with this node
    pub bootstrap: bool,
    /// Gossip addresses of existing members
    pub start_join_addrs: Vec<String>,
    /// Segment limits
    pub segment: SegmentConfig,
    /// Consensus timing
    pub consensus: ConsensusConfig,
    /// ACL model file
    pub acl_model_file: Option<PathBuf>,
    /// ACL policy file
    pub acl_policy_file: Option<PathBuf>,
    /// TLS served to clients and peers
    pub server_tls: Option<Arc<rustls::ServerConfig>>,
    /// TLS used when dialing peers
    pub peer_tls: Option<Arc<rustls::ClientConfig>>,
}

impl AgentConfig {
    /// Host component of the gossip bind address
    fn bind_host(&self) -> Result<&str> {
        self.bind_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .ok_or_else(|| Error::Config(format!("invalid bind_addr: {}", self.bind_addr)))
    }
}

/// A running packlog node
pub struct Agent {
    log: Arc<DistributedLog>,
    membership: Membership,
    cluster: Arc<ClusterHandler>,
    rpc_addr: String,
    server_shutdown: watch::Sender<bool>,
    mux_shutdown: watch::Sender<bool>,
    shutdown: Mutex<bool>,
}

impl Agent {
    /// Build and start a node: listener mux, replicated log, RPC
    /// server, then membership
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let host = config.bind_host()?.to_string();

        // Shared listener, demultiplexed by first byte
        let mux = ListenerMux::bind(&format!("{}:{}", host, config.rpc_port)).await?;
        let rpc_addr = format!("{}:{}", host, mux.local_addr()?.port());
        let mux_shutdown = mux.shutdown_handle();
        let (consensus_rx, rpc_rx) = mux.serve();
        tracing::info!(addr = %rpc_addr, "listener mux started");

        let layer = Arc::new(StreamLayer::new(
            consensus_rx,
            mux_shutdown.clone(),
            config.server_tls.clone(),
            config.peer_tls.clone(),
        ));

        // Replicated log
        let log = Arc::new(DistributedLog::new(
            &config.data_dir,
            DistributedConfig {
                local_id: config.node_name.clone(),
                local_addr: rpc_addr.clone(),
                bootstrap: config.bootstrap,
                segment: config.segment,
                consensus: config.consensus.clone(),
            },
            layer,
        )?);

        // RPC server
        let authorizer = Arc::new(Authorizer::new(
            config.acl_model_file.as_deref(),
            config.acl_policy_file.as_deref(),
        )?);
        let rpc = Arc::new(RpcServer::new(
            Arc::clone(&log),
            authorizer,
            config.server_tls.clone(),
        ));
        let (server_shutdown, server_shutdown_rx) = watch::channel(false);
        let _server_task = rpc.serve(rpc_rx, server_shutdown_rx);

        // Membership
        let cluster = Arc::new(ClusterHandler::new(Arc::clone(&log)));
        let mut tags = HashMap::new();
        tags.insert(RPC_ADDR_TAG.to_string(), rpc_addr.clone());
        let handler: Arc<dyn crate::discovery::Handler> = cluster.clone();
        let membership = Membership::new(
            handler,
            MembershipConfig {
                node_name: config.node_name.clone(),
                bind_addr: config.bind_addr.clone(),
                tags,
                start_join_addrs: config.start_join_addrs.clone(),
            },
        )
        .await?;

        tracing::info!(node = %config.node_name, "agent started");

        Ok(Self {
            log,
            membership,
            cluster,
            rpc_addr,
            server_shutdown,
            mux_shutdown,
            shutdown: Mutex::new(false),
        })
    }

    /// The replicated log facade
    pub fn log(&self) -> Arc<DistributedLog> {
        Arc::clone(&self.log)
    }

    /// Address clients dial for RPC
    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    /// Address of the gossip socket
    pub fn gossip_addr(&self) -> String {
        self.membership
            .members()
            .first()
            .map(|m| m.addr.clone())
            .unwrap_or_default()
    }

    /// Stop the node: leave gossip, stop the RPC server, close the
    /// log, then close the listener. Safe to call twice; a later
    /// stage still runs when an earlier one fails.
    pub async fn shutdown(&self) -> Result<()> {
        let mut done = self.shutdown.lock().await;
        if *done {
            return Ok(());
        }
        *done = true;

        let mut first_error = None;

        if let Err(e) = self.membership.leave().await {
            tracing::error!("membership leave failed: {}", e);
            first_error.get_or_insert(e);
        }
        self.cluster.close().await;

        let _ = self.server_shutdown.send(true);

        if let Err(e) = self.log.close().await {
            tracing::error!("log close failed: {}", e);
            first_error.get_or_insert(e);
        }

        let _ = self.mux_shutdown.send(true);

        tracing::info!("agent stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::Record;
    use crate::server::LogClient;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestAgent {
        agent: Agent,
        _dir: TempDir,
    }

    async fn start_agent(
        name: &str,
        bootstrap: bool,
        join_addrs: Vec<String>,
        acl: Option<(PathBuf, PathBuf)>,
    ) -> TestAgent {
        let dir = tempfile::tempdir().unwrap();
        let (acl_model_file, acl_policy_file) = match acl {
            Some((model, policy)) => (Some(model), Some(policy)),
            None => (None, None),
        };

        let config = AgentConfig {
            node_name: name.to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            rpc_port: 0,
            data_dir: dir.path().to_path_buf(),
            bootstrap,
            start_join_addrs: join_addrs,
            segment: SegmentConfig::default(),
            consensus: ConsensusConfig {
                heartbeat_interval_ms: 50,
                election_timeout_min_ms: 150,
                election_timeout_max_ms: 300,
                apply_timeout_ms: 10_000,
                snapshot_threshold: 0,
            },
            acl_model_file,
            acl_policy_file,
            server_tls: None,
            peer_tls: None,
        };

        let agent = Agent::new(config).await.unwrap();
        TestAgent { agent, _dir: dir }
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_produce_consume() {
        let node = start_agent("node-1", true, vec![], None).await;
        node.agent
            .log()
            .wait_for_leader(Duration::from_secs(10))
            .await
            .unwrap();

        let mut client = LogClient::connect(node.agent.rpc_addr(), None)
            .await
            .unwrap();

        let offset = client
            .produce(Record::new(b"hello world".to_vec()))
            .await
            .unwrap();
        assert_eq!(offset, 0);

        let record = client.consume(0).await.unwrap();
        assert_eq!(record.value, b"hello world");
        assert_eq!(record.offset, 0);

        node.agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_consume_past_boundary() {
        let node = start_agent("node-1", true, vec![], None).await;
        node.agent
            .log()
            .wait_for_leader(Duration::from_secs(10))
            .await
            .unwrap();

        let mut client = LogClient::connect(node.agent.rpc_addr(), None)
            .await
            .unwrap();

        let produced = client
            .produce(Record::new(b"hello world".to_vec()))
            .await
            .unwrap();

        let result = client.consume(produced + 1).await;
        assert!(matches!(result, Err(Error::OffsetOutOfRange(_))));

        node.agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_client() {
        // Policy grants nothing to the anonymous subject
        let acl_dir = tempfile::tempdir().unwrap();
        let model = acl_dir.path().join("model.conf");
        std::fs::File::create(&model).unwrap();
        let policy = acl_dir.path().join("policy.csv");
        let mut file = std::fs::File::create(&policy).unwrap();
        file.write_all(b"p, root, *, produce\np, root, *, consume\n")
            .unwrap();

        let node = start_agent("node-1", true, vec![], Some((model, policy))).await;
        node.agent
            .log()
            .wait_for_leader(Duration::from_secs(10))
            .await
            .unwrap();

        let mut client = LogClient::connect(node.agent.rpc_addr(), None)
            .await
            .unwrap();

        let produce = client.produce(Record::new(b"denied".to_vec())).await;
        assert!(matches!(produce, Err(Error::PermissionDenied { .. })));

        let consume = client.consume(0).await;
        assert!(matches!(consume, Err(Error::PermissionDenied { .. })));

        node.agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_produce_consume_streams() {
        let node = start_agent("node-1", true, vec![], None).await;
        node.agent
            .log()
            .wait_for_leader(Duration::from_secs(10))
            .await
            .unwrap();

        let payloads: Vec<&[u8]> = vec![b"first", b"second", b"third", b"fourth", b"fifth"];

        let producer = LogClient::connect(node.agent.rpc_addr(), None)
            .await
            .unwrap();
        let mut produce_stream = producer.produce_stream().await.unwrap();
        for (i, payload) in payloads.iter().enumerate() {
            let offset = produce_stream
                .send(Record::new(payload.to_vec()))
                .await
                .unwrap();
            assert_eq!(offset, i as u64);
        }

        let consumer = LogClient::connect(node.agent.rpc_addr(), None)
            .await
            .unwrap();
        let mut consume_stream = consumer.consume_stream(0).await.unwrap();
        for (i, payload) in payloads.iter().enumerate() {
            let record = consume_stream.next().await.unwrap();
            assert_eq!(record.offset, i as u64);
            assert_eq!(&record.value, payload);
        }

        node.agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_replication_across_cluster() {
        let leader = start_agent("node-1", true, vec![], None).await;
        leader
            .agent
            .log()
            .wait_for_leader(Duration::from_secs(10))
            .await
            .unwrap();
        let seed = leader.agent.gossip_addr();

        let follower_2 = start_agent("node-2", false, vec![seed.clone()], None).await;
        let follower_3 = start_agent("node-3", false, vec![seed], None).await;

        // Membership flows into the consensus configuration
        wait_until("three voters", || {
            leader.agent.log().get_servers().len() == 3
        })
        .await;

        let mut client = LogClient::connect(leader.agent.rpc_addr(), None)
            .await
            .unwrap();
        let offset = client
            .produce(Record::new(b"replicated".to_vec()))
            .await
            .unwrap();

        // Followers serve the record from their local logs
        for follower in [&follower_2, &follower_3] {
            let mut replicated = false;
            for _ in 0..300 {
                if let Ok(mut follower_client) =
                    LogClient::connect(follower.agent.rpc_addr(), None).await
                {
                    if let Ok(record) = follower_client.consume(offset).await {
                        if record.value == b"replicated" {
                            replicated = true;
                            break;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            assert!(replicated, "record did not replicate to follower");
        }

        // Server listing marks exactly one leader
        let servers = client.get_servers().await.unwrap();
        assert_eq!(servers.len(), 3);
        assert_eq!(servers.iter().filter(|s| s.is_leader).count(), 1);

        // A departing node shrinks the configuration
        follower_3.agent.shutdown().await.unwrap();
        wait_until("two voters", || {
            leader.agent.log().get_servers().len() == 2
        })
        .await;

        follower_2.agent.shutdown().await.unwrap();
        leader.agent.shutdown().await.unwrap();
    }
}
