//! In-process mock cluster
//!
//! Meta servers and replica servers listening on localhost, speaking the real
//! frame protocol, with knobs for the failures the client must survive: hung
//! or busy metas, leader changes, primaries moving between replicas, injected
//! replica errors and dropped connections.
//!
//! ```no_run
//! # async fn demo() -> minikv_client::Result<()> {
//! use minikv_client::testkit::MockCluster;
//!
//! let cluster = MockCluster::builder().metas(3).table("temp", 8).start().await?;
//! let client = minikv_client::Client::new(cluster.client_config())?;
//! # Ok(())
//! # }
//! ```

mod node;

use crate::common::{shutdown_channel, ClientConfig, Error, Result, ShutdownTrigger};
use crate::rpc::{PartitionConfig, ReplicaStatus};
use node::Role;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// How a meta server answers partition queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaMode {
    /// Answer normally (or forward to the leader)
    Serve,
    /// Read requests and never answer
    Hang,
    /// Answer every query with `Busy`
    Busy,
}

struct TableState {
    app_id: i32,
    partitions: Vec<PartitionConfig>,
}

type StoreKey = (i32, Vec<u8>, Vec<u8>);

#[derive(Default)]
pub(crate) struct ClusterState {
    meta_addrs: Vec<String>,
    replica_addrs: Vec<String>,
    tables: HashMap<String, TableState>,
    leader: usize,
    meta_modes: Vec<MetaMode>,
    queries: HashMap<String, u64>,
    // shared by all replicas, so data survives primary moves
    store: HashMap<StoreKey, Vec<u8>>,
    injected: HashMap<usize, VecDeque<ReplicaStatus>>,
}

#[derive(Debug, Clone)]
pub struct MockClusterBuilder {
    metas: usize,
    replicas: usize,
    tables: Vec<(String, u32)>,
    leader: usize,
}

impl Default for MockClusterBuilder {
    fn default() -> Self {
        Self {
            metas: 1,
            replicas: 3,
            tables: Vec::new(),
            leader: 0,
        }
    }
}

impl MockClusterBuilder {
    pub fn metas(mut self, count: usize) -> Self {
        self.metas = count;
        self
    }

    pub fn replicas(mut self, count: usize) -> Self {
        self.replicas = count;
        self
    }

    pub fn table(mut self, name: &str, partition_count: u32) -> Self {
        self.tables.push((name.to_string(), partition_count));
        self
    }

    pub fn leader(mut self, index: usize) -> Self {
        self.leader = index;
        self
    }

    /// Bind every node on an ephemeral localhost port and start serving.
    pub async fn start(self) -> Result<MockCluster> {
        if self.metas == 0 {
            return Err(Error::InvalidConfig("mock cluster needs a meta server".into()));
        }
        if self.leader >= self.metas {
            return Err(Error::InvalidConfig(format!(
                "leader {} out of range for {} metas",
                self.leader, self.metas
            )));
        }

        let metas = bind_all(self.metas).await?;
        let replicas = bind_all(self.replicas).await?;

        let mut state = ClusterState {
            meta_addrs: metas.iter().map(|(_, addr)| addr.clone()).collect(),
            replica_addrs: replicas.iter().map(|(_, addr)| addr.clone()).collect(),
            leader: self.leader,
            meta_modes: vec![MetaMode::Serve; self.metas],
            ..ClusterState::default()
        };
        for (i, (name, count)) in self.tables.iter().enumerate() {
            let partitions = (0..*count)
                .map(|index| placement(&state.replica_addrs, index, index as usize, 1))
                .collect();
            state.tables.insert(
                name.clone(),
                TableState {
                    app_id: i as i32 + 1,
                    partitions,
                },
            );
        }

        let state = Arc::new(Mutex::new(state));
        let (trigger, shutdown) = shutdown_channel();
        let mut kicks = Vec::new();
        let roles = (0..self.metas)
            .map(Role::Meta)
            .chain((0..self.replicas).map(Role::Replica));

        for ((listener, addr), role) in metas.into_iter().chain(replicas).zip(roles) {
            let (kick, kicked) = watch::channel(0u64);
            kicks.push(kick);
            tracing::debug!("Mock {:?} listening on {}", role, addr);
            tokio::spawn(node::serve(
                listener,
                role,
                state.clone(),
                shutdown.clone(),
                kicked,
            ));
        }

        Ok(MockCluster {
            state,
            trigger,
            kicks,
            metas: self.metas,
        })
    }
}

async fn bind_all(count: usize) -> Result<Vec<(TcpListener, String)>> {
    let mut bound = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::connection("127.0.0.1:0", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::connection("127.0.0.1:0", e))?
            .to_string();
        bound.push((listener, addr));
    }
    Ok(bound)
}

/// Primary on `replicas[primary % n]`, every other replica a secondary.
fn placement(replicas: &[String], index: u32, primary: usize, ballot: i64) -> PartitionConfig {
    if replicas.is_empty() {
        return PartitionConfig {
            index,
            ballot,
            primary: String::new(),
            secondaries: Vec::new(),
        };
    }
    let primary = primary % replicas.len();
    PartitionConfig {
        index,
        ballot,
        primary: replicas[primary].clone(),
        secondaries: replicas
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != primary)
            .map(|(_, addr)| addr.clone())
            .collect(),
    }
}

/// A running mock cluster. Stops serving when dropped.
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
    trigger: ShutdownTrigger,
    kicks: Vec<watch::Sender<u64>>,
    metas: usize,
}

impl MockCluster {
    pub fn builder() -> MockClusterBuilder {
        MockClusterBuilder::default()
    }

    pub fn meta_addrs(&self) -> Vec<String> {
        self.state.lock().unwrap().meta_addrs.clone()
    }

    pub fn replica_addrs(&self) -> Vec<String> {
        self.state.lock().unwrap().replica_addrs.clone()
    }

    /// Client configuration pointing at every meta server, in order
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.meta_addrs())
    }

    pub fn set_meta_mode(&self, meta: usize, mode: MetaMode) {
        self.state.lock().unwrap().meta_modes[meta] = mode;
    }

    pub fn set_leader(&self, meta: usize) {
        self.state.lock().unwrap().leader = meta;
    }

    /// Number of partition queries received for `table`, across all metas
    pub fn meta_queries(&self, table: &str) -> u64 {
        self.state
            .lock()
            .unwrap()
            .queries
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    pub fn primary_of(&self, table: &str, partition: u32) -> Option<String> {
        let state = self.state.lock().unwrap();
        let p = state.tables.get(table)?.partitions.get(partition as usize)?;
        (!p.primary.is_empty()).then(|| p.primary.clone())
    }

    pub fn ballot_of(&self, table: &str, partition: u32) -> Option<i64> {
        let state = self.state.lock().unwrap();
        Some(state.tables.get(table)?.partitions.get(partition as usize)?.ballot)
    }

    /// Make `replica` the primary of one partition, bumping its ballot. The
    /// old primary starts answering `NotPrimary` immediately.
    pub fn move_primary(&self, table: &str, partition: u32, replica: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if replica >= state.replica_addrs.len() {
            return Err(Error::InvalidArgument(format!("no replica {}", replica)));
        }
        let replicas = state.replica_addrs.clone();
        let slot = state
            .tables
            .get_mut(table)
            .and_then(|t| t.partitions.get_mut(partition as usize))
            .ok_or_else(|| Error::InvalidTable(format!("{}.{}", table, partition)))?;
        *slot = placement(&replicas, partition, replica, slot.ballot + 1);
        tracing::debug!("Moved {}.{} to {}", table, partition, slot.primary);
        Ok(())
    }

    /// Replace the partitions of `table` with `partition_count` fresh ones,
    /// keeping its app id.
    pub fn repartition(&self, table: &str, partition_count: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let replicas = state.replica_addrs.clone();
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::InvalidTable(table.to_string()))?;
        entry.partitions = (0..partition_count)
            .map(|index| placement(&replicas, index, index as usize, 1))
            .collect();
        tracing::debug!("Repartitioned {} into {}", table, partition_count);
        Ok(())
    }

    /// Answer the next `count` requests reaching `replica` with `status`.
    pub fn inject_replica_errors(&self, replica: usize, status: ReplicaStatus, count: usize) {
        let mut state = self.state.lock().unwrap();
        let queue = state.injected.entry(replica).or_default();
        queue.extend(std::iter::repeat(status).take(count));
    }

    /// Drop every open connection to `replica`; it keeps accepting new ones.
    pub fn disconnect_replica(&self, replica: usize) {
        if let Some(kick) = self.kicks.get(self.metas + replica) {
            kick.send_modify(|generation| *generation += 1);
        }
    }

    /// Number of keys stored across all tables
    pub fn key_count(&self) -> usize {
        self.state.lock().unwrap().store.len()
    }

    pub fn stored(&self, table: &str, hash_key: &[u8], sort_key: &[u8]) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let app_id = state.tables.get(table)?.app_id;
        state
            .store
            .get(&(app_id, hash_key.to_vec(), sort_key.to_vec()))
            .cloned()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        if self.trigger.trigger() {
            tracing::debug!("Mock cluster shut down");
        }
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
