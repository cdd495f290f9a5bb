//! Table connector: routing and stale-routing recovery for one table
//!
//! The connector serves operations from its current partition map. When a
//! replica reports `NotPrimary`/`StaleConfig` the map is refreshed from the
//! meta servers (one refresh in flight per table, shared by every operation
//! that hits stale routing meanwhile) and the operation is retried, a bounded
//! number of times. Operations on other partitions keep using the installed
//! map while the refresh runs.

use crate::client::flight::Ticket;
use crate::client::meta::MetaClient;
use crate::client::partition::PartitionMap;
use crate::client::router;
use crate::client::session::SessionPool;
use crate::common::{
    validate_hash_key, ClientMetrics, Deadline, Error, ErrorKind, OpKind, Result, Shutdown,
};
use crate::rpc::{Gpid, KeyRef, ReplicaResponse, ReplicaStatus, Request, Response};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// A single key operation. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OpKind,
    pub hash_key: Vec<u8>,
    pub sort_key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub deadline: Deadline,
}

impl Operation {
    pub fn get(hash_key: &[u8], sort_key: &[u8], deadline: impl Into<Deadline>) -> Self {
        Self {
            kind: OpKind::Get,
            hash_key: hash_key.to_vec(),
            sort_key: sort_key.to_vec(),
            value: None,
            deadline: deadline.into(),
        }
    }

    pub fn set(
        hash_key: &[u8],
        sort_key: &[u8],
        value: &[u8],
        deadline: impl Into<Deadline>,
    ) -> Self {
        Self {
            kind: OpKind::Set,
            hash_key: hash_key.to_vec(),
            sort_key: sort_key.to_vec(),
            value: Some(value.to_vec()),
            deadline: deadline.into(),
        }
    }

    pub fn del(hash_key: &[u8], sort_key: &[u8], deadline: impl Into<Deadline>) -> Self {
        Self {
            kind: OpKind::Del,
            hash_key: hash_key.to_vec(),
            sort_key: sort_key.to_vec(),
            value: None,
            deadline: deadline.into(),
        }
    }

    fn request(&self, gpid: Gpid) -> Request {
        let key = KeyRef {
            hash_key: self.hash_key.clone(),
            sort_key: self.sort_key.clone(),
        };
        match self.kind {
            OpKind::Get => Request::Get { gpid, key },
            OpKind::Set => Request::Set {
                gpid,
                key,
                value: self.value.clone().unwrap_or_default(),
            },
            OpKind::Del => Request::Del { gpid, key },
        }
    }

    fn describe_key(&self) -> String {
        format!(
            "{}/{}",
            String::from_utf8_lossy(&self.hash_key),
            String::from_utf8_lossy(&self.sort_key)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Resolved,
    Refreshing,
}

/// Timeouts and retry bound applied by a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Bound for one replica RPC
    pub rpc_timeout: Duration,
    /// Bound for one background refresh
    pub refresh_timeout: Duration,
    /// Refresh-and-retry cycles allowed per operation
    pub max_refresh_retries: u32,
}

struct Routing {
    map: RwLock<Arc<PartitionMap>>,
    refresh: Mutex<Option<Arc<Ticket<Arc<PartitionMap>>>>>,
}

pub struct TableConnector {
    table: String,
    routing: Arc<Routing>,
    meta: Arc<MetaClient>,
    pool: Arc<SessionPool>,
    policy: DispatchPolicy,
    shutdown: Shutdown,
    metrics: Arc<ClientMetrics>,
}

impl std::fmt::Debug for TableConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableConnector")
            .field("table", &self.table)
            .field("partitions", &self.partition_map().partition_count())
            .field("state", &self.state())
            .finish()
    }
}

impl TableConnector {
    pub fn new(
        map: PartitionMap,
        meta: Arc<MetaClient>,
        pool: Arc<SessionPool>,
        policy: DispatchPolicy,
        shutdown: Shutdown,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            table: map.table().to_string(),
            routing: Arc::new(Routing {
                map: RwLock::new(Arc::new(map)),
                refresh: Mutex::new(None),
            }),
            meta,
            pool,
            policy,
            shutdown,
            metrics,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// The installed partition map
    pub fn partition_map(&self) -> Arc<PartitionMap> {
        self.routing.map.read().unwrap().clone()
    }

    pub fn state(&self) -> ConnectorState {
        if self.routing.refresh.lock().unwrap().is_some() {
            ConnectorState::Refreshing
        } else {
            ConnectorState::Resolved
        }
    }

    pub async fn get(
        &self,
        hash_key: &[u8],
        sort_key: &[u8],
        deadline: impl Into<Deadline>,
    ) -> Result<Vec<u8>> {
        self.execute(Operation::get(hash_key, sort_key, deadline))
            .await
    }

    pub async fn set(
        &self,
        hash_key: &[u8],
        sort_key: &[u8],
        value: &[u8],
        deadline: impl Into<Deadline>,
    ) -> Result<()> {
        self.execute(Operation::set(hash_key, sort_key, value, deadline))
            .await
            .map(|_| ())
    }

    pub async fn del(
        &self,
        hash_key: &[u8],
        sort_key: &[u8],
        deadline: impl Into<Deadline>,
    ) -> Result<()> {
        self.execute(Operation::del(hash_key, sort_key, deadline))
            .await
            .map(|_| ())
    }

    /// Dispatch with metrics and table/operation context on errors.
    pub async fn execute(&self, op: Operation) -> Result<Vec<u8>> {
        let started = Instant::now();
        let result = self.dispatch(&op).await;
        let success = match &result {
            Ok(_) => true,
            Err(e) => e.kind() == ErrorKind::NotFound,
        };
        self.metrics.record_op(op.kind, started.elapsed(), success);
        result.map_err(|e| e.with_op(&self.table, op.kind))
    }

    /// Route `op` to its partition's primary and return the replica's value
    /// (empty for set/del).
    pub async fn dispatch(&self, op: &Operation) -> Result<Vec<u8>> {
        self.shutdown.check(&self.table)?;
        validate_hash_key(&op.hash_key)?;

        let mut retries = 0;
        loop {
            let map = self.partition_map();
            match self.send_once(&map, op).await {
                Err(e) if e.is_stale_routing() && retries < self.policy.max_refresh_retries => {
                    retries += 1;
                    tracing::debug!(
                        "{} {} on {}: {}; refreshing partition map (retry {})",
                        op.kind,
                        op.describe_key(),
                        self.table,
                        e,
                        retries
                    );
                    match self.refresh(&map, op.deadline).await {
                        Ok(()) => {}
                        // only the caller's own deadline or close ends the operation here
                        Err(re) if op.deadline.is_elapsed() || self.shutdown.is_triggered() => {
                            return Err(re)
                        }
                        Err(re) => tracing::warn!(
                            "Refresh of {} failed: {}; retrying with the installed map",
                            self.table,
                            re
                        ),
                    }
                }
                other => return other,
            }
        }
    }

    async fn send_once(&self, map: &PartitionMap, op: &Operation) -> Result<Vec<u8>> {
        let index = router::partition_of(&op.hash_key, map.partition_count());
        let gpid = map.gpid(index);
        let descriptor = map.partition(index).ok_or_else(|| {
            Error::Internal(format!("partition {} missing from map of {}", index, self.table))
        })?;
        let primary = descriptor
            .primary
            .as_deref()
            .ok_or_else(|| Error::NotPrimary(format!("partition {} has no primary", gpid)))?;

        let session = self.pool.session_for(primary)?;
        let response = session
            .send(op.request(gpid), op.deadline.bounded_by(self.policy.rpc_timeout))
            .await?;
        match response {
            Response::Replica(resp) => classify(resp, gpid, primary, op),
            other => {
                tracing::error!("Replica {} answered {} with {:?}", primary, op.kind, other);
                Err(Error::Internal(format!(
                    "replica {} sent a non-replica response",
                    primary
                )))
            }
        }
    }

    /// Refresh the partition map, sharing any refresh already in flight.
    ///
    /// Returns immediately when the map `seen` by the caller has already
    /// been replaced.
    async fn refresh(&self, seen: &Arc<PartitionMap>, deadline: Deadline) -> Result<()> {
        let ticket = {
            let mut slot = self.routing.refresh.lock().unwrap();
            if !Arc::ptr_eq(&self.partition_map(), seen) {
                return Ok(());
            }
            match slot.as_ref() {
                Some(ticket) => ticket.clone(),
                None => {
                    let ticket = Ticket::new();
                    *slot = Some(ticket.clone());
                    self.spawn_refresh(ticket.clone());
                    ticket
                }
            }
        };
        let what = format!("refresh {}", self.table);
        ticket.wait(&what, deadline, &self.shutdown).await.map(|_| ())
    }

    fn spawn_refresh(&self, ticket: Arc<Ticket<Arc<PartitionMap>>>) {
        let routing = self.routing.clone();
        let meta = self.meta.clone();
        let metrics = self.metrics.clone();
        let table = self.table.clone();
        let timeout = self.policy.refresh_timeout;
        let task_ticket = ticket.clone();

        let worker = self.metrics.tasks.spawn(async move {
            let ticket = task_ticket;
            metrics.table_refreshes.inc();
            let fetched = meta.query_config(&table, Deadline::after(timeout)).await;

            let outcome = {
                let mut slot = routing.refresh.lock().unwrap();
                let outcome = fetched.and_then(|fresh| {
                    let mut map = routing.map.write().unwrap();
                    let merged = Arc::new(map.merge_newer(fresh)?);
                    *map = merged.clone();
                    Ok(merged)
                });
                *slot = None;
                outcome
            };

            match &outcome {
                Ok(_) => tracing::debug!("Refreshed partition map of {}", table),
                Err(e) => tracing::warn!("Refresh of {} failed: {}", table, e),
            }
            ticket.complete(outcome);
        });
        ticket.set_worker(worker.abort_handle());
    }
}

fn classify(resp: ReplicaResponse, gpid: Gpid, addr: &str, op: &Operation) -> Result<Vec<u8>> {
    match resp.status {
        ReplicaStatus::Ok => Ok(resp.value),
        ReplicaStatus::NotFound => Err(Error::NotFound(op.describe_key())),
        ReplicaStatus::NotPrimary => Err(Error::NotPrimary(format!(
            "{} is not primary of {}",
            addr, gpid
        ))),
        ReplicaStatus::StaleConfig => Err(Error::StaleConfig(format!(
            "{} rejected stale config for {}",
            addr, gpid
        ))),
        ReplicaStatus::Busy => Err(Error::Unreachable(format!(
            "{} is busy serving {}",
            addr, gpid
        ))),
        ReplicaStatus::InvalidTable => Err(Error::InvalidTable(format!(
            "{} does not serve {}",
            addr, gpid
        ))),
        ReplicaStatus::Internal(msg) => {
            tracing::error!("Replica {} failed {} on {}: {}", addr, op.kind, gpid, msg);
            Err(Error::Internal(format!("{} on {}: {}", addr, gpid, msg)))
        }
    }
}
