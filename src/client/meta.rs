//! Meta server client
//!
//! Resolves a table name into its partition map. The configured meta
//! servers are tried at most once each per query, starting from the one that
//! last answered authoritatively.

use crate::client::partition::PartitionMap;
use crate::client::session::Session;
use crate::common::{ClientMetrics, Deadline, Error, ErrorKind, Result, Shutdown};
use crate::rpc::{MetaStatus, Request, Response};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct MetaClient {
    sessions: Vec<Session>,
    leader: AtomicUsize,
    attempt_timeout: Duration,
    metrics: Arc<ClientMetrics>,
}

impl MetaClient {
    pub fn new(
        addrs: &[String],
        attempt_timeout: Duration,
        connect_timeout: Duration,
        shutdown: Shutdown,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        let sessions = addrs
            .iter()
            .map(|addr| Session::new(addr.clone(), connect_timeout, shutdown.clone(), metrics.clone()))
            .collect();
        Self {
            sessions,
            leader: AtomicUsize::new(0),
            attempt_timeout,
            metrics,
        }
    }

    pub fn addrs(&self) -> Vec<&str> {
        self.sessions.iter().map(Session::addr).collect()
    }

    /// Address currently believed to be the meta leader
    pub fn leader(&self) -> &str {
        let n = self.sessions.len().max(1);
        self.sessions
            .get(self.leader.load(Ordering::Relaxed) % n)
            .map_or("", Session::addr)
    }

    /// Fetch the partition map of `table`.
    ///
    /// Errors: `InvalidTable` if the table does not exist, `Unreachable` once
    /// every meta server failed, `Timeout` when `deadline` elapses first,
    /// `Cancelled` on close.
    pub async fn query_config(&self, table: &str, deadline: Deadline) -> Result<PartitionMap> {
        self.metrics.meta_queries.inc();
        let n = self.sessions.len();
        let start = self.leader.load(Ordering::Relaxed);
        let mut last_err: Option<Error> = None;

        for i in 0..n {
            let idx = (start + i) % n;
            let session = &self.sessions[idx];
            if deadline.is_elapsed() {
                return Err(Error::Timeout(format!(
                    "query config of {}: deadline elapsed after {} attempts",
                    table, i
                )));
            }
            if i > 0 {
                self.metrics.meta_failovers.inc();
            }

            let request = Request::QueryConfig {
                table: table.to_string(),
            };
            let attempt = session
                .send(request, deadline.bounded_by(self.attempt_timeout))
                .await;

            match attempt {
                Ok(Response::QueryConfig(resp)) => match resp.status {
                    MetaStatus::Ok | MetaStatus::ObjectNotFound => {
                        self.leader.store(idx, Ordering::Relaxed);
                        let map = PartitionMap::from_response(table, resp)?;
                        tracing::debug!(
                            "Resolved {} from {}: {} partitions",
                            table,
                            session.addr(),
                            map.partition_count()
                        );
                        return Ok(map);
                    }
                    MetaStatus::ForwardToOthers { leader_hint } => {
                        tracing::debug!(
                            "Meta {} is not leader (hint: {:?}), trying next",
                            session.addr(),
                            leader_hint
                        );
                        last_err = Some(Error::Unreachable(format!(
                            "meta {} is not the leader",
                            session.addr()
                        )));
                    }
                    MetaStatus::Busy => {
                        tracing::debug!("Meta {} is busy, trying next", session.addr());
                        last_err = Some(Error::Unreachable(format!(
                            "meta {} is busy",
                            session.addr()
                        )));
                    }
                },
                Ok(other) => {
                    tracing::error!(
                        "Meta {} answered query config with {:?}",
                        session.addr(),
                        other
                    );
                    return Err(Error::Internal(format!(
                        "meta {} sent a non-config response",
                        session.addr()
                    )));
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) if e.kind() == ErrorKind::Timeout && deadline.is_elapsed() => {
                    return Err(Error::Timeout(format!(
                        "query config of {} via {}: {}",
                        table,
                        session.addr(),
                        e
                    )));
                }
                Err(e) => {
                    tracing::warn!(
                        "Meta {} failed for {}: {}, trying next",
                        session.addr(),
                        table,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(Error::Unreachable(format!(
            "all {} meta servers failed for table {}; last error: {}",
            n,
            table,
            last_err.map_or_else(|| "none".to_string(), |e| e.to_string())
        )))
    }

    pub fn close(&self) {
        for session in &self.sessions {
            session.close();
        }
    }
}
