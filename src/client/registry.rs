//! Connector registry
//!
//! Caches one [`TableConnector`] per table name and makes sure concurrent
//! first opens of a table share a single meta query. The cache and the
//! in-flight tickets live under one mutex that is never held across an await.
//!
//! A resolution runs in its own task, bounded by the operation timeout, so a
//! caller giving up early does not cancel it for the others. Once every
//! attached caller has given up, the task is aborted.

use crate::client::connector::{DispatchPolicy, TableConnector};
use crate::client::flight::Ticket;
use crate::client::meta::MetaClient;
use crate::client::session::SessionPool;
use crate::common::{validate_table_name, ClientMetrics, Deadline, Error, Result, Shutdown};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Resolution = Ticket<Arc<TableConnector>>;

#[derive(Default)]
struct RegistryState {
    closed: bool,
    connectors: HashMap<String, Arc<TableConnector>>,
    pending: HashMap<String, Arc<Resolution>>,
}

pub struct ConnectorRegistry {
    state: Mutex<RegistryState>,
    meta: Arc<MetaClient>,
    pool: Arc<SessionPool>,
    policy: DispatchPolicy,
    resolve_timeout: Duration,
    shutdown: Shutdown,
    metrics: Arc<ClientMetrics>,
}

/// Detaches a waiter from its ticket, abandoning the ticket if it was the
/// last one and the resolution is still running.
struct Attachment<'a> {
    registry: &'a ConnectorRegistry,
    table: &'a str,
    ticket: &'a Arc<Resolution>,
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        let abandoned = {
            let mut state = self.registry.state.lock().unwrap();
            let remaining = self.ticket.detach();
            let current = state
                .pending
                .get(self.table)
                .is_some_and(|t| Arc::ptr_eq(t, self.ticket));
            if remaining == 0 && current && !self.ticket.is_complete() {
                state.pending.remove(self.table)
            } else {
                None
            }
        };
        if let Some(ticket) = abandoned {
            tracing::debug!("Abandoning resolution of {}: no waiters left", self.table);
            ticket.abandon(&format!("resolve {}", self.table));
        }
    }
}

impl ConnectorRegistry {
    pub fn new(
        meta: Arc<MetaClient>,
        pool: Arc<SessionPool>,
        policy: DispatchPolicy,
        resolve_timeout: Duration,
        shutdown: Shutdown,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            meta,
            pool,
            policy,
            resolve_timeout,
            shutdown,
            metrics,
        }
    }

    /// Return the connector for `table`, resolving it on first use.
    ///
    /// Concurrent callers for an unresolved table share one resolution and
    /// observe the same outcome; each waits only as long as its own
    /// `deadline`.
    pub async fn resolve(
        self: &Arc<Self>,
        table: &str,
        deadline: Deadline,
    ) -> Result<Arc<TableConnector>> {
        validate_table_name(table)?;
        let what = format!("resolve {}", table);

        let ticket = {
            let mut state = self.state.lock().unwrap();
            if state.closed || self.shutdown.is_triggered() {
                return Err(Error::Cancelled(format!("{}: client closed", what)));
            }
            if let Some(connector) = state.connectors.get(table) {
                return Ok(connector.clone());
            }
            let ticket = match state.pending.get(table) {
                Some(ticket) => ticket.clone(),
                None => {
                    let ticket = Ticket::new();
                    state.pending.insert(table.to_string(), ticket.clone());
                    self.spawn_resolution(table, ticket.clone());
                    ticket
                }
            };
            ticket.attach();
            ticket
        };

        let _attached = Attachment {
            registry: self,
            table,
            ticket: &ticket,
        };
        ticket.wait(&what, deadline, &self.shutdown).await
    }

    fn spawn_resolution(self: &Arc<Self>, table: &str, ticket: Arc<Resolution>) {
        let registry = self.clone();
        let table = table.to_string();
        let task_ticket = ticket.clone();

        let worker = self.metrics.tasks.spawn(async move {
            let ticket = task_ticket;
            registry.metrics.table_resolutions.inc();
            let fetched = registry
                .meta
                .query_config(&table, Deadline::after(registry.resolve_timeout))
                .await;

            // install and retire the ticket together, then publish
            let outcome = {
                let mut state = registry.state.lock().unwrap();
                let outcome = match fetched {
                    // a failure after close is the close itself, not the cluster
                    _ if state.closed || registry.shutdown.is_triggered() => {
                        Err(Error::Cancelled(format!("resolve {}: client closed", table)))
                    }
                    Ok(map) => {
                        let connector = Arc::new(TableConnector::new(
                            map,
                            registry.meta.clone(),
                            registry.pool.clone(),
                            registry.policy,
                            registry.shutdown.clone(),
                            registry.metrics.clone(),
                        ));
                        state.connectors.insert(table.clone(), connector.clone());
                        Ok(connector)
                    }
                    Err(e) => Err(e),
                };
                if state
                    .pending
                    .get(&table)
                    .is_some_and(|t| Arc::ptr_eq(t, &ticket))
                {
                    state.pending.remove(&table);
                }
                outcome
            };

            match &outcome {
                Ok(connector) => tracing::info!(
                    "Opened table {} ({} partitions)",
                    table,
                    connector.partition_map().partition_count()
                ),
                Err(e) => tracing::debug!("Resolution of {} failed: {}", table, e),
            }
            ticket.complete(outcome);
        });
        ticket.set_worker(worker.abort_handle());
    }

    /// Cached connector for `table`, without resolving
    pub fn get(&self, table: &str) -> Option<Arc<TableConnector>> {
        self.state.lock().unwrap().connectors.get(table).cloned()
    }

    pub fn cached_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .connectors
            .keys()
            .cloned()
            .collect();
        tables.sort();
        tables
    }

    /// Number of resolutions in flight
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Drop every connector and abandon in-flight resolutions.
    pub fn close(&self) {
        let (connectors, pending) = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            let connectors = state.connectors.len();
            state.connectors.clear();
            let pending: Vec<(String, Arc<Resolution>)> = state.pending.drain().collect();
            (connectors, pending)
        };
        for (table, ticket) in &pending {
            ticket.abandon(&format!("resolve {}", table));
        }
        tracing::debug!(
            "Registry closed: {} connectors dropped, {} resolutions abandoned",
            connectors,
            pending.len()
        );
    }
}
