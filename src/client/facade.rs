//! Public client entry point

use crate::client::connector::{DispatchPolicy, TableConnector};
use crate::client::meta::MetaClient;
use crate::client::registry::ConnectorRegistry;
use crate::client::session::SessionPool;
use crate::common::{
    shutdown_channel, ClientConfig, ClientMetrics, Deadline, MetricsSnapshot, OpKind, Result,
    Shutdown, ShutdownTrigger,
};
use std::sync::Arc;
use std::time::Duration;

/// Handle on one cluster.
///
/// Owns the session pool, the meta client and the table registry. Every
/// operation takes a deadline: a `Duration`, a `tokio::time::Instant`, or
/// [`Deadline::none()`]. After [`Client::close`] every call fails with
/// `Cancelled`.
pub struct Client {
    config: ClientConfig,
    registry: Arc<ConnectorRegistry>,
    meta: Arc<MetaClient>,
    pool: Arc<SessionPool>,
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
    metrics: Arc<ClientMetrics>,
}

impl Client {
    /// Build a client. No connection is made until the first call.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let (trigger, shutdown) = shutdown_channel();
        let metrics = Arc::new(ClientMetrics::new());
        let meta = Arc::new(MetaClient::new(
            &config.meta_servers,
            config.meta_timeout(),
            config.connect_timeout(),
            shutdown.clone(),
            metrics.clone(),
        ));
        let pool = Arc::new(SessionPool::new(
            config.connect_timeout(),
            shutdown.clone(),
            metrics.clone(),
        ));
        let policy = DispatchPolicy {
            rpc_timeout: config.operation_timeout(),
            refresh_timeout: config.operation_timeout(),
            max_refresh_retries: config.max_refresh_retries,
        };
        let registry = Arc::new(ConnectorRegistry::new(
            meta.clone(),
            pool.clone(),
            policy,
            config.operation_timeout(),
            shutdown.clone(),
            metrics.clone(),
        ));

        tracing::debug!("Client created for meta servers {:?}", config.meta_servers);
        Ok(Self {
            config,
            registry,
            meta,
            pool,
            trigger,
            shutdown,
            metrics,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Resolve `table`, reusing the cached connector when there is one.
    pub async fn open_table(
        &self,
        table: &str,
        deadline: impl Into<Deadline>,
    ) -> Result<Arc<TableConnector>> {
        self.shutdown.check(&format!("open {}", table))?;
        self.registry.resolve(table, deadline.into()).await
    }

    pub async fn get(
        &self,
        table: &str,
        hash_key: &[u8],
        sort_key: &[u8],
        deadline: impl Into<Deadline>,
    ) -> Result<Vec<u8>> {
        let deadline = deadline.into();
        let connector = self.connector(table, OpKind::Get, deadline).await?;
        connector.get(hash_key, sort_key, deadline).await
    }

    pub async fn set(
        &self,
        table: &str,
        hash_key: &[u8],
        sort_key: &[u8],
        value: &[u8],
        deadline: impl Into<Deadline>,
    ) -> Result<()> {
        let deadline = deadline.into();
        let connector = self.connector(table, OpKind::Set, deadline).await?;
        connector.set(hash_key, sort_key, value, deadline).await
    }

    pub async fn del(
        &self,
        table: &str,
        hash_key: &[u8],
        sort_key: &[u8],
        deadline: impl Into<Deadline>,
    ) -> Result<()> {
        let deadline = deadline.into();
        let connector = self.connector(table, OpKind::Del, deadline).await?;
        connector.del(hash_key, sort_key, deadline).await
    }

    async fn connector(
        &self,
        table: &str,
        op: OpKind,
        deadline: Deadline,
    ) -> Result<Arc<TableConnector>> {
        self.open_table(table, deadline)
            .await
            .map_err(|e| e.with_op(table, op))
    }

    /// Tables resolved so far
    pub fn tables(&self) -> Vec<String> {
        self.registry.cached_tables()
    }

    pub fn is_closed(&self) -> bool {
        self.trigger.is_triggered()
    }

    /// Stop the client. Pending calls return `Cancelled`, connections are
    /// closed and background tasks exit. Calling it again does nothing.
    pub fn close(&self) {
        if !self.trigger.trigger() {
            return;
        }
        self.registry.close();
        self.pool.close();
        self.meta.close();
        tracing::info!(
            "Client closed ({} live tasks winding down)",
            self.metrics.tasks.live()
        );
    }

    /// Close and wait up to `within` for every background task to exit.
    /// Returns `false` if some were still running.
    pub async fn shutdown(&self, within: Duration) -> bool {
        self.close();
        self.metrics.tasks.wait_idle(within).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Metrics in Prometheus text format
    pub fn prometheus(&self) -> String {
        self.metrics.to_prometheus()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorKind;

    #[test]
    fn test_rejects_invalid_config() {
        let err = Client::new(ClientConfig::new(Vec::<String>::new())).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_closed_client_cancels_immediately() {
        let client = Client::new(ClientConfig::new(["127.0.0.1:1"])).unwrap();
        client.close();
        client.close();
        assert!(client.is_closed());

        let err = client
            .get("temp", b"h0", b"s0", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let err = client.open_table("temp", Deadline::none()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(client.shutdown(Duration::from_secs(1)).await);
    }
}
