//! Sessions to cluster nodes and the pool sharing them
//!
//! A [`Session`] is the client's handle on one node address. The TCP
//! connection behind it is established on first use and re-established on
//! the next use after it breaks; `send` itself never retries.

use crate::common::{ClientMetrics, Deadline, Error, Result, Shutdown};
use crate::rpc::{Request, Response, RpcConnection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct Session {
    addr: String,
    current: Mutex<Option<Arc<RpcConnection>>>,
    // serializes dialing so concurrent first users share one connection
    connecting: tokio::sync::Mutex<()>,
    connect_timeout: Duration,
    shutdown: Shutdown,
    metrics: Arc<ClientMetrics>,
}

impl Session {
    pub fn new(
        addr: impl Into<String>,
        connect_timeout: Duration,
        shutdown: Shutdown,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            addr: addr.into(),
            current: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            connect_timeout,
            shutdown,
            metrics,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether a healthy connection currently exists
    pub fn is_connected(&self) -> bool {
        self.healthy().is_some()
    }

    /// Send one request, bounded by `deadline`.
    ///
    /// Timing out only abandons this caller's wait; the connection stays up
    /// for other callers. After close, returns `Cancelled`.
    pub async fn send(&self, request: Request, deadline: Deadline) -> Result<Response> {
        let what = format!("send to {}", self.addr);
        self.shutdown.check(&what)?;
        let conn = self
            .shutdown
            .guard(&what, deadline.run(&what, self.connection()))
            .await?;
        self.shutdown
            .guard(&what, conn.call(request, deadline))
            .await
    }

    fn healthy(&self) -> Option<Arc<RpcConnection>> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .filter(|conn| !conn.is_broken())
            .cloned()
    }

    async fn connection(&self) -> Result<Arc<RpcConnection>> {
        if let Some(conn) = self.healthy() {
            return Ok(conn);
        }

        let _connecting = self.connecting.lock().await;
        if let Some(conn) = self.healthy() {
            return Ok(conn);
        }

        if self.current.lock().unwrap().is_some() {
            tracing::debug!("Reconnecting to {}", self.addr);
        }
        let conn = Arc::new(
            RpcConnection::connect(
                &self.addr,
                Deadline::after(self.connect_timeout),
                &self.shutdown,
                &self.metrics.tasks,
            )
            .await?,
        );
        self.metrics.connections_opened.inc();
        *self.current.lock().unwrap() = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the connection. Its tasks stop once shutdown has been signalled
    /// or the last in-flight call releases it.
    pub fn close(&self) {
        self.current.lock().unwrap().take();
    }
}

#[derive(Default)]
struct PoolState {
    closed: bool,
    sessions: HashMap<String, Arc<Session>>,
}

/// Sessions keyed by node address, shared by every table connector.
pub struct SessionPool {
    state: Mutex<PoolState>,
    connect_timeout: Duration,
    shutdown: Shutdown,
    metrics: Arc<ClientMetrics>,
}

impl SessionPool {
    pub fn new(connect_timeout: Duration, shutdown: Shutdown, metrics: Arc<ClientMetrics>) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            connect_timeout,
            shutdown,
            metrics,
        }
    }

    /// Get or create the session for `addr`. No connection is made here.
    pub fn session_for(&self, addr: &str) -> Result<Arc<Session>> {
        let mut state = self.state.lock().unwrap();
        if state.closed || self.shutdown.is_triggered() {
            return Err(Error::Cancelled(format!(
                "session to {}: client closed",
                addr
            )));
        }
        let session = state
            .sessions
            .entry(addr.to_string())
            .or_insert_with(|| {
                tracing::debug!("New session for {}", addr);
                Arc::new(Session::new(
                    addr,
                    self.connect_timeout,
                    self.shutdown.clone(),
                    self.metrics.clone(),
                ))
            })
            .clone();
        Ok(session)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.state.lock().unwrap().sessions.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Close every session. Waiters are released by the shutdown signal,
    /// which the owner fires before calling this.
    pub fn close(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{shutdown_channel, ErrorKind};
    use crate::rpc::codec::{read_frame, write_frame};
    use crate::rpc::{Frame, MetaStatus, QueryConfigResponse};
    use tokio::net::TcpListener;

    /// Answers every request with ObjectNotFound; drops each connection
    /// after `per_conn` responses.
    async fn flaky_server(per_conn: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.into_split();
                    for _ in 0..per_conn {
                        let Ok(Some(req)) = read_frame::<_, Frame<Request>>(&mut r).await else {
                            return;
                        };
                        let resp = Frame {
                            seq: req.seq,
                            body: Response::QueryConfig(QueryConfigResponse::with_status(
                                MetaStatus::ObjectNotFound,
                            )),
                        };
                        if write_frame(&mut w, &resp).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn query() -> Request {
        Request::QueryConfig {
            table: "temp".into(),
        }
    }

    #[tokio::test]
    async fn test_lazy_connect_and_reconnect() {
        let addr = flaky_server(1).await;
        let (_trigger, shutdown) = shutdown_channel();
        let metrics = Arc::new(ClientMetrics::new());
        let pool = SessionPool::new(Duration::from_secs(1), shutdown, metrics.clone());

        let session = pool.session_for(&addr).unwrap();
        assert!(!session.is_connected());
        assert_eq!(metrics.connections_opened.get(), 0);

        session
            .send(query(), Deadline::after(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(metrics.connections_opened.get(), 1);

        // the server hangs up after one reply; wait until the session notices
        tokio::time::timeout(Duration::from_secs(2), async {
            while session.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        session
            .send(query(), Deadline::after(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(metrics.connections_opened.get(), 2);
    }

    #[tokio::test]
    async fn test_pool_shares_sessions() {
        let (_trigger, shutdown) = shutdown_channel();
        let pool = SessionPool::new(
            Duration::from_secs(1),
            shutdown,
            Arc::new(ClientMetrics::new()),
        );
        let a = pool.session_for("127.0.0.1:34801").unwrap();
        let b = pool.session_for("127.0.0.1:34801").unwrap();
        let c = pool.session_for("127.0.0.1:34802").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.addresses(), vec!["127.0.0.1:34801", "127.0.0.1:34802"]);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let (trigger, shutdown) = shutdown_channel();
        let pool = SessionPool::new(
            Duration::from_secs(1),
            shutdown,
            Arc::new(ClientMetrics::new()),
        );
        let session = pool.session_for("127.0.0.1:34801").unwrap();

        trigger.trigger();
        pool.close();
        assert!(pool.is_empty());
        assert_eq!(
            pool.session_for("127.0.0.1:34801").err().unwrap().kind(),
            ErrorKind::Cancelled
        );
        let err = session.send(query(), Deadline::none()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
