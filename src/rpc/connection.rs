//! Multiplexed request/response connection
//!
//! One TCP stream carries many in-flight requests. A writer task drains an
//! outbound queue, a reader task matches responses to waiters by sequence id.
//! A caller that gives up (deadline, drop) removes its own pending entry and
//! leaves the stream untouched for everybody else.

use crate::common::{Deadline, Error, ErrorKind, Result, Shutdown, TaskCounter};
use crate::rpc::codec::{read_frame, write_frame};
use crate::rpc::message::{Frame, Request, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};

const OUTBOUND_QUEUE: usize = 1024;

type Waiter = oneshot::Sender<Result<Response>>;

struct Shared {
    addr: String,
    pending: Mutex<HashMap<u64, Waiter>>,
    broken: AtomicBool,
    reader_done: Notify,
}

impl Shared {
    /// Mark the connection unusable and fail every pending request with `err`.
    fn fail_all(&self, err: Error) {
        let drained: Vec<Waiter> = {
            let mut pending = self.pending.lock().unwrap();
            self.broken.store(true, Ordering::SeqCst);
            pending.drain().map(|(_, tx)| tx).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(
                "Failing {} pending requests to {}: {}",
                drained.len(),
                self.addr,
                err
            );
        }
        for tx in drained {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

/// Removes a pending entry if its caller stops waiting before the response.
struct PendingGuard<'a> {
    shared: &'a Shared,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().unwrap().remove(&self.seq);
    }
}

pub struct RpcConnection {
    shared: Arc<Shared>,
    next_seq: AtomicU64,
    outbound: mpsc::Sender<Frame<Request>>,
}

impl RpcConnection {
    /// Dial `addr` and start the reader and writer tasks.
    pub async fn connect(
        addr: &str,
        deadline: Deadline,
        shutdown: &Shutdown,
        tasks: &TaskCounter,
    ) -> Result<Self> {
        let what = format!("connect to {}", addr);
        let stream = shutdown
            .guard(
                &what,
                deadline.run(&what, async {
                    TcpStream::connect(addr)
                        .await
                        .map_err(|e| Error::connection(addr, e))
                }),
            )
            .await?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(Shared {
            addr: addr.to_string(),
            pending: Mutex::new(HashMap::new()),
            broken: AtomicBool::new(false),
            reader_done: Notify::new(),
        });
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);

        tasks.spawn(write_loop(write_half, rx, shutdown.clone(), shared.clone()));
        tasks.spawn(read_loop(read_half, shutdown.clone(), shared.clone()));

        tracing::debug!("Connected to {}", addr);
        Ok(Self {
            shared,
            next_seq: AtomicU64::new(1),
            outbound: tx,
        })
    }

    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    pub fn is_broken(&self) -> bool {
        self.shared.broken.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a response
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Send one request and wait for its response.
    pub async fn call(&self, body: Request, deadline: Deadline) -> Result<Response> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            if self.is_broken() {
                return Err(Error::Unreachable(format!(
                    "connection to {} is broken",
                    self.addr()
                )));
            }
            pending.insert(seq, tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            seq,
        };

        let what = format!("rpc to {}", self.addr());
        deadline
            .run(&what, async {
                self.outbound
                    .send(Frame { seq, body })
                    .await
                    .map_err(|_| Error::Unreachable(format!("{}: writer stopped", what)))?;
                rx.await
                    .map_err(|_| Error::Unreachable(format!("{}: request dropped", what)))?
            })
            .await
    }
}

fn read_failure(addr: &str, err: Error) -> Error {
    match err.kind() {
        ErrorKind::Internal => Error::Internal(format!("bad frame from {}: {}", addr, err)),
        _ => Error::Unreachable(format!("read from {} failed: {}", addr, err)),
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame<Request>>,
    mut shutdown: Shutdown,
    shared: Arc<Shared>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.triggered() => break,
            _ = shared.reader_done.notified() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                // connection handle dropped
                None => break,
            },
        };

        let written = tokio::select! {
            _ = shutdown.triggered() => break,
            res = write_frame(&mut writer, &frame) => res,
        };
        if let Err(e) = written {
            tracing::warn!("Write to {} failed: {}", shared.addr, e);
            shared.fail_all(Error::Unreachable(format!(
                "write to {} failed: {}",
                shared.addr, e
            )));
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: OwnedReadHalf, mut shutdown: Shutdown, shared: Arc<Shared>) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.triggered() => {
                shared.fail_all(Error::Cancelled(format!(
                    "connection to {} closed",
                    shared.addr
                )));
                break;
            }
            frame = read_frame::<_, Frame<Response>>(&mut reader) => frame,
        };

        match frame {
            Ok(Some(frame)) => {
                let waiter = shared.pending.lock().unwrap().remove(&frame.seq);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(frame.body));
                    }
                    None => tracing::debug!(
                        "Dropping response {} from {}: caller gone",
                        frame.seq,
                        shared.addr
                    ),
                }
            }
            Ok(None) => {
                tracing::debug!("Connection to {} closed by peer", shared.addr);
                shared.fail_all(Error::Unreachable(format!(
                    "connection to {} closed by peer",
                    shared.addr
                )));
                break;
            }
            Err(e) => {
                tracing::warn!("Read from {} failed: {}", shared.addr, e);
                shared.fail_all(read_failure(&shared.addr, e));
                break;
            }
        }
    }
    shared.reader_done.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::shutdown_channel;
    use crate::rpc::message::{MetaStatus, QueryConfigResponse};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn query(table: &str) -> Request {
        Request::QueryConfig {
            table: table.to_string(),
        }
    }

    fn not_found() -> Response {
        Response::QueryConfig(QueryConfigResponse::with_status(MetaStatus::ObjectNotFound))
    }

    /// Echo server that answers every request, in reverse arrival order per batch of two.
    async fn reversing_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = stream.into_split();
            loop {
                let Some(a) = read_frame::<_, Frame<Request>>(&mut r).await.unwrap() else {
                    break;
                };
                let Some(b) = read_frame::<_, Frame<Request>>(&mut r).await.unwrap() else {
                    break;
                };
                for f in [b, a] {
                    let resp = Frame {
                        seq: f.seq,
                        body: not_found(),
                    };
                    write_frame(&mut w, &resp).await.unwrap();
                }
            }
        });
        addr
    }

    /// Server that accepts and reads but never answers.
    async fn silent_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut r, _w) = stream.into_split();
            while let Ok(Some(_)) = read_frame::<_, Frame<Request>>(&mut r).await {}
        });
        addr
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let addr = reversing_server().await;
        let (_trigger, shutdown) = shutdown_channel();
        let tasks = TaskCounter::default();
        let conn = RpcConnection::connect(&addr, Deadline::none(), &shutdown, &tasks)
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            conn.call(query("a"), Deadline::after(Duration::from_secs(5))),
            conn.call(query("b"), Deadline::after(Duration::from_secs(5))),
        );
        assert_eq!(a.unwrap(), not_found());
        assert_eq!(b.unwrap(), not_found());
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn test_deadline_removes_pending_entry() {
        let addr = silent_server().await;
        let (_trigger, shutdown) = shutdown_channel();
        let tasks = TaskCounter::default();
        let conn = RpcConnection::connect(&addr, Deadline::none(), &shutdown, &tasks)
            .await
            .unwrap();

        let err = conn
            .call(query("temp"), Deadline::after(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(conn.pending(), 0);
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiters_and_stops_tasks() {
        let addr = silent_server().await;
        let (trigger, shutdown) = shutdown_channel();
        let tasks = TaskCounter::default();
        let conn = Arc::new(
            RpcConnection::connect(&addr, Deadline::none(), &shutdown, &tasks)
                .await
                .unwrap(),
        );
        assert_eq!(tasks.live(), 2);

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call(query("temp"), Deadline::none()).await })
        };
        while conn.pending() == 0 {
            tokio::task::yield_now().await;
        }

        trigger.trigger();
        let err = caller.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(conn.is_broken());

        tokio::time::timeout(Duration::from_secs(1), async {
            while tasks.live() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (_trigger, shutdown) = shutdown_channel();
        let tasks = TaskCounter::default();
        let err = RpcConnection::connect(&addr, Deadline::none(), &shutdown, &tasks)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert_eq!(tasks.live(), 0);
    }
}
