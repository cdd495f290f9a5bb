//! Single-flight tickets
//!
//! A [`Ticket`] is the shared result slot of one in-flight operation. The
//! caller that creates it spawns the work; every concurrent caller for the
//! same key attaches to the ticket and waits, each under its own deadline,
//! for the single outcome.
//!
//! The owner of a ticket (registry, connector) keeps it in a map guarded by
//! its own lock and must call [`Ticket::attach`] / [`Ticket::detach`] while
//! holding that lock.

use crate::common::{Deadline, Error, Result, Shutdown};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::AbortHandle;

pub struct Ticket<T> {
    slot: watch::Sender<Option<Result<T>>>,
    worker: Mutex<Option<AbortHandle>>,
    waiters: AtomicUsize,
}

impl<T: Clone> Ticket<T> {
    pub fn new() -> Arc<Self> {
        let (slot, _) = watch::channel(None);
        Arc::new(Self {
            slot,
            worker: Mutex::new(None),
            waiters: AtomicUsize::new(0),
        })
    }

    /// Remember the task doing the work so it can be aborted if abandoned.
    pub fn set_worker(&self, handle: AbortHandle) {
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub fn attach(&self) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the number of waiters left.
    pub fn detach(&self) -> usize {
        self.waiters.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn is_complete(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Publish the outcome. Only the first call has any effect.
    pub fn complete(&self, result: Result<T>) {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
    }

    /// Abort the worker and complete with `Cancelled`.
    pub fn abandon(&self, what: &str) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
        self.complete(Err(Error::Cancelled(format!("{}: abandoned", what))));
    }

    /// Wait for the outcome within `deadline`, unless shutdown fires first.
    pub async fn wait(&self, what: &str, deadline: Deadline, shutdown: &Shutdown) -> Result<T> {
        let mut rx = self.slot.subscribe();
        let outcome = async move {
            let slot = rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| Error::Internal("ticket dropped without outcome".into()))?;
            match slot.as_ref() {
                Some(result) => result.clone(),
                None => Err(Error::Internal("ticket woke without outcome".into())),
            }
        };
        let result = shutdown.guard(what, deadline.run(what, outcome)).await;
        // an outcome published while the client was closing is not handed out
        shutdown.check(what)?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{shutdown_channel, ErrorKind};
    use std::time::Duration;

    #[tokio::test]
    async fn test_all_waiters_see_same_outcome() {
        let (_trigger, shutdown) = shutdown_channel();
        let ticket: Arc<Ticket<Arc<String>>> = Ticket::new();
        let value = Arc::new("map".to_string());

        let mut waiters = Vec::new();
        for _ in 0..10 {
            let ticket = ticket.clone();
            let shutdown = shutdown.clone();
            waiters.push(tokio::spawn(async move {
                ticket.wait("resolve", Deadline::none(), &shutdown).await
            }));
        }
        tokio::task::yield_now().await;
        ticket.complete(Ok(value.clone()));
        ticket.complete(Ok(Arc::new("ignored".to_string())));

        for waiter in waiters {
            let got = waiter.await.unwrap().unwrap();
            assert!(Arc::ptr_eq(&got, &value));
        }

        // late waiters read the stored outcome
        let late = ticket.wait("resolve", Deadline::none(), &shutdown).await.unwrap();
        assert!(Arc::ptr_eq(&late, &value));
    }

    #[tokio::test]
    async fn test_deadline_is_per_waiter() {
        let (_trigger, shutdown) = shutdown_channel();
        let ticket: Arc<Ticket<u32>> = Ticket::new();

        let err = ticket
            .wait("resolve", Deadline::after(Duration::from_millis(20)), &shutdown)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!ticket.is_complete());

        let patient = {
            let ticket = ticket.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                ticket
                    .wait("resolve", Deadline::after(Duration::from_secs(5)), &shutdown)
                    .await
            })
        };
        ticket.complete(Ok(3));
        assert_eq!(patient.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_abandon_aborts_worker() {
        let (_trigger, shutdown) = shutdown_channel();
        let ticket: Arc<Ticket<u32>> = Ticket::new();
        let worker = tokio::spawn(std::future::pending::<()>());
        ticket.set_worker(worker.abort_handle());

        ticket.abandon("resolve temp");
        assert!(worker.await.unwrap_err().is_cancelled());
        let err = ticket
            .wait("resolve", Deadline::none(), &shutdown)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_outcome_after_shutdown_is_cancelled() {
        let (trigger, shutdown) = shutdown_channel();
        let ticket: Arc<Ticket<u32>> = Ticket::new();
        ticket.complete(Err(Error::Unreachable("closed by peer".into())));
        trigger.trigger();

        let err = ticket
            .wait("resolve temp", Deadline::none(), &shutdown)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_waiter_count() {
        let ticket: Arc<Ticket<u32>> = Ticket::new();
        ticket.attach();
        ticket.attach();
        assert_eq!(ticket.detach(), 1);
        assert_eq!(ticket.detach(), 0);
    }
}
