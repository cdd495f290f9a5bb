//! Deadlines and client-wide shutdown signalling
//!
//! Every blocking wait in the client takes an explicit [`Deadline`] and a
//! [`Shutdown`] handle. The deadline only ever unblocks the caller that owns
//! it; shutdown unblocks everybody.

use crate::common::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// An optional absolute point in time by which a call must finish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No caller-imposed bound
    pub const fn none() -> Self {
        Self { at: None }
    }

    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
        }
    }

    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    pub fn is_none(&self) -> bool {
        self.at.is_none()
    }

    pub fn is_elapsed(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// The earlier of two deadlines
    pub fn earliest(self, other: Deadline) -> Deadline {
        match (self.at, other.at) {
            (Some(a), Some(b)) => Deadline::at(a.min(b)),
            (Some(_), None) => self,
            (None, _) => other,
        }
    }

    /// This deadline, capped at `timeout` from now
    pub fn bounded_by(self, timeout: Duration) -> Deadline {
        self.earliest(Deadline::after(timeout))
    }

    /// Drive `fut` until it completes or the deadline elapses.
    ///
    /// On expiry `fut` is dropped before returning, so nothing it started
    /// keeps waiting on the caller's behalf.
    pub async fn run<T, F>(self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.at {
            None => fut.await,
            Some(at) => match tokio::time::timeout_at(at, fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!("{} exceeded deadline", what))),
            },
        }
    }
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Deadline::after(timeout)
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Deadline::at(instant)
    }
}

impl From<std::time::Instant> for Deadline {
    fn from(instant: std::time::Instant) -> Self {
        Deadline::at(Instant::from_std(instant))
    }
}

impl From<Option<Duration>> for Deadline {
    fn from(timeout: Option<Duration>) -> Self {
        timeout.map_or(Deadline::none(), Deadline::after)
    }
}

/// Owning side of the shutdown signal, held by the client
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Observing side of the shutdown signal
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    /// Fire the signal. Returns `true` only for the first call.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown fires or the trigger is dropped.
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    /// Fail fast with `Cancelled` if already shut down.
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_triggered() {
            return Err(Error::Cancelled(format!("{}: client closed", what)));
        }
        Ok(())
    }

    /// Drive `fut` unless shutdown fires first.
    ///
    /// A failure of `fut` observed after shutdown fired is reported as
    /// `Cancelled`: it is the close tearing down connections, not the peer.
    pub async fn guard<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut shutdown = self.clone();
        tokio::select! {
            biased;
            _ = shutdown.triggered() => Err(Self::closed(what)),
            result = fut => match result {
                Err(_) if self.is_triggered() => Err(Self::closed(what)),
                other => other,
            },
        }
    }

    fn closed(what: &str) -> Error {
        Error::Cancelled(format!("{}: client closed", what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorKind;

    #[test]
    fn test_earliest() {
        let none = Deadline::none();
        let soon = Deadline::after(Duration::from_millis(10));
        let later = Deadline::after(Duration::from_secs(10));

        assert_eq!(none.earliest(soon), soon);
        assert_eq!(soon.earliest(none), soon);
        assert_eq!(later.earliest(soon), soon);
        assert!(none.earliest(none).is_none());
        assert!(none.bounded_by(Duration::from_secs(1)).instant().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let deadline = Deadline::after(Duration::from_millis(50));
        let err = deadline
            .run("sleepy", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(deadline.is_elapsed());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_run_without_deadline() {
        let value = Deadline::none().run("quick", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_guard() {
        let (trigger, shutdown) = shutdown_channel();
        let waiter = tokio::spawn(async move {
            shutdown
                .guard("wait", std::future::pending::<Result<()>>())
                .await
        });

        tokio::task::yield_now().await;
        assert!(trigger.trigger());
        assert!(!trigger.trigger());

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_failure_after_shutdown_is_cancelled() {
        let (trigger, shutdown) = shutdown_channel();
        let err = shutdown
            .guard("send", async {
                trigger.trigger();
                Err::<(), _>(Error::Unreachable("closed by peer".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        let (_trigger, shutdown) = shutdown_channel();
        let err = shutdown
            .guard("send", async {
                Err::<(), _>(Error::Unreachable("closed by peer".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn test_dropped_trigger_counts_as_shutdown() {
        let (trigger, mut shutdown) = shutdown_channel();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), shutdown.triggered())
            .await
            .unwrap();
    }
}
