//! Client-side metrics
//!
//! Every [`crate::Client`] owns one [`ClientMetrics`]; there is no process-wide
//! registry. Covers:
//! - Meta query/failover counters
//! - Per-operation counters and latency histograms
//! - Live background task gauge (used by leak checks)

use crate::common::OpKind;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        let buckets = (0..=LATENCY_BUCKETS.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            boundaries: LATENCY_BUCKETS.to_vec(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in milliseconds
    pub fn observe(&self, value_ms: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value_ms <= b)
            .unwrap_or(self.boundaries.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value_ms * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with the +Inf bucket
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            let le = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
            result.push((le, cumulative));
        }
        result
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the value before the decrement.
    pub fn dec(&self) -> u64 {
        self.value.fetch_sub(1, Ordering::AcqRel)
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Spawns tokio tasks and keeps a live count of them.
///
/// The count drops when a task finishes, panics or is aborted.
#[derive(Debug, Clone, Default)]
pub struct TaskCounter {
    inner: Arc<LiveTasks>,
}

#[derive(Debug, Default)]
struct LiveTasks {
    gauge: Gauge,
    idle: Notify,
}

struct LiveTask(Arc<LiveTasks>);

impl Drop for LiveTask {
    fn drop(&mut self) {
        if self.0.gauge.dec() == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl TaskCounter {
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.gauge.inc();
        let live = LiveTask(self.inner.clone());
        tokio::spawn(async move {
            let _live = live;
            fut.await
        })
    }

    pub fn live(&self) -> u64 {
        self.inner.gauge.get()
    }

    /// Wait until no counted task is alive. Returns `false` if some are
    /// still running after `within`.
    pub async fn wait_idle(&self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // registered before the check so a drop to zero in between is seen
            notified.as_mut().enable();
            if self.live() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.live() == 0;
            }
        }
    }
}

/// Per-operation metrics
#[derive(Debug, Default)]
pub struct OpMetrics {
    pub total: Counter,
    pub errors: Counter,
    pub latency: Histogram,
}

#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub meta_queries: Counter,
    pub meta_failovers: Counter,
    pub table_resolutions: Counter,
    pub table_refreshes: Counter,
    pub connections_opened: Counter,
    pub get: OpMetrics,
    pub set: OpMetrics,
    pub del: OpMetrics,
    pub tasks: TaskCounter,
}

/// Point-in-time copy of [`ClientMetrics`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub meta_queries: u64,
    pub meta_failovers: u64,
    pub table_resolutions: u64,
    pub table_refreshes: u64,
    pub connections_opened: u64,
    pub ops_total: u64,
    pub ops_errors: u64,
    pub live_tasks: u64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(&self, kind: OpKind) -> &OpMetrics {
        match kind {
            OpKind::Get => &self.get,
            OpKind::Set => &self.set,
            OpKind::Del => &self.del,
        }
    }

    /// Record a finished operation; `NotFound` on a get is not counted as an error
    pub fn record_op(&self, kind: OpKind, duration: Duration, success: bool) {
        let op = self.op(kind);
        op.total.inc();
        op.latency.observe(duration.as_secs_f64() * 1000.0);
        if !success {
            op.errors.inc();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let ops = [&self.get, &self.set, &self.del];
        MetricsSnapshot {
            meta_queries: self.meta_queries.get(),
            meta_failovers: self.meta_failovers.get(),
            table_resolutions: self.table_resolutions.get(),
            table_refreshes: self.table_refreshes.get(),
            connections_opened: self.connections_opened.get(),
            ops_total: ops.iter().map(|o| o.total.get()).sum(),
            ops_errors: ops.iter().map(|o| o.errors.get()).sum(),
            live_tasks: self.tasks.live(),
        }
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        let counters = [
            ("meta_queries_total", "Partition map queries", self.meta_queries.get()),
            ("meta_failovers_total", "Meta server failovers", self.meta_failovers.get()),
            ("table_refreshes_total", "Partition map refreshes", self.table_refreshes.get()),
            ("connections_opened_total", "Connections established", self.connections_opened.get()),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP minikv_client_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minikv_client_{} counter", name);
            let _ = writeln!(out, "minikv_client_{} {}", name, value);
        }

        out.push_str("# HELP minikv_client_live_tasks Background tasks alive\n");
        out.push_str("# TYPE minikv_client_live_tasks gauge\n");
        let _ = writeln!(out, "minikv_client_live_tasks {}", self.tasks.live());

        out.push_str("# HELP minikv_client_op_duration_ms Operation duration in milliseconds\n");
        out.push_str("# TYPE minikv_client_op_duration_ms histogram\n");
        for kind in [OpKind::Get, OpKind::Set, OpKind::Del] {
            let op = self.op(kind);
            for (le, count) in op.latency.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "minikv_client_op_duration_ms_bucket{{op=\"{}\",le=\"{}\"}} {}",
                    kind, le, count
                );
            }
            let _ = writeln!(
                out,
                "minikv_client_op_duration_ms_sum{{op=\"{}\"}} {}",
                kind,
                op.latency.sum()
            );
            let _ = writeln!(
                out,
                "minikv_client_op_duration_ms_count{{op=\"{}\"}} {}",
                kind,
                op.latency.count()
            );
            let _ = writeln!(
                out,
                "minikv_client_op_errors_total{{op=\"{}\"}} {}",
                kind,
                op.errors.get()
            );
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();
        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(9000.0);

        assert_eq!(hist.count(), 3);
        let buckets = hist.get_buckets();
        assert_eq!(buckets.len(), LATENCY_BUCKETS.len() + 1);
        assert_eq!(buckets[1], (5.0, 1));
        assert_eq!(buckets.last().unwrap().1, 3);
        assert!(buckets.last().unwrap().0.is_infinite());
    }

    #[test]
    fn test_record_op() {
        let metrics = ClientMetrics::new();
        metrics.record_op(OpKind::Set, Duration::from_millis(3), true);
        metrics.record_op(OpKind::Get, Duration::from_millis(7), false);

        let snap = metrics.snapshot();
        assert_eq!(snap.ops_total, 2);
        assert_eq!(snap.ops_errors, 1);
        assert!(metrics
            .to_prometheus()
            .contains("minikv_client_op_errors_total{op=\"get\"} 1"));
    }

    #[tokio::test]
    async fn test_task_counter() {
        let tasks = TaskCounter::default();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let waiting = tasks.spawn(async move {
            let _ = rx.await;
        });
        let pending = tasks.spawn(std::future::pending::<()>());
        assert_eq!(tasks.live(), 2);

        tx.send(()).unwrap();
        waiting.await.unwrap();
        assert_eq!(tasks.live(), 1);

        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        assert_eq!(tasks.live(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let tasks = TaskCounter::default();
        assert!(tasks.wait_idle(Duration::ZERO).await);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tasks.spawn(async move {
            let _ = rx.await;
        });
        assert!(!tasks.wait_idle(Duration::from_millis(20)).await);

        let waiter = {
            let tasks = tasks.clone();
            tokio::spawn(async move { tasks.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        tx.send(()).unwrap();
        assert!(waiter.await.unwrap());
        assert_eq!(tasks.live(), 0);
    }
}
