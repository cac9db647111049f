//! Periodic task scheduler
//!
//! Runs room tasks on an interval with an at-most-one guarantee:
//! - `allow_overlap = false` self-reschedules after the handler resolves, so
//!   slow handlers never pile up;
//! - `allow_overlap = true` fires strictly on the period;
//! - `leader_only = true` additionally takes a lease keyed by the task id
//!   and silently skips when acquisition fails (the leader is assumed to
//!   run it).
//!
//! The two backends differ only in where the lease lives: an in-process
//! table, or a redis `SET NX PX` key.

mod memory;
mod redis;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex};

use crate::config::Backend;
use crate::envelope::InstanceId;
use crate::error::FabricError;

pub use memory::LocalLeaseTable;
pub use redis::RedisLeaseStore;

pub type TaskHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Everything the scheduler needs to drive one task.
#[derive(Clone)]
pub struct TaskSpec {
    /// Globally unique id, `namespace:<ns>:room:<room>:task:<id>` for room tasks.
    pub task_id: String,
    pub interval: Duration,
    pub run_on_activation: bool,
    pub allow_overlap: bool,
    pub leader_only: bool,
    /// Lease length for leader-only tasks; defaults to `interval`.
    pub lock_duration: Option<Duration>,
    pub handler: TaskHandler,
}

impl TaskSpec {
    pub fn lease_duration(&self) -> Duration {
        self.lock_duration.unwrap_or(self.interval)
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("task_id", &self.task_id)
            .field("interval", &self.interval)
            .field("run_on_activation", &self.run_on_activation)
            .field("allow_overlap", &self.allow_overlap)
            .field("leader_only", &self.leader_only)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Start driving a task. Rejects a duplicate `task_id` with a conflict.
    async fn schedule(&self, spec: TaskSpec) -> Result<(), FabricError>;

    /// Cancel the local timer. A held lease is left to expire naturally.
    async fn stop(&self, task_id: &str) -> Result<(), FabricError>;

    /// Stop every local task. Called once at server shutdown.
    async fn shutdown(&self);
}

/// Where leader leases are acquired.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Attempt to take the lease for `task_id`. Returns false when another
    /// holder (local or remote) currently owns it.
    async fn try_acquire(&self, task_id: &str, lease: Duration) -> bool;
}

/// Scheduler generic over the lease backend.
pub struct LeasedScheduler {
    leases: Arc<dyn LeaseProvider>,
    tasks: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl LeasedScheduler {
    pub fn new(leases: Arc<dyn LeaseProvider>) -> Self {
        Self {
            leases,
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Scheduler for LeasedScheduler {
    async fn schedule(&self, spec: TaskSpec) -> Result<(), FabricError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&spec.task_id) {
            return Err(FabricError::Conflict(format!(
                "task '{}' is already scheduled",
                spec.task_id
            )));
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        tasks.insert(spec.task_id.clone(), stop_tx);
        drop(tasks);

        tracing::debug!(
            task_id = %spec.task_id,
            interval_ms = spec.interval.as_millis() as u64,
            leader_only = spec.leader_only,
            "Task scheduled"
        );
        tokio::spawn(run_task(spec, self.leases.clone(), stop_rx));
        Ok(())
    }

    async fn stop(&self, task_id: &str) -> Result<(), FabricError> {
        let mut tasks = self.tasks.lock().await;
        if let Some(stop_tx) = tasks.remove(task_id) {
            let _ = stop_tx.send(true);
            tracing::debug!(task_id = %task_id, "Task stopped");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for (task_id, stop_tx) in tasks.drain() {
            let _ = stop_tx.send(true);
            tracing::debug!(task_id = %task_id, "Task stopped at shutdown");
        }
    }
}

/// One execution attempt, honouring the leader lease.
async fn execute(spec: &TaskSpec, leases: &Arc<dyn LeaseProvider>) {
    if spec.leader_only && !leases.try_acquire(&spec.task_id, spec.lease_duration()).await {
        tracing::trace!(task_id = %spec.task_id, "Lease held elsewhere, skipping run");
        return;
    }
    (spec.handler)().await;
}

async fn run_task(spec: TaskSpec, leases: Arc<dyn LeaseProvider>, mut stop_rx: watch::Receiver<bool>) {
    if spec.run_on_activation {
        execute(&spec, &leases).await;
    }

    if spec.allow_overlap {
        // Fixed-period firing: runs are spawned off the timer loop, so a
        // slow handler cannot delay the next tick.
        let mut ticker = tokio::time::interval(spec.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {
                    let spec = spec.clone();
                    let leases = leases.clone();
                    tokio::spawn(async move { execute(&spec, &leases).await });
                }
            }
        }
    } else {
        // Self-rescheduling: the next delay starts only after the current
        // run resolves, so executions never pile up on one instance.
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(spec.interval) => execute(&spec, &leases).await,
            }
        }
    }
}

/// Build the configured backend.
pub async fn create(
    backend: Backend,
    redis_url: &str,
    instance_id: &InstanceId,
) -> anyhow::Result<Arc<dyn Scheduler>> {
    match backend {
        Backend::Memory => Ok(Arc::new(LeasedScheduler::new(Arc::new(LocalLeaseTable::new())))),
        Backend::Redis => Ok(Arc::new(LeasedScheduler::new(Arc::new(
            RedisLeaseStore::connect(redis_url, instance_id.clone()).await?,
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_spec(task_id: &str, interval: Duration, counter: Arc<AtomicU32>) -> TaskSpec {
        TaskSpec {
            task_id: task_id.to_string(),
            interval,
            run_on_activation: false,
            allow_overlap: false,
            leader_only: false,
            lock_duration: None,
            handler: Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        }
    }

    #[tokio::test]
    async fn duplicate_task_id_is_rejected() {
        let scheduler = LeasedScheduler::new(Arc::new(LocalLeaseTable::new()));
        let counter = Arc::new(AtomicU32::new(0));
        let spec = counting_spec("t1", Duration::from_secs(60), counter.clone());
        scheduler.schedule(spec.clone()).await.unwrap();
        assert!(scheduler.schedule(spec).await.is_err());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn run_on_activation_fires_immediately() {
        let scheduler = LeasedScheduler::new(Arc::new(LocalLeaseTable::new()));
        let counter = Arc::new(AtomicU32::new(0));
        let mut spec = counting_spec("t2", Duration::from_secs(60), counter.clone());
        spec.run_on_activation = true;
        scheduler.schedule(spec).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn periodic_execution_and_stop() {
        let scheduler = LeasedScheduler::new(Arc::new(LocalLeaseTable::new()));
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule(counting_spec("t3", Duration::from_millis(20), counter.clone()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(110)).await;
        scheduler.stop("t3").await.unwrap();
        let after_stop = counter.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "expected at least 2 runs, got {after_stop}");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn leader_only_single_runner_across_schedulers() {
        // Two schedulers sharing one lease table model two instances.
        let table = Arc::new(LocalLeaseTable::new());
        let a = LeasedScheduler::new(table.clone());
        let b = LeasedScheduler::new(table.clone());

        let counter = Arc::new(AtomicU32::new(0));
        let make = |counter: Arc<AtomicU32>| TaskSpec {
            task_id: "namespace:chat:room:lobby:task:stats".to_string(),
            interval: Duration::from_millis(100),
            run_on_activation: false,
            allow_overlap: false,
            leader_only: true,
            lock_duration: None,
            handler: Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        };
        a.schedule(make(counter.clone())).await.unwrap();
        b.schedule(make(counter.clone())).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        a.shutdown().await;
        b.shutdown().await;

        // Combined executions track a single runner's cadence, not double.
        let runs = counter.load(Ordering::SeqCst);
        assert!((6..=12).contains(&runs), "expected single-runner cadence, got {runs}");
    }
}
