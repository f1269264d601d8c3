//! Periodic job scheduling.
//!
//! Two scheduler instances run per engine: `fast` for sub-second cadences
//! and `slow` for everything else. Each owns a min-heap of `(due, job)` and
//! dispatches due jobs onto tokio tasks gated by a shared semaphore, so a
//! burst of due work cannot spawn unbounded tasks.
//!
//! A [`JobHandle`] can cancel, wake (due = now) or delay its job; a woken
//! repeating job runs immediately and then falls back onto its period.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tracing::{debug, trace};

const LOG_TARGET: &str = "hoard::scheduler";

/// Upper bound on concurrently running scheduled jobs.
pub const MAX_WORKERS: usize = 200;

type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

enum SchedulerMsg {
    Add {
        id: u64,
        job: ScheduledJob,
        due: Instant,
    },
    Cancel {
        id: u64,
    },
    Wake {
        id: u64,
    },
    Delay {
        id: u64,
        by: Duration,
    },
    Shutdown,
}

struct ScheduledJob {
    name: &'static str,
    period: Option<Duration>,
    f: JobFn,
}

/// Handle to one scheduled job.
#[derive(Clone)]
pub struct JobHandle {
    id: u64,
    tx: mpsc::UnboundedSender<SchedulerMsg>,
}

impl JobHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(SchedulerMsg::Cancel { id: self.id });
    }

    /// Run the job as soon as a worker slot frees up.
    pub fn wake(&self) {
        let _ = self.tx.send(SchedulerMsg::Wake { id: self.id });
    }

    pub fn delay(&self, by: Duration) {
        let _ = self.tx.send(SchedulerMsg::Delay { id: self.id, by });
    }
}

#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<SchedulerMsg>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

impl Scheduler {
    /// Spawn a scheduler loop. The `workers` semaphore is shared between
    /// the fast and slow instances so the process-wide bound holds.
    pub fn spawn(name: &'static str, workers: Arc<Semaphore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_scheduler(name, rx, workers));
        Self {
            tx,
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Schedule a job. `period: None` runs once; `Some` repeats.
    pub fn add_job<F, Fut>(
        &self,
        name: &'static str,
        initial_delay: Duration,
        period: Option<Duration>,
        f: F,
    ) -> JobHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let job = ScheduledJob {
            name,
            period,
            f: Arc::new(move || Box::pin(f())),
        };
        let _ = self.tx.send(SchedulerMsg::Add {
            id,
            job,
            due: Instant::now() + initial_delay,
        });
        JobHandle {
            id,
            tx: self.tx.clone(),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SchedulerMsg::Shutdown);
    }
}

async fn run_scheduler(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<SchedulerMsg>,
    workers: Arc<Semaphore>,
) {
    debug!(target: LOG_TARGET, scheduler = name, "Scheduler started");

    let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut jobs: HashMap<u64, ScheduledJob> = HashMap::new();

    loop {
        let next_due = heap.peek().map(|Reverse((due, _))| *due);

        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(SchedulerMsg::Add { id, job, due }) => {
                        jobs.insert(id, job);
                        heap.push(Reverse((due, id)));
                    }
                    Some(SchedulerMsg::Cancel { id }) => {
                        jobs.remove(&id);
                    }
                    Some(SchedulerMsg::Wake { id }) => {
                        if jobs.contains_key(&id) {
                            heap.push(Reverse((Instant::now(), id)));
                        }
                    }
                    Some(SchedulerMsg::Delay { id, by }) => {
                        if jobs.contains_key(&id) {
                            heap.push(Reverse((Instant::now() + by, id)));
                        }
                    }
                    Some(SchedulerMsg::Shutdown) | None => {
                        debug!(target: LOG_TARGET, scheduler = name, "Scheduler stopped");
                        return;
                    }
                }
            }
            _ = async {
                match next_due {
                    Some(due) => tokio::time::sleep_until(due).await,
                    // nothing scheduled; wait for messages only
                    None => std::future::pending().await,
                }
            } => {
                let now = Instant::now();
                while let Some(Reverse((due, id))) = heap.peek().copied() {
                    if now < due {
                        break;
                    }
                    heap.pop();
                    let Some(job) = jobs.get(&id) else {
                        // cancelled; stale heap entry
                        continue;
                    };

                    trace!(target: LOG_TARGET, scheduler = name, job = job.name, "Dispatching job");
                    let f = job.f.clone();
                    let permit = workers
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("Worker semaphore never closes");
                    tokio::spawn(async move {
                        let _permit = permit;
                        f().await;
                    });

                    match job.period {
                        Some(period) => heap.push(Reverse((due + period, id))),
                        None => {
                            jobs.remove(&id);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn repeating_job_fires_and_cancels() {
        let scheduler = Scheduler::spawn("test", Arc::new(Semaphore::new(MAX_WORKERS)));
        let count = Arc::new(AtomicUsize::new(0));

        let handle = {
            let count = count.clone();
            scheduler.add_job(
                "counter",
                Duration::from_millis(1),
                Some(Duration::from_millis(5)),
                move || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    }
                },
            )
        };

        tokio::time::sleep(Duration::from_millis(40)).await;
        let fired = count.load(Ordering::SeqCst);
        assert!(2 <= fired, "repeating job should fire repeatedly, got {fired}");

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_cancel = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            count.load(Ordering::SeqCst),
            after_cancel,
            "cancelled job must not fire"
        );

        scheduler.shutdown();
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn wake_runs_a_delayed_job_early() {
        let scheduler = Scheduler::spawn("test", Arc::new(Semaphore::new(MAX_WORKERS)));
        let count = Arc::new(AtomicUsize::new(0));

        let handle = {
            let count = count.clone();
            scheduler.add_job(
                "sleeper",
                Duration::from_secs(3600),
                None,
                move || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    }
                },
            )
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        handle.wake();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.shutdown();
    }
}
