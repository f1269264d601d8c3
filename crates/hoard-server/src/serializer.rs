//! The database serializer.
//!
//! One dedicated thread owns the [`Database`]; every read and write flows
//! through its job queue, so jobs observe a consistent snapshot and each
//! write commits atomically. Errors are caught at the job boundary and
//! returned on the job's result channel; a panic inside a job is converted
//! to an `internal` error rather than taking the thread down.
//!
//! `force_commit` is a queue barrier: once it returns, every previously
//! submitted write has committed. `pause(true)` stops accepting jobs (they
//! fail `busy`), leaving the database file quiescent for an external
//! snapshot. Periodic maintenance compacts the file between jobs.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use hoard_core::error::ApiError;
use hoard_server_db::{Database, DbResult, WriteTransactionCtx};
use hoard_util_error::FmtCompact as _;
use redb_bincode::ReadTransaction;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const LOG_TARGET: &str = "hoard::serializer";

/// A queued unit of work. The closure is handed the database exactly once,
/// or an error when the queue is paused or shutting down.
type JobFn = Box<dyn FnOnce(Result<&mut Database, ApiError>) + Send>;

enum Msg {
    Job(JobFn),
    Pause(bool, oneshot::Sender<()>),
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Clone)]
pub struct Serializer {
    tx: mpsc::UnboundedSender<Msg>,
    shutting_down: Arc<AtomicBool>,
}

impl Serializer {
    /// Take ownership of the database and start the serializer thread.
    pub fn start(db: Database, maintenance_period: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutting_down = Arc::new(AtomicBool::new(false));
        std::thread::Builder::new()
            .name("hoard-db".to_owned())
            .spawn(move || serializer_thread(db, rx, maintenance_period))
            .expect("Failed to spawn serializer thread");
        Self { tx, shutting_down }
    }

    fn submit<T, F>(&self, f: F) -> impl Future<Output = Result<T, ApiError>>
    where
        T: Send + 'static,
        F: FnOnce(Result<&mut Database, ApiError>) -> Result<T, ApiError> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: JobFn = Box::new(move |db| {
            let _ = result_tx.send(f(db));
        });
        let sent = if self.shutting_down.load(Ordering::SeqCst) {
            Err(())
        } else {
            self.tx.send(Msg::Job(job)).map_err(|_| ())
        };
        async move {
            if sent.is_err() {
                return Err(ApiError::ShuttingDown);
            }
            result_rx
                .await
                .map_err(|_| ApiError::internal("serializer dropped a job"))?
        }
    }

    /// Run a write job; the transaction commits before the result returns,
    /// and `on_commit` hooks have run.
    pub async fn write<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&WriteTransactionCtx) -> DbResult<T> + Send + 'static,
    {
        self.submit(move |db| {
            let db = db?;
            run_caught(move || db.write_with_sync(f))
        })
        .await
    }

    /// Run a read job against the latest committed state.
    pub async fn read<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&ReadTransaction) -> DbResult<T> + Send + 'static,
    {
        self.submit(move |db| {
            let db = db?;
            run_caught(move || db.read_with_sync(f))
        })
        .await
    }

    /// Barrier: resolves once every prior job has committed.
    pub async fn force_commit(&self) -> Result<(), ApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Msg::Barrier(tx))
            .map_err(|_| ApiError::ShuttingDown)?;
        rx.await.map_err(|_| ApiError::ShuttingDown)
    }

    /// Pause (or resume) the queue. While paused every job fails `busy`
    /// and no transaction is open, so the db file can be copied safely.
    pub async fn pause_and_disconnect(&self, pause: bool) -> Result<(), ApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Msg::Pause(pause, tx))
            .map_err(|_| ApiError::ShuttingDown)?;
        rx.await.map_err(|_| ApiError::ShuttingDown)
    }

    /// Stop accepting jobs and let the thread drain and exit.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Msg::Shutdown);
    }
}

fn run_caught<T>(f: impl FnOnce() -> DbResult<T>) -> Result<T, ApiError> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(res) => res.map_err(|err| err.into_api_error()),
        Err(_panic) => {
            error!(target: LOG_TARGET, "Job panicked");
            Err(ApiError::internal("database job panicked"))
        }
    }
}

fn serializer_thread(
    mut db: Database,
    mut rx: mpsc::UnboundedReceiver<Msg>,
    maintenance_period: Duration,
) {
    debug!(target: LOG_TARGET, "Serializer thread started");
    let mut paused = false;
    let mut last_maintenance = Instant::now();

    while let Some(msg) = rx.blocking_recv() {
        match msg {
            Msg::Job(job) => {
                if paused {
                    job(Err(ApiError::Busy));
                } else {
                    job(Ok(&mut db));
                }
            }
            Msg::Barrier(ack) => {
                let _ = ack.send(());
            }
            Msg::Pause(pause, ack) => {
                paused = pause;
                info!(target: LOG_TARGET, paused, "Serializer pause state changed");
                let _ = ack.send(());
            }
            Msg::Shutdown => break,
        }

        if !paused && maintenance_period <= last_maintenance.elapsed() {
            match db.compact() {
                Ok(compacted) => {
                    debug!(target: LOG_TARGET, compacted, "Database maintenance pass");
                }
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        err = %err.fmt_compact(),
                        "Database compaction failed"
                    );
                }
            }
            last_maintenance = Instant::now();
        }
    }

    debug!(target: LOG_TARGET, "Serializer thread stopped");
}
