use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::repository::{PredictionRepository, RepositoryError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SweepError {
    #[error("storage error during sweep: {0}")]
    Storage(String),

    #[error("sweep did not finish within {0:?}")]
    TimedOut(Duration),
}

impl From<RepositoryError> for SweepError {
    fn from(value: RepositoryError) -> Self {
        SweepError::Storage(value.to_string())
    }
}

/// Evicts prediction records older than the retention window.
#[derive(Debug)]
pub struct MaintenanceSweeper<R: PredictionRepository + ?Sized> {
    repository: Arc<R>,
    retention: chrono::Duration,
    timeout: Duration,
    interval: Duration,
}

/// Controls a sweeper started with [`MaintenanceSweeper::spawn`].
///
/// Dropping the handle without calling `shutdown` also stops the thread, at
/// the latest when its current sweep finishes.
#[derive(Debug)]
pub struct SweeperHandle {
    stop: mpsc::Sender<()>,
    wake: mpsc::SyncSender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    /// Request an immediate sweep. Requests made while one is queued collapse
    /// into it.
    pub fn trigger(&self) {
        let _ = self.wake.try_send(());
    }

    /// Stop the sweeper and wait for its thread.
    pub fn shutdown(mut self) {
        let _ = self.stop.send(());
        // A full buffer means the loop is about to wake anyway.
        let _ = self.wake.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<R: PredictionRepository + ?Sized> MaintenanceSweeper<R> {
    pub fn new(
        repository: Arc<R>,
        retention: chrono::Duration,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            repository,
            retention,
            timeout,
            interval,
        }
    }

    pub fn from_config(repository: Arc<R>, config: &PipelineConfig) -> Self {
        Self::new(
            repository,
            config.retention(),
            config.sweep_timeout(),
            config.sweep_interval(),
        )
    }

    /// Delete every record created before `now - retention`.
    ///
    /// The delete runs on a helper thread so a hung store cannot block the
    /// caller past `timeout`; a timed-out delete is not cancelled.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<u64, SweepError> {
        let cutoff = now - self.retention;
        let started = Instant::now();
        let (tx, rx) = mpsc::sync_channel(1);
        let repository = Arc::clone(&self.repository);

        thread::Builder::new()
            .name("textguard-sweep-call".to_string())
            .spawn(move || {
                let _ = tx.send(repository.delete_older_than(cutoff));
            })
            .map_err(|e| SweepError::Storage(format!("cannot spawn sweep thread: {e}")))?;

        let deleted = match rx.recv_timeout(self.timeout) {
            Ok(result) => result?,
            Err(mpsc::RecvTimeoutError::Timeout) => return Err(SweepError::TimedOut(self.timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(SweepError::Storage(
                    "sweep thread exited without a result".to_string(),
                ));
            }
        };

        info!(
            deleted,
            cutoff = %cutoff,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "retention sweep finished"
        );
        Ok(deleted)
    }
}

impl<R: PredictionRepository + ?Sized> MaintenanceSweeper<R> {
    /// Run the sweeper on its own thread: once right away, then every
    /// `interval` and whenever [`SweeperHandle::trigger`] is called.
    ///
    /// A failed sweep is logged and retried on the next tick.
    pub fn spawn(self, name: &'static str) -> std::io::Result<SweeperHandle> {
        let (stop, stop_rx) = mpsc::channel();
        let (wake, wake_rx) = mpsc::sync_channel(1);

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run_periodically(name, stop_rx, wake_rx))?;

        Ok(SweeperHandle {
            stop,
            wake,
            thread: Some(thread),
        })
    }

    fn run_periodically(
        &self,
        name: &'static str,
        stop_rx: mpsc::Receiver<()>,
        wake_rx: mpsc::Receiver<()>,
    ) {
        info!(
            sweeper = name,
            interval_secs = self.interval.as_secs(),
            retention_days = self.retention.num_days(),
            "retention sweeper started"
        );

        let mut next_tick = Instant::now();
        let mut consecutive_failures: u32 = 0;

        loop {
            let woke = wake_rx.recv_timeout(next_tick.saturating_duration_since(Instant::now()));
            if stop_rx.try_recv().is_ok() {
                break;
            }
            match woke {
                Ok(()) => debug!(sweeper = name, "sweep triggered"),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    next_tick += self.interval;
                    let now = Instant::now();
                    if next_tick <= now {
                        next_tick = now + self.interval;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            match self.run_once(Utc::now()) {
                Ok(_) => consecutive_failures = 0,
                Err(err) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(
                        sweeper = name,
                        error = %err,
                        consecutive_failures,
                        "retention sweep failed; will retry next tick"
                    );
                }
            }
        }

        info!(sweeper = name, "retention sweeper stopped");
    }
}
