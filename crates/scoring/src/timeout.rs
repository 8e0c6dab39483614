use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use crate::engine::{ScoreOutcome, ScoringEngine};
use crate::error::ScoringError;

/// Most scoring helper threads alive at once, timed-out ones included.
pub const MAX_SCORING_THREADS: usize = 64;

static LIVE_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Helper threads currently alive, including ones whose caller gave up.
pub fn live_scoring_threads() -> usize {
    LIVE_THREADS.load(Ordering::Acquire)
}

/// Run one scoring call with a deadline.
///
/// The call runs on a helper thread; if the deadline passes first the result is
/// dropped and `TimedOut` is returned. The helper thread is not interrupted: it
/// keeps running until the engine returns. While `MAX_SCORING_THREADS` helpers
/// are still alive, new calls fail fast with `EngineUnavailable` instead of
/// spawning more.
pub fn score_with_timeout<E>(
    engine: &Arc<E>,
    text: &str,
    timeout: Duration,
) -> Result<ScoreOutcome, ScoringError>
where
    E: ScoringEngine + ?Sized,
{
    score_bounded(engine, text, timeout, &LIVE_THREADS, MAX_SCORING_THREADS)
}

/// Releases one helper slot when the helper thread ends, panics included.
struct ThreadSlot(&'static AtomicUsize);

impl ThreadSlot {
    fn acquire(live: &'static AtomicUsize, max: usize) -> Option<Self> {
        live.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(live))
    }
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn score_bounded<E>(
    engine: &Arc<E>,
    text: &str,
    timeout: Duration,
    live: &'static AtomicUsize,
    max: usize,
) -> Result<ScoreOutcome, ScoringError>
where
    E: ScoringEngine + ?Sized,
{
    let slot = ThreadSlot::acquire(live, max).ok_or_else(|| {
        ScoringError::EngineUnavailable(format!("{max} scoring calls still running"))
    })?;

    let (tx, rx) = mpsc::sync_channel(1);
    let engine = Arc::clone(engine);
    let text = text.to_string();

    thread::Builder::new()
        .name("textguard-score".to_string())
        .spawn(move || {
            let _slot = slot;
            let _ = tx.send(engine.score(&text));
        })
        .map_err(|e| ScoringError::EngineUnavailable(format!("cannot spawn scoring thread: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(ScoringError::TimedOut(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ScoringError::EngineUnavailable(
            "scoring thread exited without a result".to_string(),
        )),
    }
}
