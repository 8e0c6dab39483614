use std::collections::{BTreeMap, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use textguard_core::DeliveryId;
use textguard_predictions::ScoringJob;

use super::{Delivery, QueueError, TaskQueue};

#[derive(Debug)]
struct InFlight {
    job: ScoringJob,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    /// Jobs keyed by (visible-at, insertion sequence).
    scheduled: BTreeMap<(Instant, u64), ScoringJob>,
    in_flight: HashMap<DeliveryId, InFlight>,
    next_seq: u64,
}

impl State {
    fn schedule(&mut self, job: ScoringJob, visible_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.scheduled.insert((visible_at, seq), job);
    }

    /// Move deliveries whose visibility timeout lapsed back to the schedule.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<DeliveryId> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(flight) = self.in_flight.remove(&receipt) {
                tracing::debug!(
                    prediction_id = %flight.job.prediction_id,
                    receipt = %receipt,
                    "visibility timeout lapsed; job visible again"
                );
                self.schedule(flight.job, now);
            }
        }
    }

    fn claim(&mut self, now: Instant, visibility: Duration) -> Option<Delivery> {
        let key = *self.scheduled.keys().next().filter(|(at, _)| *at <= now)?;
        let job = self.scheduled.remove(&key)?;
        let receipt = DeliveryId::new();
        self.in_flight.insert(
            receipt,
            InFlight {
                job: job.clone(),
                deadline: now + visibility,
            },
        );
        Some(Delivery { receipt, job })
    }

    /// Earliest instant at which something may become claimable.
    fn next_wakeup(&self) -> Option<Instant> {
        let next_scheduled = self.scheduled.keys().next().map(|(at, _)| *at);
        let next_expiry = self.in_flight.values().map(|f| f.deadline).min();
        match (next_scheduled, next_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// In-process task queue with visibility timeouts.
///
/// Intended for tests/dev and single-process deployments. Jobs do not survive
/// a restart.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    state: Mutex<State>,
    available: Condvar,
    visibility_timeout: Duration,
}

impl InMemoryTaskQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            visibility_timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Poisoned)
    }

    /// Jobs waiting to be claimed (including delayed retries).
    pub fn scheduled_len(&self) -> usize {
        self.lock().map(|s| s.scheduled.len()).unwrap_or(0)
    }

    /// Jobs claimed but not yet acknowledged.
    pub fn in_flight_len(&self) -> usize {
        self.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    pub fn is_idle(&self) -> bool {
        self.lock()
            .map(|s| s.scheduled.is_empty() && s.in_flight.is_empty())
            .unwrap_or(false)
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl TaskQueue for InMemoryTaskQueue {
    fn enqueue(&self, job: ScoringJob) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state.schedule(job, Instant::now());
        self.available.notify_one();
        Ok(())
    }

    fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let give_up_at = Instant::now() + wait;
        let mut state = self.lock()?;

        loop {
            let now = Instant::now();
            state.reclaim_expired(now);
            if let Some(delivery) = state.claim(now, self.visibility_timeout) {
                return Ok(Some(delivery));
            }
            if now >= give_up_at {
                return Ok(None);
            }

            let wake_at = state
                .next_wakeup()
                .map_or(give_up_at, |at| at.min(give_up_at));
            let timeout = wake_at.saturating_duration_since(now);
            let (guard, _) = self
                .available
                .wait_timeout(state, timeout)
                .map_err(|_| QueueError::Poisoned)?;
            state = guard;
        }
    }

    fn acknowledge(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if state.in_flight.remove(&delivery.receipt).is_none() {
            tracing::debug!(receipt = %delivery.receipt, "ack for stale receipt ignored");
        }
        Ok(())
    }

    fn requeue(
        &self,
        delivery: &Delivery,
        job: ScoringJob,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if state.in_flight.remove(&delivery.receipt).is_none() {
            tracing::debug!(receipt = %delivery.receipt, "requeue for stale receipt ignored");
            return Ok(());
        }
        state.schedule(job, Instant::now() + delay);
        self.available.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use textguard_core::RequestId;
    use textguard_predictions::{PredictionRecord, PredictionRequest};

    use super::*;

    fn job(request_id: &str) -> ScoringJob {
        let request = PredictionRequest::new("queued text").unwrap();
        let record =
            PredictionRecord::pending(&request, RequestId::new(request_id).unwrap(), "1.0");
        ScoringJob::for_record(&record)
    }

    #[test]
    fn dequeue_on_empty_queue_times_out() {
        let queue = InMemoryTaskQueue::default();
        let started = Instant::now();
        assert!(queue.dequeue(Duration::from_millis(20)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn acknowledged_job_is_gone() {
        let queue = InMemoryTaskQueue::default();
        queue.enqueue(job("r1")).unwrap();

        let delivery = queue.dequeue(Duration::ZERO).unwrap().unwrap();
        assert_eq!(queue.in_flight_len(), 1);
        queue.acknowledge(&delivery).unwrap();
        assert!(queue.is_idle());
    }

    #[test]
    fn unacknowledged_job_is_redelivered_with_new_receipt() {
        let queue = InMemoryTaskQueue::new(Duration::from_millis(20));
        queue.enqueue(job("r1")).unwrap();

        let first = queue.dequeue(Duration::ZERO).unwrap().unwrap();
        assert!(queue.dequeue(Duration::ZERO).unwrap().is_none());

        let second = queue.dequeue(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(second.job.prediction_id, first.job.prediction_id);
        assert_ne!(second.receipt, first.receipt);

        // The first worker finally acks; the live delivery is unaffected.
        queue.acknowledge(&first).unwrap();
        assert_eq!(queue.in_flight_len(), 1);
        queue.acknowledge(&second).unwrap();
        assert!(queue.is_idle());
    }

    #[test]
    fn requeued_job_waits_for_its_delay() {
        let queue = InMemoryTaskQueue::default();
        queue.enqueue(job("r1")).unwrap();
        let delivery = queue.dequeue(Duration::ZERO).unwrap().unwrap();

        let retry = delivery.job.next_attempt();
        queue
            .requeue(&delivery, retry, Duration::from_millis(50))
            .unwrap();
        assert!(queue.dequeue(Duration::ZERO).unwrap().is_none());

        let redelivered = queue.dequeue(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(redelivered.job.attempt, 1);
    }

    #[test]
    fn stale_requeue_does_not_duplicate_the_job() {
        let queue = InMemoryTaskQueue::new(Duration::from_millis(10));
        queue.enqueue(job("r1")).unwrap();
        let stale = queue.dequeue(Duration::ZERO).unwrap().unwrap();
        let live = queue.dequeue(Duration::from_secs(1)).unwrap().unwrap();

        queue
            .requeue(&stale, stale.job.next_attempt(), Duration::ZERO)
            .unwrap();
        assert_eq!(queue.scheduled_len(), 0);
        queue.acknowledge(&live).unwrap();
    }

    #[test]
    fn blocked_consumer_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryTaskQueue::default());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.dequeue(Duration::from_secs(5)).unwrap())
        };

        thread::sleep(Duration::from_millis(20));
        queue.enqueue(job("r1")).unwrap();

        let delivery = consumer.join().unwrap();
        assert!(delivery.is_some());
    }

    #[test]
    fn each_job_goes_to_one_consumer_at_a_time() {
        let queue = Arc::new(InMemoryTaskQueue::default());
        for i in 0..20 {
            queue.enqueue(job(&format!("r{i}"))).unwrap();
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut claimed = Vec::new();
                    while let Some(d) = queue.dequeue(Duration::from_millis(10)).unwrap() {
                        claimed.push(d.job.prediction_id);
                        queue.acknowledge(&d).unwrap();
                    }
                    claimed
                })
            })
            .collect();

        let mut all: Vec<_> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);
    }
}
