//! Redis-backed task queue (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **`<prefix>:schedule`**: ZSET of job keys scored by the unix-millis
//!   instant they become visible. A claimed job is re-scored to
//!   `now + visibility_timeout`, so an unacknowledged job reappears by itself.
//! - **`<prefix>:payloads`**: HASH job key → JSON `ScoringJob`.
//! - **`<prefix>:claims`**: HASH job key → receipt of the current delivery.
//! - **`<prefix>:receipts`**: HASH receipt → job key.
//! - **`<prefix>:dead`**: HASH job key → payload that could not be decoded.
//!   Such jobs are moved here on claim instead of being redelivered forever.
//!
//! The job key is the prediction id, so enqueueing the same prediction twice
//! keeps a single entry. Claim, ack and requeue are Lua scripts and therefore
//! atomic with respect to each other.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, instrument, warn};

use textguard_core::DeliveryId;
use textguard_predictions::ScoringJob;

use super::{Delivery, QueueError, TaskQueue};

const DEFAULT_KEY_PREFIX: &str = "textguard:jobs";

/// How often an empty queue is polled while `dequeue` waits.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const CLAIM_SCRIPT: &str = r#"
local schedule, payloads, claims, receipts = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
local now, invisible_until, receipt = tonumber(ARGV[1]), ARGV[2], ARGV[3]
local due = redis.call('ZRANGEBYSCORE', schedule, '-inf', now, 'LIMIT', 0, 1)
if #due == 0 then
  return false
end
local key = due[1]
local payload = redis.call('HGET', payloads, key)
if not payload then
  redis.call('ZREM', schedule, key)
  return false
end
local previous = redis.call('HGET', claims, key)
if previous then
  redis.call('HDEL', receipts, previous)
end
redis.call('ZADD', schedule, invisible_until, key)
redis.call('HSET', claims, key, receipt)
redis.call('HSET', receipts, receipt, key)
return {key, payload}
"#;

const ACK_SCRIPT: &str = r#"
local schedule, payloads, claims, receipts = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
local receipt = ARGV[1]
local key = redis.call('HGET', receipts, receipt)
if not key then
  return 0
end
redis.call('HDEL', receipts, receipt)
redis.call('HDEL', claims, key)
redis.call('ZREM', schedule, key)
redis.call('HDEL', payloads, key)
return 1
"#;

const REQUEUE_SCRIPT: &str = r#"
local schedule, payloads, claims, receipts = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
local receipt, visible_at, payload = ARGV[1], ARGV[2], ARGV[3]
local key = redis.call('HGET', receipts, receipt)
if not key then
  return 0
end
redis.call('HDEL', receipts, receipt)
redis.call('HDEL', claims, key)
redis.call('HSET', payloads, key, payload)
redis.call('ZADD', schedule, visible_at, key)
return 1
"#;

const BURY_SCRIPT: &str = r#"
local schedule, payloads, claims, receipts, dead = KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5]
local receipt = ARGV[1]
local key = redis.call('HGET', receipts, receipt)
if not key then
  return 0
end
local payload = redis.call('HGET', payloads, key)
if payload then
  redis.call('HSET', dead, key, payload)
end
redis.call('HDEL', receipts, receipt)
redis.call('HDEL', claims, key)
redis.call('ZREM', schedule, key)
redis.call('HDEL', payloads, key)
return 1
"#;

/// What a single claim attempt produced.
#[derive(Debug)]
enum Claim {
    Delivered(Delivery),
    /// The payload under `key` is not a `ScoringJob`.
    Corrupt { key: String, reason: String },
}

fn parse_claim(key: String, payload: &str, receipt: DeliveryId) -> Claim {
    match decode(payload) {
        Ok(job) => Claim::Delivered(Delivery { receipt, job }),
        Err(e) => Claim::Corrupt {
            key,
            reason: e.to_string(),
        },
    }
}

#[derive(Debug, Clone)]
pub struct RedisTaskQueue {
    client: Arc<redis::Client>,
    schedule_key: String,
    payloads_key: String,
    claims_key: String,
    receipts_key: String,
    dead_key: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
    claim: Arc<redis::Script>,
    ack: Arc<redis::Script>,
    requeue: Arc<redis::Script>,
    bury: Arc<redis::Script>,
}

impl RedisTaskQueue {
    /// Create a queue client.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `key_prefix` - key namespace (default: "textguard:jobs")
    /// * `visibility_timeout` - how long a claimed job stays hidden
    pub fn new(
        redis_url: impl AsRef<str>,
        key_prefix: Option<String>,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let prefix = key_prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());

        Ok(Self {
            client: Arc::new(client),
            schedule_key: format!("{prefix}:schedule"),
            payloads_key: format!("{prefix}:payloads"),
            claims_key: format!("{prefix}:claims"),
            receipts_key: format!("{prefix}:receipts"),
            dead_key: format!("{prefix}:dead"),
            visibility_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            claim: Arc::new(redis::Script::new(CLAIM_SCRIPT)),
            ack: Arc::new(redis::Script::new(ACK_SCRIPT)),
            requeue: Arc::new(redis::Script::new(REQUEUE_SCRIPT)),
            bury: Arc::new(redis::Script::new(BURY_SCRIPT)),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    fn keyed<'a>(&self, script: &'a redis::Script) -> redis::ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        invocation
            .key(&self.schedule_key)
            .key(&self.payloads_key)
            .key(&self.claims_key)
            .key(&self.receipts_key);
        invocation
    }

    /// Claim the next due job.
    ///
    /// Undecodable payloads are moved to the dead-letter hash and the next
    /// due job is tried, so one bad entry cannot starve the queue.
    fn try_claim(&self, conn: &mut redis::Connection) -> Result<Option<Delivery>, QueueError> {
        loop {
            let now = unix_millis(Duration::ZERO);
            let receipt = DeliveryId::new();
            let claimed: Option<(String, String)> = self
                .keyed(&self.claim)
                .arg(now)
                .arg(unix_millis(self.visibility_timeout))
                .arg(receipt.to_string())
                .invoke(conn)
                .map_err(|e| QueueError::Unavailable(format!("claim failed: {e}")))?;

            let Some((key, payload)) = claimed else {
                return Ok(None);
            };
            match parse_claim(key, &payload, receipt) {
                Claim::Delivered(delivery) => {
                    debug!(
                        receipt = %delivery.receipt,
                        prediction_id = %delivery.job.prediction_id,
                        attempt = delivery.job.attempt,
                        "job claimed"
                    );
                    return Ok(Some(delivery));
                }
                Claim::Corrupt { key, reason } => {
                    self.bury_claim(conn, receipt)?;
                    warn!(job_key = %key, dead_key = %self.dead_key, %reason, "undecodable job moved to dead letters");
                }
            }
        }
    }

    fn bury_claim(&self, conn: &mut redis::Connection, receipt: DeliveryId) -> Result<(), QueueError> {
        let mut invocation = self.keyed(&self.bury);
        invocation.key(&self.dead_key).arg(receipt.to_string());
        let _: i64 = invocation
            .invoke(conn)
            .map_err(|e| QueueError::Unavailable(format!("dead-letter failed: {e}")))?;
        Ok(())
    }
}

impl TaskQueue for RedisTaskQueue {
    #[instrument(
        skip(self, job),
        fields(prediction_id = %job.prediction_id, attempt = job.attempt),
        err
    )]
    fn enqueue(&self, job: ScoringJob) -> Result<(), QueueError> {
        let payload = encode(&job)?;
        let key = job.prediction_id.to_string();
        let mut conn = self.connection()?;

        redis::pipe()
            .atomic()
            .hset(&self.payloads_key, &key, &payload)
            .ignore()
            .zadd(&self.schedule_key, &key, unix_millis(Duration::ZERO))
            .ignore()
            .query::<()>(&mut conn)
            .map_err(|e| QueueError::Unavailable(format!("enqueue failed: {e}")))
    }

    fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let give_up_at = Instant::now() + wait;
        let mut conn = self.connection()?;

        loop {
            if let Some(delivery) = self.try_claim(&mut conn)? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= give_up_at {
                return Ok(None);
            }
            std::thread::sleep(self.poll_interval.min(give_up_at - now));
        }
    }

    #[instrument(
        skip(self, delivery),
        fields(prediction_id = %delivery.job.prediction_id, receipt = %delivery.receipt),
        err
    )]
    fn acknowledge(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let removed: i64 = self
            .keyed(&self.ack)
            .arg(delivery.receipt.to_string())
            .invoke(&mut conn)
            .map_err(|e| QueueError::Unavailable(format!("ack failed: {e}")))?;
        if removed == 0 {
            debug!("ack for stale receipt ignored");
        }
        Ok(())
    }

    #[instrument(
        skip(self, delivery, job),
        fields(prediction_id = %job.prediction_id, attempt = job.attempt, delay_ms = delay.as_millis() as u64),
        err
    )]
    fn requeue(
        &self,
        delivery: &Delivery,
        job: ScoringJob,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let payload = encode(&job)?;
        let mut conn = self.connection()?;
        let moved: i64 = self
            .keyed(&self.requeue)
            .arg(delivery.receipt.to_string())
            .arg(unix_millis(delay))
            .arg(payload)
            .invoke(&mut conn)
            .map_err(|e| QueueError::Unavailable(format!("requeue failed: {e}")))?;
        if moved == 0 {
            debug!("requeue for stale receipt ignored");
        }
        Ok(())
    }
}

fn encode(job: &ScoringJob) -> Result<String, QueueError> {
    serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn decode(payload: &str) -> Result<ScoringJob, QueueError> {
    serde_json::from_str(payload).map_err(|e| QueueError::Serialization(e.to_string()))
}

/// Wall-clock unix millis `offset` from now; Redis scores are shared across hosts.
fn unix_millis(offset: Duration) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    (now + offset).as_millis() as u64
}
