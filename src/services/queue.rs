//! At-least-once job queue.
//!
//! A descriptor stays in a processing set from dequeue until ack. If the
//! holder never acks (crash, lost connection), [`JobQueue::requeue_expired`]
//! returns it to the pending list once its lease runs out, so the same
//! descriptor can reach more than one worker. Result persistence is what
//! makes that safe, not the queue.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::job::JobDescriptor;
use crate::services::retry::RetryPolicy;

/// One delivery of a descriptor to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub descriptor: JobDescriptor,
    /// 1-based count of deliveries of this job, including this one.
    pub attempt: u32,
    /// Opaque handle the queue uses to identify this delivery on ack/nack.
    pub receipt: String,
}

/// What `nack` did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { delay: Duration },
    DeadLettered,
}

/// Queue behaviour shared by every backend.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Deliveries allowed before a descriptor is dead-lettered.
    pub max_attempts: u32,
    /// How long a dequeued descriptor may go unacknowledged.
    pub visibility_timeout: Duration,
    /// Delay schedule for redelivery after a nack.
    pub redelivery: RetryPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            visibility_timeout: Duration::from_secs(900),
            redelivery: RetryPolicy::new(0, Duration::from_secs(1), Duration::from_secs(60)),
        }
    }
}

/// Durable channel carrying job descriptors from submitters to workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, descriptor: &JobDescriptor) -> Result<(), QueueError>;

    /// Wait up to `timeout` for the next descriptor.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Processing finished; the descriptor will not be delivered again.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Processing failed; redeliver after backoff, or dead-letter once the
    /// attempt limit is reached.
    async fn nack(&self, delivery: &Delivery) -> Result<NackOutcome, QueueError>;

    /// Move a delivery to the dead-letter channel and stop redelivery.
    async fn dead_letter(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Push the lease deadline of a delivery still held out by one
    /// visibility timeout. `false` when the receipt is no longer held.
    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError>;

    /// Return deliveries whose lease lapsed to the pending list.
    async fn requeue_expired(&self) -> Result<usize, QueueError>;

    /// Pending descriptors, including those waiting out a redelivery delay.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn dead_letter_depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;

    fn max_attempts(&self) -> u32;
}

/// Wire form of a queued descriptor.
///
/// `message_id` keeps two enqueues of the same job distinguishable in Redis
/// lists, where members are matched by value.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    message_id: Uuid,
    #[serde(flatten)]
    descriptor: JobDescriptor,
}

const PROMOTE_DELAYED: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, payload in ipairs(due) do
    if redis.call('ZREM', KEYS[1], payload) == 1 then
        redis.call('LPUSH', KEYS[2], payload)
    end
end
return #due
"#;

/// Pop one payload, wrap it in a fresh receipt, lease it and count the
/// attempt, all in one step. Payloads without a job id go to the dead list.
const DEQUEUE: &str = r#"
local payload = redis.call('RPOP', KEYS[1])
if not payload then
    return false
end
local ok, message = pcall(cjson.decode, payload)
if not ok or type(message) ~= 'table' or type(message.job_id) ~= 'string' then
    redis.call('LPUSH', KEYS[5], payload)
    return {'', 0}
end
local receipt = ARGV[1] .. '|' .. payload
redis.call('LPUSH', KEYS[2], receipt)
redis.call('ZADD', KEYS[3], ARGV[2], receipt)
local attempt = redis.call('HINCRBY', KEYS[4], message.job_id, 1)
return {receipt, attempt}
"#;

const REQUEUE_EXPIRED: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
local moved = 0
for _, receipt in ipairs(expired) do
    redis.call('ZREM', KEYS[1], receipt)
    if redis.call('LREM', KEYS[2], 1, receipt) > 0 then
        local payload = string.sub(receipt, string.find(receipt, '|', 1, true) + 1)
        redis.call('LPUSH', KEYS[3], payload)
        moved = moved + 1
    end
end
return moved
"#;

/// Release a receipt from the processing list and, only if it was still
/// held, push its payload to the destination (a zset when ARGV[2] is set,
/// else a list) and drop the attempt counter named by ARGV[3], if any.
const RELEASE_TO: &str = r#"
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
if removed > 0 then
    local payload = string.sub(ARGV[1], string.find(ARGV[1], '|', 1, true) + 1)
    if ARGV[2] ~= '' then
        redis.call('ZADD', KEYS[3], ARGV[2], payload)
    else
        redis.call('LPUSH', KEYS[3], payload)
    end
    if ARGV[3] ~= '' then
        redis.call('HDEL', KEYS[4], ARGV[3])
    end
end
return removed
"#;

const ACK: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) > 0 then
    redis.call('ZREM', KEYS[2], ARGV[1])
    redis.call('HDEL', KEYS[3], ARGV[2])
    return 1
end
return 0
"#;

const EXTEND_LEASE: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
    return 1
end
return 0
"#;

/// Gap between pending-list polls while a dequeue waits.
const DEQUEUE_POLL: Duration = Duration::from_millis(200);

/// Result of one atomic pop attempt.
enum Popped {
    Empty,
    Malformed,
    Delivered(Delivery),
}

/// Payload half of a `{delivery_id}|{payload}` receipt.
fn receipt_payload(receipt: &str) -> Option<&str> {
    receipt.split_once('|').map(|(_, payload)| payload)
}

/// Redis-backed reliable queue.
///
/// Receipts are unique per delivery, so a holder whose lease lapsed can no
/// longer ack, nack or extend the delivery that replaced it.
pub struct RedisJobQueue {
    client: redis::Client,
    settings: QueueSettings,
    pending_key: String,
    processing_key: String,
    leases_key: String,
    delayed_key: String,
    attempts_key: String,
    dead_key: String,
}

impl RedisJobQueue {
    pub fn new(redis_url: &str, prefix: &str, settings: QueueSettings) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            settings,
            pending_key: format!("{prefix}:pending"),
            processing_key: format!("{prefix}:processing"),
            leases_key: format!("{prefix}:leases"),
            delayed_key: format!("{prefix}:delayed"),
            attempts_key: format!("{prefix}:attempts"),
            dead_key: format!("{prefix}:dead"),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Move redelivery-delayed descriptors whose time has come to pending.
    async fn promote_delayed(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::Script::new(PROMOTE_DELAYED)
            .key(&self.delayed_key)
            .key(&self.pending_key)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_dequeue(&self) -> Result<Popped, QueueError> {
        let mut conn = self.connection().await?;
        let lease_deadline = now_millis() + self.settings.visibility_timeout.as_millis() as i64;
        let popped: Option<(String, i64)> = redis::Script::new(DEQUEUE)
            .key(&self.pending_key)
            .key(&self.processing_key)
            .key(&self.leases_key)
            .key(&self.attempts_key)
            .key(&self.dead_key)
            .arg(Uuid::new_v4().to_string())
            .arg(lease_deadline)
            .invoke_async(&mut conn)
            .await?;

        let Some((receipt, attempt)) = popped else {
            return Ok(Popped::Empty);
        };
        if receipt.is_empty() {
            tracing::error!("Dropped malformed queue payload to dead-letter");
            return Ok(Popped::Malformed);
        }

        let payload = receipt_payload(&receipt)
            .ok_or_else(|| QueueError::Unavailable(format!("unexpected receipt: {receipt}")))?;
        let attempt = u32::try_from(attempt)
            .map_err(|_| QueueError::Unavailable(format!("attempt counter out of range: {attempt}")))?;

        match serde_json::from_str::<Envelope>(payload) {
            Ok(envelope) => Ok(Popped::Delivered(Delivery {
                descriptor: envelope.descriptor,
                attempt,
                receipt,
            })),
            Err(e) => {
                // Unparseable descriptors can never succeed; park them.
                tracing::error!(error = %e, "Dead-lettering undecodable queue payload");
                self.release_to(&receipt, &self.dead_key, None, None).await?;
                Ok(Popped::Malformed)
            }
        }
    }

    async fn release_to(
        &self,
        receipt: &str,
        destination: &str,
        ready_at_millis: Option<i64>,
        forget_attempts: Option<Uuid>,
    ) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::Script::new(RELEASE_TO)
            .key(&self.processing_key)
            .key(&self.leases_key)
            .key(destination)
            .key(&self.attempts_key)
            .arg(receipt)
            .arg(ready_at_millis.map(|ms| ms.to_string()).unwrap_or_default())
            .arg(forget_attempts.map(|id| id.to_string()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, descriptor: &JobDescriptor) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(&Envelope {
            message_id: Uuid::new_v4(),
            descriptor: descriptor.clone(),
        })?;
        conn.lpush::<_, _, ()>(&self.pending_key, &payload).await?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.promote_delayed().await?;
            match self.try_dequeue().await? {
                Popped::Delivered(delivery) => return Ok(Some(delivery)),
                Popped::Malformed => continue,
                Popped::Empty => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(DEQUEUE_POLL)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let acked: i64 = redis::Script::new(ACK)
            .key(&self.processing_key)
            .key(&self.leases_key)
            .key(&self.attempts_key)
            .arg(&delivery.receipt)
            .arg(delivery.descriptor.job_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        if acked == 0 {
            tracing::debug!(job_id = %delivery.descriptor.job_id, "Ack for a delivery no longer held");
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<NackOutcome, QueueError> {
        if delivery.attempt >= self.settings.max_attempts {
            self.dead_letter(delivery).await?;
            return Ok(NackOutcome::DeadLettered);
        }

        let delay = self.settings.redelivery.delay_for(delivery.attempt);
        let ready_at = now_millis() + delay.as_millis() as i64;
        self.release_to(&delivery.receipt, &self.delayed_key, Some(ready_at), None)
            .await?;
        Ok(NackOutcome::Requeued { delay })
    }

    async fn dead_letter(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.release_to(
            &delivery.receipt,
            &self.dead_key,
            None,
            Some(delivery.descriptor.job_id),
        )
        .await?;
        Ok(())
    }

    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let lease_deadline = now_millis() + self.settings.visibility_timeout.as_millis() as i64;
        let extended: i64 = redis::Script::new(EXTEND_LEASE)
            .key(&self.leases_key)
            .arg(&delivery.receipt)
            .arg(lease_deadline)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended > 0)
    }

    async fn requeue_expired(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let moved: i64 = redis::Script::new(REQUEUE_EXPIRED)
            .key(&self.leases_key)
            .key(&self.processing_key)
            .key(&self.pending_key)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved as usize)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let (pending, delayed): (u64, u64) = redis::pipe()
            .llen(&self.pending_key)
            .zcard(&self.delayed_key)
            .query_async(&mut conn)
            .await?;
        Ok(pending + delayed)
    }

    async fn dead_letter_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(&self.dead_key).await?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let reply = redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        if reply != "PONG" {
            return Err(QueueError::Unavailable(format!("unexpected PING reply: {reply}")));
        }
        Ok(())
    }

    fn max_attempts(&self) -> u32 {
        self.settings.max_attempts
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug)]
struct InFlight {
    descriptor: JobDescriptor,
    lease_deadline: Instant,
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    pending: VecDeque<JobDescriptor>,
    delayed: Vec<(Instant, JobDescriptor)>,
    in_flight: HashMap<String, InFlight>,
    attempts: HashMap<Uuid, u32>,
    dead: Vec<JobDescriptor>,
}

impl MemoryQueueState {
    fn promote_delayed(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(ready_at, _)| *ready_at <= now);
        self.delayed = waiting;
        self.pending.extend(due.into_iter().map(|(_, descriptor)| descriptor));
    }
}

/// In-process queue with the same delivery semantics as [`RedisJobQueue`].
pub struct MemoryJobQueue {
    state: Mutex<MemoryQueueState>,
    notify: Notify,
    settings: QueueSettings,
}

impl MemoryJobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            notify: Notify::new(),
            settings,
        }
    }

    /// Descriptors that were dead-lettered, oldest first.
    pub async fn dead_letters(&self) -> Vec<JobDescriptor> {
        self.state.lock().await.dead.clone()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    async fn release(&self, receipt: &str) -> Option<InFlight> {
        self.state.lock().await.in_flight.remove(receipt)
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, descriptor: &JobDescriptor) -> Result<(), QueueError> {
        self.state.lock().await.pending.push_back(descriptor.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.promote_delayed(now);

                if let Some(descriptor) = state.pending.pop_front() {
                    let attempt = {
                        let count = state.attempts.entry(descriptor.job_id).or_insert(0);
                        *count += 1;
                        *count
                    };
                    let receipt = Uuid::new_v4().to_string();
                    state.in_flight.insert(
                        receipt.clone(),
                        InFlight {
                            descriptor: descriptor.clone(),
                            lease_deadline: now + self.settings.visibility_timeout,
                        },
                    );
                    return Ok(Some(Delivery {
                        descriptor,
                        attempt,
                        receipt,
                    }));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Wake on enqueue, or re-check periodically for delayed items.
            let wait = (deadline - now).min(Duration::from_millis(20));
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&delivery.receipt).is_some() {
            state.attempts.remove(&delivery.descriptor.job_id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<NackOutcome, QueueError> {
        if delivery.attempt >= self.settings.max_attempts {
            self.dead_letter(delivery).await?;
            return Ok(NackOutcome::DeadLettered);
        }

        let delay = self.settings.redelivery.delay_for(delivery.attempt);
        if let Some(in_flight) = self.release(&delivery.receipt).await {
            self.state
                .lock()
                .await
                .delayed
                .push((Instant::now() + delay, in_flight.descriptor));
            self.notify.notify_one();
        }
        Ok(NackOutcome::Requeued { delay })
    }

    async fn dead_letter(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(in_flight) = state.in_flight.remove(&delivery.receipt) {
            state.attempts.remove(&in_flight.descriptor.job_id);
            state.dead.push(in_flight.descriptor);
        }
        Ok(())
    }

    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        match state.in_flight.get_mut(&delivery.receipt) {
            Some(in_flight) => {
                in_flight.lease_deadline = Instant::now() + self.settings.visibility_timeout;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn requeue_expired(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.lease_deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in &expired {
            if let Some(in_flight) = state.in_flight.remove(receipt) {
                state.pending.push_back(in_flight.descriptor);
            }
        }
        drop(state);
        if !expired.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(expired.len())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let state = self.state.lock().await;
        Ok((state.pending.len() + state.delayed.len()) as u64)
    }

    async fn dead_letter_depth(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().await.dead.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }

    fn max_attempts(&self) -> u32 {
        self.settings.max_attempts
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}
