//! Durable crawl queue on Redis.
//!
//! Topology, mirrored with lists:
//! - work queue `crawl:requests`, fed by publishing to the `crawl` exchange
//!   with routing key `crawl.requests`
//! - one in-flight list per consumer, `crawl:processing:{consumer}`, holding
//!   at most one unacknowledged delivery (prefetch = 1)
//! - dead-letter queue `crawl:dead`, receiving messages rejected without
//!   requeue
//! - delivery counts in the `crawl:deliveries` hash, keyed by message id and
//!   never part of the message body
//!
//! Durability of accepted messages relies on Redis append-only persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const WORK_EXCHANGE: &str = "crawl";
pub const WORK_ROUTING_KEY: &str = "crawl.requests";
const WORK_QUEUE_KEY: &str = "crawl:requests";
const DEAD_LETTER_KEY: &str = "crawl:dead";
const DELIVERY_COUNT_KEY: &str = "crawl:deliveries";
const PROCESSING_KEY_PREFIX: &str = "crawl:processing";

/// Message body published for every accepted job. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub id: Uuid,
    pub url: String,
    pub requested_at: DateTime<Utc>,
}

impl QueueMessage {
    /// Milliseconds since the job was accepted.
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.requested_at).num_milliseconds().max(0)
    }
}

/// One handed-out message awaiting settlement.
///
/// `ack` and `nack` take the delivery by value, so a delivery is settled at
/// most once.
#[derive(Debug)]
pub struct Delivery {
    pub message: QueueMessage,
    /// How many times this message was delivered before this delivery.
    pub redelivery_count: u32,
    payload: String,
}

impl Delivery {
    pub(crate) fn new(message: QueueMessage, redelivery_count: u32, payload: String) -> Self {
        Self {
            message,
            redelivery_count,
            payload,
        }
    }

    pub(crate) fn payload(&self) -> &str {
        &self.payload
    }
}

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Negative acknowledgement with requeue.
    Requeue,
    /// Negative acknowledgement without requeue.
    DeadLetter,
}

/// Redelivery-count based retry policy applied to failed deliveries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn on_failure(&self, redelivery_count: u32) -> Settlement {
        if redelivery_count < self.max_retries {
            Settlement::Requeue
        } else {
            Settlement::DeadLetter
        }
    }

    /// Every allowed attempt was already handed out and none settled the
    /// message, e.g. the consumer died mid-job each time.
    pub fn is_exhausted(&self, redelivery_count: u32) -> bool {
        redelivery_count > self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Producer side of the queue.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Broker connectivity, for health checks.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Messages waiting in the work queue.
    async fn depth(&self) -> Result<u64, QueueError>;
}

/// Consumer side of the queue. At most one delivery is outstanding per
/// consumer.
#[async_trait]
pub trait JobConsumer: Send + Sync {
    /// Next delivery, or `None` when the work queue is empty.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError>;

    /// Negatively acknowledge; `requeue = false` dead-letters the message.
    async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), QueueError>;
}

/// Redis-backed crawl queue.
pub struct JobQueue {
    client: redis::Client,
    processing_key: String,
}

impl JobQueue {
    /// `consumer_id` names this process's in-flight list. Producers may pass
    /// any value.
    pub fn new(redis_url: &str, consumer_id: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            processing_key: format!("{PROCESSING_KEY_PREFIX}:{consumer_id}"),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Move deliveries left in this consumer's in-flight list by a crash back
    /// onto the work queue. Their delivery counts are kept, so they come back
    /// as redeliveries.
    pub async fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let mut recovered = 0;
        loop {
            let moved: Option<String> = conn
                .rpoplpush(&self.processing_key, WORK_QUEUE_KEY)
                .await
                .map_err(QueueError::Redis)?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Messages parked in the dead-letter queue.
    pub async fn dead_letter_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(DEAD_LETTER_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn dead_letter_raw(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        payload: &str,
    ) -> Result<(), QueueError> {
        redis::pipe()
            .atomic()
            .lrem(&self.processing_key, 1, payload)
            .ignore()
            .lpush(DEAD_LETTER_KEY, payload)
            .ignore()
            .query_async::<()>(conn)
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl JobPublisher for JobQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(message).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(WORK_QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        tracing::debug!(
            exchange = WORK_EXCHANGE,
            routing_key = WORK_ROUTING_KEY,
            job_id = %message.id,
            "Published crawl request"
        );
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(WORK_QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

#[async_trait]
impl JobConsumer for JobQueue {
    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        loop {
            let payload: Option<String> = conn
                .rpoplpush(WORK_QUEUE_KEY, &self.processing_key)
                .await
                .map_err(QueueError::Redis)?;
            let Some(payload) = payload else {
                return Ok(None);
            };

            let message: QueueMessage = match serde_json::from_str(&payload) {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(error = %e, "Unreadable queue message, dead-lettering");
                    self.dead_letter_raw(&mut conn, &payload).await?;
                    continue;
                }
            };

            let deliveries: u32 = conn
                .hincr(DELIVERY_COUNT_KEY, message.id.to_string(), 1)
                .await
                .map_err(QueueError::Redis)?;

            return Ok(Some(Delivery::new(
                message,
                deliveries.saturating_sub(1),
                payload,
            )));
        }
    }

    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let (removed,): (i64,) = redis::pipe()
            .atomic()
            .lrem(&self.processing_key, 1, delivery.payload())
            .hdel(DELIVERY_COUNT_KEY, delivery.message.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        if removed == 0 {
            tracing::warn!(job_id = %delivery.message.id, "Acked delivery was not in flight");
        }
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        if requeue {
            // Requeued messages go to the consuming end, so they are next.
            redis::pipe()
                .atomic()
                .lrem(&self.processing_key, 1, delivery.payload())
                .ignore()
                .rpush(WORK_QUEUE_KEY, delivery.payload())
                .ignore()
                .query_async::<()>(&mut conn)
                .await
                .map_err(QueueError::Redis)
        } else {
            redis::pipe()
                .atomic()
                .lrem(&self.processing_key, 1, delivery.payload())
                .ignore()
                .lpush(DEAD_LETTER_KEY, delivery.payload())
                .ignore()
                .hdel(DELIVERY_COUNT_KEY, delivery.message.id.to_string())
                .ignore()
                .query_async::<()>(&mut conn)
                .await
                .map_err(QueueError::Redis)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
