//! In-memory fakes for the injected seams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::store::{JobStore, StoreError};
use crate::models::job::{CaptureMeta, CrawlJob, TerminalWrite, Viewport};
use crate::models::target::TargetUrl;
use crate::services::describe::{Describe, DescribeError};
use crate::services::fetcher::{CaptureError, CapturedPage, PageCapture, USER_AGENT};
use crate::services::queue::{Delivery, JobConsumer, JobPublisher, QueueError, QueueMessage};
use crate::services::robots::PolicyCheck;

#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<Uuid, CrawlJob>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn get(&self, id: Uuid) -> Option<CrawlJob> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.jobs.lock().unwrap().keys().copied().collect()
    }

    pub fn insert(&self, job: CrawlJob) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, job: &CrawlJob) -> Result<(), StoreError> {
        self.check()?;
        self.insert(job.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<CrawlJob>, StoreError> {
        self.check()?;
        Ok(self.get(id))
    }

    async fn find_fresh_pending(
        &self,
        url: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CrawlJob>, StoreError> {
        self.check()?;
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .values()
            .filter(|job| job.url == url && job.created_at >= since)
            .filter(|job| !job.status.is_terminal())
            .max_by_key(|job| job.created_at)
            .cloned())
    }

    async fn complete(&self, id: Uuid, write: &TerminalWrite) -> Result<bool, StoreError> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .get_mut(&id)
            .map(|job| job.apply(write, Utc::now()))
            .unwrap_or(false))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

/// Single-consumer queue with broker-style redelivery counts.
#[derive(Default)]
pub struct MemoryQueue {
    work: Mutex<VecDeque<QueueMessage>>,
    deliveries: Mutex<HashMap<Uuid, u32>>,
    in_flight: Mutex<Option<QueueMessage>>,
    pub dead: Mutex<Vec<QueueMessage>>,
    pub acked: Mutex<Vec<Uuid>>,
    pub fail_publish: std::sync::atomic::AtomicBool,
}

impl MemoryQueue {
    pub fn pending(&self) -> usize {
        self.work.lock().unwrap().len()
    }

    pub fn dead_ids(&self) -> Vec<Uuid> {
        self.dead.lock().unwrap().iter().map(|m| m.id).collect()
    }

    pub fn acked_ids(&self) -> Vec<Uuid> {
        self.acked.lock().unwrap().clone()
    }

    fn settle(&self, delivery: &Delivery) {
        let mut in_flight = self.in_flight.lock().unwrap();
        assert_eq!(
            in_flight.as_ref().map(|m| m.id),
            Some(delivery.message.id),
            "settled a delivery that was not in flight"
        );
        *in_flight = None;
    }

    /// Drop the delivery in hand unsettled and put its message back, as a
    /// consumer restart does.
    pub fn abandon(&self, delivery: Delivery) {
        let message = self.in_flight.lock().unwrap().take();
        assert_eq!(message.as_ref().map(|m| m.id), Some(delivery.message.id));
        if let Some(message) = message {
            self.work.lock().unwrap().push_front(message);
        }
    }
}

#[async_trait]
impl JobPublisher for MemoryQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "broker unavailable",
            ))));
        }
        self.work.lock().unwrap().push_back(message.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.pending() as u64)
    }
}

#[async_trait]
impl JobConsumer for MemoryQueue {
    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut in_flight = self.in_flight.lock().unwrap();
        assert!(in_flight.is_none(), "prefetch exceeded");
        let Some(message) = self.work.lock().unwrap().pop_front() else {
            return Ok(None);
        };
        let mut deliveries = self.deliveries.lock().unwrap();
        let count = deliveries.entry(message.id).or_insert(0);
        let redelivery_count = *count;
        *count += 1;
        *in_flight = Some(message.clone());

        let payload = serde_json::to_string(&message)?;
        Ok(Some(Delivery::new(message, redelivery_count, payload)))
    }

    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError> {
        self.settle(&delivery);
        self.acked.lock().unwrap().push(delivery.message.id);
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), QueueError> {
        self.settle(&delivery);
        if requeue {
            self.work.lock().unwrap().push_front(delivery.message);
        } else {
            self.dead.lock().unwrap().push(delivery.message);
        }
        Ok(())
    }
}

/// Allows or denies every target.
pub struct FixedPolicy(pub bool);

#[async_trait]
impl PolicyCheck for FixedPolicy {
    async fn is_allowed(&self, _target: &TargetUrl) -> bool {
        self.0
    }
}

/// Plays back capture results in order, then succeeds.
#[derive(Default)]
pub struct FakeCapture {
    script: Mutex<VecDeque<Result<CapturedPage, CaptureError>>>,
    calls: AtomicUsize,
}

impl FakeCapture {
    pub fn with_results(results: Vec<Result<CapturedPage, CaptureError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn captured_page(url: &str) -> CapturedPage {
    CapturedPage {
        final_url: url.to_string(),
        screenshot: vec![0xFF, 0xD8, 0xFF, 0xE0],
        meta: CaptureMeta {
            viewport: Viewport {
                width: 1920,
                height: 1080,
            },
            user_agent: USER_AGENT.to_string(),
            captured_at: Utc::now(),
        },
        elapsed_ms: 5,
    }
}

#[async_trait]
impl PageCapture for FakeCapture {
    async fn capture(&self, target: &TargetUrl) -> Result<CapturedPage, CaptureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(captured_page(target.as_str())))
    }
}

/// Plays back description results in order, then succeeds.
#[derive(Default)]
pub struct FakeDescribe {
    script: Mutex<VecDeque<Result<String, DescribeError>>>,
}

impl FakeDescribe {
    pub fn with_results(results: Vec<Result<String, DescribeError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
        }
    }
}

#[async_trait]
impl Describe for FakeDescribe {
    async fn describe(&self, _image: &[u8]) -> Result<String, DescribeError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("A calm, well-spaced page.".to_string()))
    }
}
