//! Worker side: turns one queue delivery into one terminal job write.
//!
//! A delivery is acked only after its terminal state is persisted. Failures
//! that say nothing about the target (browser launch, store, broker, a
//! retryable description error) are nacked and go through the retry policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::db::store::{JobStore, StoreError};
use crate::models::failure::FailureReason;
use crate::models::job::{JobResult, Outcome, TerminalWrite};
use crate::models::target::TargetUrl;
use crate::services::describe::{Describe, DescribeError};
use crate::services::fetcher::{BrowserError, CaptureError, PageCapture};
use crate::services::queue::{
    Delivery, JobConsumer, QueueError, QueueMessage, RetryPolicy, Settlement,
};
use crate::services::robots::PolicyCheck;

/// Failure that does not finish the job. The delivery is retried or
/// dead-lettered.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error("Description service unavailable: {0}")]
    Describe(#[from] DescribeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Processor {
    store: Arc<dyn JobStore>,
    policy: Arc<dyn PolicyCheck>,
    capture: Arc<dyn PageCapture>,
    describer: Arc<dyn Describe>,
    retry: RetryPolicy,
}

impl Processor {
    pub fn new(
        store: Arc<dyn JobStore>,
        policy: Arc<dyn PolicyCheck>,
        capture: Arc<dyn PageCapture>,
        describer: Arc<dyn Describe>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            policy,
            capture,
            describer,
            retry,
        }
    }

    /// Run the pipeline for one message: policy check, capture, describe.
    pub async fn process(&self, message: &QueueMessage) -> Result<TerminalWrite, ProcessError> {
        let start = Instant::now();
        let elapsed_ms = || start.elapsed().as_millis() as i64;

        let target = match TargetUrl::parse(&message.url) {
            Ok(target) => target,
            Err(e) => {
                return Ok(TerminalWrite::failed(
                    FailureReason::navigation(&e.to_string()),
                    elapsed_ms(),
                ))
            }
        };

        if !self.policy.is_allowed(&target).await {
            tracing::info!(job_id = %message.id, url = %target, "Disallowed by robots.txt");
            return Ok(TerminalWrite::failed(
                FailureReason::RobotsDisallowed,
                elapsed_ms(),
            ));
        }

        let page = match self.capture.capture(&target).await {
            Ok(page) => page,
            Err(CaptureError::Navigation(e)) => {
                tracing::info!(job_id = %message.id, url = %target, error = %e, "Navigation failed");
                return Ok(TerminalWrite::failed(FailureReason::from(&e), elapsed_ms()));
            }
            Err(CaptureError::Browser(e)) => return Err(e.into()),
        };

        tracing::debug!(
            job_id = %message.id,
            final_url = %page.final_url,
            bytes = page.screenshot.len(),
            capture_ms = page.elapsed_ms,
            "Screenshot captured"
        );

        let description = match self.describer.describe(&page.screenshot).await {
            Ok(text) => text,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(job_id = %message.id, error = %e, "Description failed");
                return Ok(TerminalWrite::failed(
                    FailureReason::DescriptionFailed,
                    elapsed_ms(),
                ));
            }
        };

        Ok(TerminalWrite {
            outcome: Outcome::Done(JobResult {
                final_url: page.final_url,
                description,
                screenshot: page.screenshot,
                meta: page.meta,
            }),
            took_ms: elapsed_ms(),
        })
    }

    /// Process and settle one delivery. Returns how it was settled.
    pub async fn handle_delivery(
        &self,
        consumer: &dyn JobConsumer,
        delivery: Delivery,
    ) -> Result<Settlement, QueueError> {
        let job_id = delivery.message.id;
        tracing::info!(
            job_id = %job_id,
            url = %delivery.message.url,
            redelivery_count = delivery.redelivery_count,
            "Processing crawl job"
        );

        if self.retry.is_exhausted(delivery.redelivery_count) {
            tracing::error!(
                job_id = %job_id,
                redelivery_count = delivery.redelivery_count,
                "Delivery limit reached without settlement, dead-lettering"
            );
            self.dead_letter(consumer, delivery).await?;
            return Ok(Settlement::DeadLetter);
        }

        match self.store.find(job_id).await {
            Ok(Some(job)) if job.status.is_terminal() => {
                tracing::info!(job_id = %job_id, status = %job.status, "Job already finished");
                consumer.ack(delivery).await?;
                return Ok(Settlement::Ack);
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "No job record for message, dropping");
                consumer.ack(delivery).await?;
                return Ok(Settlement::Ack);
            }
            Err(e) => return self.settle_failure(consumer, delivery, e.into()).await,
        }

        let start = Instant::now();
        let write = match self.process(&delivery.message).await {
            Ok(write) => write,
            Err(e) => return self.settle_failure(consumer, delivery, e).await,
        };

        match self.store.complete(job_id, &write).await {
            Ok(applied) => {
                if !applied {
                    tracing::warn!(job_id = %job_id, "Job was already terminal, result discarded");
                }
            }
            Err(e) => return self.settle_failure(consumer, delivery, e.into()).await,
        }
        consumer.ack(delivery).await?;

        metrics::histogram!("crawl_processing_seconds").record(start.elapsed().as_secs_f64());
        match &write.outcome {
            Outcome::Done(_) => {
                metrics::counter!("crawl_jobs_completed_total").increment(1);
                tracing::info!(job_id = %job_id, took_ms = write.took_ms, "Crawl job done");
            }
            Outcome::Failed(reason) => {
                metrics::counter!("crawl_jobs_failed_total", "reason" => reason.code())
                    .increment(1);
                tracing::info!(job_id = %job_id, reason = %reason, "Crawl job failed");
            }
        }

        Ok(Settlement::Ack)
    }

    async fn settle_failure(
        &self,
        consumer: &dyn JobConsumer,
        delivery: Delivery,
        error: ProcessError,
    ) -> Result<Settlement, QueueError> {
        let job_id = delivery.message.id;
        let redelivery_count = delivery.redelivery_count;
        let settlement = self.retry.on_failure(redelivery_count);

        match settlement {
            Settlement::Requeue => {
                tracing::warn!(
                    job_id = %job_id,
                    redelivery_count,
                    error = %error,
                    "Transient failure, requeueing"
                );
                consumer.nack(delivery, true).await?;
                metrics::counter!("crawl_jobs_requeued_total").increment(1);
            }
            Settlement::DeadLetter | Settlement::Ack => {
                tracing::error!(
                    job_id = %job_id,
                    redelivery_count,
                    error = %error,
                    "Retries exhausted, dead-lettering"
                );
                self.dead_letter(consumer, delivery).await?;
            }
        }

        Ok(settlement)
    }

    /// Park the message and close its job as `retries_exhausted`.
    async fn dead_letter(
        &self,
        consumer: &dyn JobConsumer,
        delivery: Delivery,
    ) -> Result<(), QueueError> {
        let job_id = delivery.message.id;
        let took_ms = delivery.message.age_ms(Utc::now());
        consumer.nack(delivery, false).await?;
        metrics::counter!("crawl_jobs_dead_lettered_total").increment(1);

        let write = TerminalWrite::failed(FailureReason::RetriesExhausted, took_ms);
        if let Err(e) = self.store.complete(job_id, &write).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark dead-lettered job");
        }
        Ok(())
    }

    /// Consume until `shutdown` fires. The delivery in hand when it fires is
    /// still settled before returning.
    pub async fn run(
        &self,
        consumer: &dyn JobConsumer,
        shutdown: CancellationToken,
        poll_interval: Duration,
    ) {
        while !shutdown.is_cancelled() {
            let idle = match consumer.receive().await {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.handle_delivery(consumer, delivery).await {
                        tracing::error!(error = %e, "Failed to settle delivery");
                        true
                    } else {
                        false
                    }
                }
                Ok(None) => {
                    tracing::trace!("No jobs available, sleeping");
                    true
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to receive from queue");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
        tracing::info!("Processing loop stopped");
    }
}
