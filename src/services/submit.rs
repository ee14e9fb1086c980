//! Accepting crawl requests: normalise, deduplicate, record, publish.

use chrono::Utc;
use uuid::Uuid;

use crate::db::store::{JobStore, StoreError};
use crate::models::failure::FailureReason;
use crate::models::job::{CrawlJob, TerminalWrite};
use crate::models::target::{TargetUrl, UrlError};
use crate::services::queue::{JobPublisher, QueueError, QueueMessage};

/// Result of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub id: Uuid,
    /// `true` when an in-flight job for the same URL absorbed this request.
    pub deduplicated: bool,
}

/// Id of a `pending` job for `url` created within `window`, if any.
///
/// Best effort only: two submissions racing this read may both miss.
pub async fn find_in_flight(
    store: &dyn JobStore,
    url: &TargetUrl,
    window: chrono::Duration,
) -> Result<Option<Uuid>, StoreError> {
    let now = Utc::now();
    let job = store.find_fresh_pending(url.as_str(), now - window).await?;
    Ok(job
        .filter(|job| job.is_fresh_pending(now, window))
        .map(|job| job.id))
}

pub async fn submit(
    store: &dyn JobStore,
    publisher: &dyn JobPublisher,
    raw_url: &str,
    window: chrono::Duration,
) -> Result<Submitted, SubmitError> {
    let target = TargetUrl::parse(raw_url)?;

    if let Some(id) = find_in_flight(store, &target, window).await? {
        metrics::counter!("crawl_jobs_deduplicated_total").increment(1);
        tracing::info!(job_id = %id, url = %target, "Reusing in-flight job");
        return Ok(Submitted {
            id,
            deduplicated: true,
        });
    }

    let job = CrawlJob::new(&target);
    store.create(&job).await?;

    let message = QueueMessage {
        id: job.id,
        url: job.url.clone(),
        requested_at: job.created_at,
    };
    if let Err(e) = publisher.publish(&message).await {
        tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue crawl job");
        // Keep the orphan out of the dedup window.
        let write = TerminalWrite::failed(
            FailureReason::EnqueueFailed,
            message.age_ms(Utc::now()),
        );
        if let Err(store_err) = store.complete(job.id, &write).await {
            tracing::error!(job_id = %job.id, error = %store_err, "Failed to mark unqueued job");
        }
        return Err(SubmitError::Queue(e));
    }

    metrics::counter!("crawl_jobs_submitted_total").increment(1);
    tracing::info!(job_id = %job.id, url = %target, "Crawl job accepted");

    Ok(Submitted {
        id: job.id,
        deduplicated: false,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] UrlError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
