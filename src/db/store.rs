use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::{CrawlJob, TerminalWrite};

/// Persistent record of crawl jobs.
///
/// `complete` is the only way a job leaves `pending`; implementations must
/// apply it conditionally so a late second writer can never overwrite a
/// terminal record.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &CrawlJob) -> Result<(), StoreError>;

    async fn find(&self, id: Uuid) -> Result<Option<CrawlJob>, StoreError>;

    /// Newest `pending` job for `url` created at or after `since`.
    async fn find_fresh_pending(
        &self,
        url: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CrawlJob>, StoreError>;

    /// Apply a terminal write if the job is still `pending`. Returns `false`
    /// when the job was already terminal or does not exist.
    async fn complete(&self, id: Uuid, write: &TerminalWrite) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// `JobStore` backed by the `crawl_jobs` PostgreSQL table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &CrawlJob) -> Result<(), StoreError> {
        queries::insert_job(&self.pool, job).await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<CrawlJob>, StoreError> {
        Ok(queries::get_job(&self.pool, id).await?)
    }

    async fn find_fresh_pending(
        &self,
        url: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CrawlJob>, StoreError> {
        Ok(queries::find_fresh_pending(&self.pool, url, since).await?)
    }

    async fn complete(&self, id: Uuid, write: &TerminalWrite) -> Result<bool, StoreError> {
        Ok(queries::complete_job(&self.pool, id, write).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
