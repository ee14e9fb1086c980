use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::{
    CaptureMeta, CrawlJob, JobResult, JobStatus, Outcome, TerminalWrite, Viewport,
};

const JOB_COLUMNS: &str = r#"
    id, url, status, final_url, description, screenshot, viewport_width, viewport_height,
    user_agent, captured_at, error_message, took_ms, created_at, updated_at
"#;

/// Insert a new crawl job
pub async fn insert_job(pool: &PgPool, job: &CrawlJob) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO crawl_jobs (id, url, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(job.id)
    .bind(&job.url)
    .bind(job.status.as_ref())
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<CrawlJob>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Newest pending job for `url` created at or after `since`
pub async fn find_fresh_pending(
    pool: &PgPool,
    url: &str,
    since: DateTime<Utc>,
) -> Result<Option<CrawlJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM crawl_jobs
        WHERE url = $1 AND status = 'pending' AND created_at >= $2
        ORDER BY created_at DESC
        LIMIT 1
        "#
    ))
    .bind(url)
    .bind(since)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Write a terminal state, but only while the stored status is still
/// `pending`. Returns whether a row was updated.
pub async fn complete_job(
    pool: &PgPool,
    job_id: Uuid,
    write: &TerminalWrite,
) -> Result<bool, sqlx::Error> {
    let (result, error_message) = match &write.outcome {
        Outcome::Done(result) => (Some(result), None),
        Outcome::Failed(reason) => (None, Some(reason.message())),
    };

    let updated = sqlx::query(
        r#"
        UPDATE crawl_jobs
        SET status = $2,
            final_url = $3,
            description = $4,
            screenshot = $5,
            viewport_width = $6,
            viewport_height = $7,
            user_agent = $8,
            captured_at = $9,
            error_message = $10,
            took_ms = $11,
            updated_at = NOW()
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(job_id)
    .bind(write.outcome.status().as_ref())
    .bind(result.map(|r| r.final_url.as_str()))
    .bind(result.map(|r| r.description.as_str()))
    .bind(result.map(|r| r.screenshot.as_slice()))
    .bind(result.map(|r| r.meta.viewport.width as i32))
    .bind(result.map(|r| r.meta.viewport.height as i32))
    .bind(result.map(|r| r.meta.user_agent.as_str()))
    .bind(result.map(|r| r.meta.captured_at))
    .bind(error_message)
    .bind(write.took_ms)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() == 1)
}

fn job_from_row(row: &PgRow) -> Result<CrawlJob, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status: JobStatus = status_str
        .parse()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    let url: String = row.try_get("url")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    let result = match status {
        JobStatus::Done => Some(JobResult {
            final_url: row
                .try_get::<Option<String>, _>("final_url")?
                .unwrap_or_else(|| url.clone()),
            description: row
                .try_get::<Option<String>, _>("description")?
                .unwrap_or_default(),
            screenshot: row
                .try_get::<Option<Vec<u8>>, _>("screenshot")?
                .unwrap_or_default(),
            meta: CaptureMeta {
                viewport: Viewport {
                    width: row.try_get::<Option<i32>, _>("viewport_width")?.unwrap_or(0) as u32,
                    height: row.try_get::<Option<i32>, _>("viewport_height")?.unwrap_or(0) as u32,
                },
                user_agent: row
                    .try_get::<Option<String>, _>("user_agent")?
                    .unwrap_or_default(),
                captured_at: row
                    .try_get::<Option<DateTime<Utc>>, _>("captured_at")?
                    .unwrap_or(updated_at),
            },
        }),
        _ => None,
    };

    Ok(CrawlJob {
        id: row.try_get("id")?,
        url,
        status,
        result,
        error_message: row.try_get("error_message")?,
        took_ms: row.try_get("took_ms")?,
        created_at: row.try_get("created_at")?,
        updated_at,
    })
}
