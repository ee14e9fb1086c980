use base64::Engine;
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{CaptureMeta, CrawlJob, JobStatus};

/// Body of `POST /crawl`.
#[derive(Debug, Deserialize, Validate)]
pub struct CrawlRequest {
    #[garde(length(min = 1, max = 2048))]
    pub url: String,
}

/// Response after accepting a crawl request.
#[derive(Debug, Serialize, Deserialize)]
pub struct CrawlAccepted {
    pub id: Uuid,
}

/// What `GET /crawl/{id}` reports about a job.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobView {
    Pending,
    Error { message: String },
    Done { result: ResultView },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultView {
    pub url: String,
    pub description: String,
    /// `data:image/jpeg;base64,...`
    pub image: String,
    pub took_ms: i64,
    pub meta: CaptureMeta,
}

impl From<&CrawlJob> for JobView {
    fn from(job: &CrawlJob) -> Self {
        match (job.status, &job.result) {
            (JobStatus::Done, Some(result)) => JobView::Done {
                result: ResultView {
                    url: result.final_url.clone(),
                    description: result.description.clone(),
                    image: format!(
                        "data:image/jpeg;base64,{}",
                        base64::engine::general_purpose::STANDARD.encode(&result.screenshot)
                    ),
                    took_ms: job.took_ms.unwrap_or(0),
                    meta: result.meta.clone(),
                },
            },
            (JobStatus::Pending, _) => JobView::Pending,
            _ => JobView::Error {
                message: job
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown_error".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{JobResult, Outcome, TerminalWrite, Viewport};
    use crate::models::target::TargetUrl;
    use chrono::Utc;

    #[test]
    fn test_pending_view() {
        let job = CrawlJob::new(&TargetUrl::parse("https://example.com").unwrap());
        let json = serde_json::to_value(JobView::from(&job)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "pending"}));
    }

    #[test]
    fn test_done_view_encodes_image() {
        let mut job = CrawlJob::new(&TargetUrl::parse("https://example.com").unwrap());
        let write = TerminalWrite {
            outcome: Outcome::Done(JobResult {
                final_url: "https://example.com/".to_string(),
                description: "Minimal page".to_string(),
                screenshot: vec![1, 2, 3],
                meta: CaptureMeta {
                    viewport: Viewport {
                        width: 1920,
                        height: 1080,
                    },
                    user_agent: "ua".to_string(),
                    captured_at: Utc::now(),
                },
            }),
            took_ms: 42,
        };
        assert!(job.apply(&write, Utc::now()));

        let json = serde_json::to_value(JobView::from(&job)).unwrap();
        assert_eq!(json["status"], "done");
        assert_eq!(json["result"]["image"], "data:image/jpeg;base64,AQID");
        assert_eq!(json["result"]["tookMs"], 42);
        assert_eq!(json["result"]["meta"]["viewport"]["width"], 1920);
    }

    #[test]
    fn test_error_view() {
        let mut job = CrawlJob::new(&TargetUrl::parse("https://example.com").unwrap());
        let write = TerminalWrite::failed(crate::models::failure::FailureReason::Timeout, 30_000);
        assert!(job.apply(&write, Utc::now()));

        let json = serde_json::to_value(JobView::from(&job)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "error", "message": "timeout"})
        );
    }
}
