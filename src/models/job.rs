use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::failure::FailureReason;
use crate::models::target::TargetUrl;

/// Lifecycle state of a crawl job.
///
/// `Pending` is the only initial state; `Done` and `Error` are terminal and
/// can never be left again.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending)
    }

    /// The only legal transitions are `pending -> done` and `pending -> error`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Done) | (JobStatus::Pending, JobStatus::Error)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// How the screenshot was taken.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMeta {
    pub viewport: Viewport,
    pub user_agent: String,
    pub captured_at: DateTime<Utc>,
}

/// Payload of a job that reached `done`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    /// URL the browser ended on after redirects.
    pub final_url: String,
    pub description: String,
    /// JPEG bytes of the full-page screenshot.
    pub screenshot: Vec<u8>,
    pub meta: CaptureMeta,
}

/// A URL analysis request and its lifecycle record.
#[derive(Debug, Clone)]
pub struct CrawlJob {
    pub id: Uuid,
    pub url: String,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub error_message: Option<String>,
    pub took_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrawlJob {
    /// New `pending` job with a time-ordered id.
    pub fn new(url: &TargetUrl) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            url: url.as_str().to_string(),
            status: JobStatus::Pending,
            result: None,
            error_message: None,
            took_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this job may still absorb a duplicate submission at `now`.
    pub fn is_fresh_pending(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.status == JobStatus::Pending && self.created_at >= now - window
    }

    /// Apply a terminal write in memory. Returns `false` and leaves the job
    /// untouched when the transition is illegal.
    pub fn apply(&mut self, write: &TerminalWrite, now: DateTime<Utc>) -> bool {
        let next = write.outcome.status();
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        match &write.outcome {
            Outcome::Done(result) => {
                self.result = Some(result.clone());
                self.error_message = None;
            }
            Outcome::Failed(reason) => {
                self.result = None;
                self.error_message = Some(reason.message());
            }
        }
        self.took_ms = Some(write.took_ms);
        self.updated_at = now;
        true
    }
}

/// Terminal outcome of processing a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done(JobResult),
    Failed(FailureReason),
}

impl Outcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Outcome::Done(_) => JobStatus::Done,
            Outcome::Failed(_) => JobStatus::Error,
        }
    }
}

/// Everything a terminal write persists besides `updated_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalWrite {
    pub outcome: Outcome,
    pub took_ms: i64,
}

impl TerminalWrite {
    pub fn failed(reason: FailureReason, took_ms: i64) -> Self {
        Self {
            outcome: Outcome::Failed(reason),
            took_ms,
        }
    }
}
