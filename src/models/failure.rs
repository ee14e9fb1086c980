use std::fmt;

/// Longest pass-through message kept for unclassified navigation failures.
const MAX_DETAIL_LEN: usize = 200;

/// Why a job ended in `error`.
///
/// `message()` is the only text that reaches the job record, so every variant
/// renders to a short, stable string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    RobotsDisallowed,
    InvalidCertificate,
    AuthRequired,
    Http2ProtocolError,
    Timeout,
    /// Navigation failed for a reason with no known category.
    Navigation(String),
    DescriptionFailed,
    EnqueueFailed,
    RetriesExhausted,
}

impl FailureReason {
    /// Unclassified navigation failure, keeping only the first line of the
    /// browser message.
    pub fn navigation(detail: &str) -> Self {
        let line = detail.lines().next().unwrap_or_default().trim();
        let line: String = line.chars().take(MAX_DETAIL_LEN).collect();
        FailureReason::Navigation(line)
    }

    /// Stable label used for metrics.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::RobotsDisallowed => "robots_disallowed",
            FailureReason::InvalidCertificate => "invalid_certificate",
            FailureReason::AuthRequired => "auth_required",
            FailureReason::Http2ProtocolError => "http2_protocol_error",
            FailureReason::Timeout => "timeout",
            FailureReason::Navigation(_) => "navigation_failed",
            FailureReason::DescriptionFailed => "description_failed",
            FailureReason::EnqueueFailed => "enqueue_failed",
            FailureReason::RetriesExhausted => "retries_exhausted",
        }
    }

    /// Text persisted to `error_message`.
    pub fn message(&self) -> String {
        match self {
            FailureReason::Navigation(detail) if !detail.is_empty() => {
                format!("{}: {}", self.code(), detail)
            }
            other => other.code().to_string(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}
