//! Page fetch executor: loads one page through an ordered fallback chain and
//! captures a full-page JPEG.
//!
//! Chain:
//! 1. fresh session, wait for network idle, then full load, then DOM ready
//! 2. if any attempt hits an HTTP/2 protocol error, drop the session and try
//!    once more in a fresh session with relaxed certificate checks, waiting
//!    for full load, then DOM ready
//!
//! Every attempt is time-boxed and every session is released on every exit
//! path.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::models::failure::FailureReason;
use crate::models::job::{CaptureMeta, Viewport};
use crate::models::target::TargetUrl;

/// Fixed, identifying user agent for every request the worker makes.
pub const USER_AGENT: &str = "Mozilla/5.0 (compatible; WebAnalyzer/1.0)";

const STRICT_CONDITIONS: &[WaitUntil] = &[
    WaitUntil::NetworkIdle,
    WaitUntil::Load,
    WaitUntil::DomContentLoaded,
];
const RELAXED_CONDITIONS: &[WaitUntil] = &[WaitUntil::Load, WaitUntil::DomContentLoaded];

/// Completion condition for one navigation attempt, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    NetworkIdle,
    Load,
    DomContentLoaded,
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub viewport: Viewport,
    pub user_agent: String,
    /// Bound for the network-idle attempt
    pub network_idle_timeout: Duration,
    /// Bound for the load and DOM-ready attempts
    pub navigation_timeout: Duration,
    /// Bound for any other browser call
    pub operation_timeout: Duration,
    pub settle_delay: Duration,
    pub scroll_pause: Duration,
    pub jpeg_quality: i64,
    pub chromium_path: Option<PathBuf>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            viewport: Viewport {
                width: 1920,
                height: 1080,
            },
            user_agent: USER_AGENT.to_string(),
            network_idle_timeout: Duration::from_secs(15),
            navigation_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_secs(2),
            scroll_pause: Duration::from_millis(500),
            jpeg_quality: 50,
            chromium_path: None,
        }
    }
}

impl FetchSettings {
    fn timeout_for(&self, wait: WaitUntil) -> Duration {
        match wait {
            WaitUntil::NetworkIdle => self.network_idle_timeout,
            WaitUntil::Load | WaitUntil::DomContentLoaded => self.navigation_timeout,
        }
    }

    /// Upper bound for settle, scroll passes and the screenshot.
    fn capture_timeout(&self) -> Duration {
        self.settle_delay + self.scroll_pause * 2 + self.operation_timeout
    }
}

/// A page that loaded and was captured.
#[derive(Debug, Clone)]
pub struct CapturedPage {
    pub final_url: String,
    pub screenshot: Vec<u8>,
    pub meta: CaptureMeta,
    pub elapsed_ms: i64,
}

/// A navigation or capture failure, already sorted into a category.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NavigationError {
    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("HTTP/2 protocol error: {0}")]
    Http2Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl NavigationError {
    /// Classify a browser error message. Checks run in priority order:
    /// certificate, authentication, protocol downgrade, timeout.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        let message = message.to_string();

        if lower.contains("err_cert") || lower.contains("certificate") {
            NavigationError::Certificate(message)
        } else if signals_auth(&lower) {
            NavigationError::AuthRequired(message)
        } else if lower.contains("err_http2")
            || lower.contains("err_spdy_protocol_error")
            || lower.contains("err_quic_protocol_error")
        {
            NavigationError::Http2Protocol(message)
        } else if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("err_timed_out")
        {
            NavigationError::Timeout(message)
        } else {
            NavigationError::Other(message)
        }
    }

    pub fn is_protocol_downgrade(&self) -> bool {
        matches!(self, NavigationError::Http2Protocol(_))
    }
}

/// Chromium `ERR_*AUTH*` codes, a bare 401/407 status token, or the status
/// reason phrases. Expects lowercase input.
fn signals_auth(lower: &str) -> bool {
    lower
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|token| {
            (token.starts_with("err_") && token.contains("auth"))
                || token == "401"
                || token == "407"
                || token == "unauthorized"
        })
        || lower.contains("authentication required")
}

impl From<&NavigationError> for FailureReason {
    fn from(err: &NavigationError) -> Self {
        match err {
            NavigationError::Certificate(_) => FailureReason::InvalidCertificate,
            NavigationError::AuthRequired(_) => FailureReason::AuthRequired,
            NavigationError::Http2Protocol(_) => FailureReason::Http2ProtocolError,
            NavigationError::Timeout(_) => FailureReason::Timeout,
            NavigationError::Other(detail) => FailureReason::navigation(detail),
        }
    }
}

/// The browser itself could not be brought up or driven. Not a property of
/// the target site, so the job is worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("Browser session setup failed: {0}")]
    Session(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// One isolated browsing session (browser context plus a single page).
#[async_trait]
pub trait Session: Send + Sync {
    /// Navigate and wait for `wait`. Callers bound the duration.
    async fn navigate(&self, url: &str, wait: WaitUntil) -> Result<(), NavigationError>;

    /// Settle, scroll to trigger lazy content, and take the screenshot.
    /// Returns the final URL and the JPEG bytes.
    async fn capture(&self, settings: &FetchSettings) -> Result<(String, Vec<u8>), NavigationError>;
}

/// Opens and releases sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: Session;

    async fn open(&self, relaxed_tls: bool) -> Result<Self::Session, BrowserError>;

    /// Close the page, then its browser context.
    async fn release(&self, session: Self::Session);
}

/// Loads and screenshots a page.
#[async_trait]
pub trait PageCapture: Send + Sync {
    async fn capture(&self, target: &TargetUrl) -> Result<CapturedPage, CaptureError>;
}

/// Run the full fallback chain against `factory`.
pub async fn fetch_page<F: SessionFactory>(
    factory: &F,
    target: &TargetUrl,
    settings: &FetchSettings,
) -> Result<CapturedPage, CaptureError> {
    let start = Instant::now();

    let outcome = match run_session(factory, target, settings, false, STRICT_CONDITIONS).await? {
        Err(e) if e.is_protocol_downgrade() => {
            tracing::warn!(
                url = %target,
                error = %e,
                "HTTP/2 protocol error, retrying in a fresh relaxed session"
            );
            run_session(factory, target, settings, true, RELAXED_CONDITIONS).await?
        }
        other => other,
    };

    let (final_url, screenshot) = outcome?;
    Ok(CapturedPage {
        final_url,
        screenshot,
        meta: CaptureMeta {
            viewport: settings.viewport,
            user_agent: settings.user_agent.clone(),
            captured_at: Utc::now(),
        },
        elapsed_ms: start.elapsed().as_millis() as i64,
    })
}

/// Open one session, drive it, and release it whatever happened.
async fn run_session<F: SessionFactory>(
    factory: &F,
    target: &TargetUrl,
    settings: &FetchSettings,
    relaxed_tls: bool,
    conditions: &[WaitUntil],
) -> Result<Result<(String, Vec<u8>), NavigationError>, BrowserError> {
    let session = factory.open(relaxed_tls).await?;
    let outcome = drive_session(&session, target, settings, conditions).await;
    factory.release(session).await;
    Ok(outcome)
}

async fn drive_session<S: Session>(
    session: &S,
    target: &TargetUrl,
    settings: &FetchSettings,
    conditions: &[WaitUntil],
) -> Result<(String, Vec<u8>), NavigationError> {
    let mut last_error = NavigationError::Other("no navigation attempted".to_string());

    for &wait in conditions {
        let limit = settings.timeout_for(wait);
        let attempt = tokio::time::timeout(limit, session.navigate(target.as_str(), wait)).await;

        match attempt {
            Ok(Ok(())) => {
                tracing::debug!(url = %target, ?wait, "Navigation succeeded");
                return match tokio::time::timeout(
                    settings.capture_timeout(),
                    session.capture(settings),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(NavigationError::Timeout(format!(
                        "capture exceeded {:?}",
                        settings.capture_timeout()
                    ))),
                };
            }
            Ok(Err(e)) if e.is_protocol_downgrade() => return Err(e),
            Ok(Err(e)) => {
                tracing::debug!(url = %target, ?wait, error = %e, "Navigation attempt failed");
                last_error = e;
            }
            Err(_) => {
                tracing::debug!(url = %target, ?wait, "Navigation attempt timed out");
                last_error = NavigationError::Timeout(format!("{wait:?} not reached within {limit:?}"));
            }
        }
    }

    Err(last_error)
}
