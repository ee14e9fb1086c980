//! Chromium driven over CDP with chromiumoxide.
//!
//! One browser process per capture; each session is its own browser context
//! holding a single page.

use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, NavigateParams};
use chromiumoxide::cdp::browser_protocol::security::SetIgnoreCertificateErrorsParams;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::models::job::Viewport;
use crate::models::target::TargetUrl;
use crate::services::fetcher::{
    fetch_page, BrowserError, CaptureError, CapturedPage, FetchSettings, NavigationError,
    PageCapture, Session, SessionFactory, WaitUntil,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Resource count must hold still this long to count as network idle.
const IDLE_QUIET_PERIOD: Duration = Duration::from_millis(500);

const READINESS_SCRIPT: &str = r#"
    (() => {
        const nav = performance.getEntriesByType('navigation')[0] || {};
        return {
            href: location.href,
            readyState: document.readyState,
            resources: performance.getEntriesByType('resource').length,
            status: nav.responseStatus || 0
        };
    })()
"#;

const SCROLL_TO_MIDDLE: &str =
    "window.scrollTo(0, Math.floor(document.documentElement.scrollHeight / 2))";
const SCROLL_TO_TOP: &str = "window.scrollTo(0, 0)";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageState {
    href: String,
    ready_state: String,
    resources: u64,
    status: u16,
}

/// `PageCapture` that launches Chromium for every capture.
pub struct ChromeCapture {
    settings: FetchSettings,
}

impl ChromeCapture {
    pub fn new(settings: FetchSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl PageCapture for ChromeCapture {
    async fn capture(&self, target: &TargetUrl) -> Result<CapturedPage, CaptureError> {
        let browser = ChromeBrowser::launch(&self.settings).await?;
        let result = fetch_page(&browser, target, &self.settings).await;
        browser.shutdown().await;
        result
    }
}

/// A running Chromium process and its CDP event loop.
pub struct ChromeBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
    user_data_dir: PathBuf,
    operation_timeout: Duration,
    viewport: Viewport,
    user_agent: String,
}

impl ChromeBrowser {
    pub async fn launch(settings: &FetchSettings) -> Result<Self, BrowserError> {
        let user_data_dir =
            std::env::temp_dir().join(format!("site-insight-chrome-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&user_data_dir)
            .await
            .map_err(|e| BrowserError::Launch(format!("profile directory: {e}")))?;

        let mut builder = BrowserConfig::builder()
            .request_timeout(settings.operation_timeout)
            .window_size(settings.viewport.width, settings.viewport.height)
            .user_data_dir(&user_data_dir)
            .arg(format!("--user-agent={}", settings.user_agent))
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-extensions")
            .arg("--hide-scrollbars")
            .arg("--mute-audio");
        if let Some(path) = &settings.chromium_path {
            builder = builder.chrome_executable(path);
        }
        let launched = match builder.build() {
            Ok(config) => tokio::time::timeout(settings.operation_timeout, Browser::launch(config))
                .await
                .map_err(|_| BrowserError::Launch("launch timed out".to_string()))
                .and_then(|r| r.map_err(|e| BrowserError::Launch(e.to_string()))),
            Err(e) => Err(BrowserError::Launch(e)),
        };
        let (browser, mut handler) = match launched {
            Ok(pair) => pair,
            Err(e) => {
                remove_profile(&user_data_dir).await;
                return Err(e);
            }
        };

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::trace!(error = %e, "CDP handler error");
                }
            }
        });

        tracing::debug!(user_data_dir = %user_data_dir.display(), "Browser launched");

        Ok(Self {
            browser,
            handler,
            user_data_dir,
            operation_timeout: settings.operation_timeout,
            viewport: settings.viewport,
            user_agent: settings.user_agent.clone(),
        })
    }

    /// Close the browser, wait for the process, and remove its profile.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            tracing::warn!(error = %e, "Failed to close browser cleanly");
        }
        match tokio::time::timeout(self.operation_timeout, self.browser.wait()).await {
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for browser exit"),
            Err(_) => tracing::warn!("Browser did not exit in time"),
            Ok(Ok(_)) => {}
        }
        self.handler.abort();
        remove_profile(&self.user_data_dir).await;
    }

    async fn configure(
        &self,
        session: &ChromeSession,
        settings: &ChromeSessionSettings,
    ) -> Result<(), CdpError> {
        session
            .page
            .execute(SetDeviceMetricsOverrideParams::new(
                settings.width,
                settings.height,
                1.0,
                false,
            ))
            .await?;
        session
            .page
            .execute(SetUserAgentOverrideParams::new(settings.user_agent.clone()))
            .await?;
        if settings.relaxed_tls {
            session
                .page
                .execute(SetIgnoreCertificateErrorsParams::new(true))
                .await?;
        }
        Ok(())
    }
}

struct ChromeSessionSettings {
    width: i64,
    height: i64,
    user_agent: String,
    relaxed_tls: bool,
}

/// A browser context with one page.
pub struct ChromeSession {
    page: Page,
    context_id: BrowserContextId,
    operation_timeout: Duration,
}

#[async_trait]
impl SessionFactory for ChromeBrowser {
    type Session = ChromeSession;

    async fn open(&self, relaxed_tls: bool) -> Result<ChromeSession, BrowserError> {
        let context = self
            .browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| BrowserError::Session(e.to_string()))?;
        let context_id = context.result.browser_context_id.clone();

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(BrowserError::Session)?;

        let page = match self.browser.new_page(target).await {
            Ok(page) => page,
            Err(e) => {
                self.dispose_context(context_id).await;
                return Err(BrowserError::Session(e.to_string()));
            }
        };

        let session = ChromeSession {
            page,
            context_id,
            operation_timeout: self.operation_timeout,
        };
        let settings = ChromeSessionSettings {
            width: i64::from(self.viewport.width),
            height: i64::from(self.viewport.height),
            user_agent: self.user_agent.clone(),
            relaxed_tls,
        };
        if let Err(e) = self.configure(&session, &settings).await {
            self.release(session).await;
            return Err(BrowserError::Session(e.to_string()));
        }

        Ok(session)
    }

    async fn release(&self, session: ChromeSession) {
        let ChromeSession {
            page, context_id, ..
        } = session;
        match tokio::time::timeout(self.operation_timeout, page.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to close page"),
            Err(_) => tracing::warn!("Timed out closing page"),
        }
        self.dispose_context(context_id).await;
    }
}

impl ChromeBrowser {
    async fn dispose_context(&self, context_id: BrowserContextId) {
        let dispose = self
            .browser
            .execute(DisposeBrowserContextParams::new(context_id));
        match tokio::time::timeout(self.operation_timeout, dispose).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to dispose browser context"),
            Err(_) => tracing::warn!("Timed out disposing browser context"),
        }
    }
}

impl ChromeSession {
    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T, NavigationError>
    where
        F: Future<Output = Result<T, CdpError>> + Send,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(cdp_failure(e)),
            Err(_) => Err(NavigationError::Timeout(format!(
                "{what} exceeded {:?}",
                self.operation_timeout
            ))),
        }
    }

    async fn state(&self) -> Result<PageState, CdpError> {
        let result = self.page.evaluate(READINESS_SCRIPT).await?;
        result.into_value::<PageState>().map_err(CdpError::Serde)
    }

    async fn evaluate(&self, script: &str) -> Result<(), NavigationError> {
        self.bounded("script", async {
            self.page.evaluate(script).await?;
            Ok::<(), CdpError>(())
        })
        .await
    }

    /// Poll until `wait` holds. Unbounded; the caller applies the timeout.
    async fn wait_for(&self, wait: WaitUntil) -> Result<PageState, NavigationError> {
        let mut last_count: Option<u64> = None;
        let mut quiet_since = Instant::now();

        loop {
            match self.state().await {
                Ok(state) if state.href != "about:blank" => {
                    let ready = match wait {
                        WaitUntil::DomContentLoaded => state.ready_state != "loading",
                        WaitUntil::Load => state.ready_state == "complete",
                        WaitUntil::NetworkIdle => {
                            if last_count != Some(state.resources) {
                                last_count = Some(state.resources);
                                quiet_since = Instant::now();
                            }
                            state.ready_state == "complete"
                                && quiet_since.elapsed() >= IDLE_QUIET_PERIOD
                        }
                    };
                    if ready {
                        return Ok(state);
                    }
                }
                Ok(_) => {}
                // The execution context is torn down while a navigation commits.
                Err(e) => tracing::trace!(error = %e, "Readiness check failed, retrying"),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Session for ChromeSession {
    async fn navigate(&self, url: &str, wait: WaitUntil) -> Result<(), NavigationError> {
        let response = self
            .page
            .execute(NavigateParams::new(url.to_string()))
            .await
            .map_err(cdp_failure)?;
        if let Some(error_text) = &response.result.error_text {
            return Err(NavigationError::classify(error_text));
        }

        let state = self.wait_for(wait).await?;
        if matches!(state.status, 401 | 407) {
            return Err(NavigationError::AuthRequired(format!(
                "HTTP {} from {}",
                state.status, state.href
            )));
        }
        Ok(())
    }

    async fn capture(&self, settings: &FetchSettings) -> Result<(String, Vec<u8>), NavigationError> {
        tokio::time::sleep(settings.settle_delay).await;

        self.evaluate(SCROLL_TO_MIDDLE).await?;
        tokio::time::sleep(settings.scroll_pause).await;
        self.evaluate(SCROLL_TO_TOP).await?;
        tokio::time::sleep(settings.scroll_pause).await;

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Jpeg)
            .quality(settings.jpeg_quality)
            .full_page(true)
            .build();
        let screenshot = self.bounded("screenshot", self.page.screenshot(params)).await?;

        let final_url = self
            .bounded("url", self.page.url())
            .await?
            .unwrap_or_default();

        Ok((final_url, screenshot))
    }
}

async fn remove_profile(dir: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        tracing::debug!(error = %e, "Could not remove browser profile");
    }
}

fn cdp_failure(err: CdpError) -> NavigationError {
    match err {
        CdpError::Timeout => NavigationError::Timeout("CDP request timed out".to_string()),
        other => NavigationError::classify(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdp_timeout_is_timeout() {
        assert!(matches!(
            cdp_failure(CdpError::Timeout),
            NavigationError::Timeout(_)
        ));
    }

    #[test]
    fn test_page_state_shape() {
        let state: PageState = serde_json::from_value(serde_json::json!({
            "href": "https://example.com/",
            "readyState": "complete",
            "resources": 3,
            "status": 401
        }))
        .unwrap();
        assert_eq!(state.ready_state, "complete");
        assert_eq!(state.status, 401);
    }

    #[tokio::test]
    #[ignore] // Requires a local Chrome/Chromium and network access
    async fn test_capture_example_com() {
        let capture = ChromeCapture::new(FetchSettings::default());
        let target = TargetUrl::parse("https://example.com").unwrap();

        let page = capture.capture(&target).await.unwrap();

        assert!(page.final_url.starts_with("https://example.com"));
        // JPEG start-of-image marker
        assert_eq!(&page.screenshot[..2], &[0xFF, 0xD8]);
    }
}
