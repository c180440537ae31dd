use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use kestrel_core::error::AppError;
use kestrel_core::routine::RoutineError;
use kestrel_core::session::{Session, SessionProvider};
use uuid::Uuid;

use crate::http::kinds;

/// One browser tab owned by a run.
///
/// The tab is opened on acquire and closed on release, so a routine only
/// ever sees its own page.
#[derive(Clone)]
pub struct BrowserSession {
    page: Page,
    timeout: Duration,
}

impl BrowserSession {
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Navigate the tab to `url` and return the rendered DOM.
    pub async fn render(&self, url: &str) -> Result<String, RoutineError> {
        let work = async {
            self.page.goto(url).await.map_err(|e| {
                RoutineError::new(kinds::NETWORK, format!("Failed to navigate to {url}: {e}"))
            })?;
            self.page.find_element("body").await.map_err(|e| {
                RoutineError::new(kinds::HTTP, format!("Page did not render body: {e}"))
            })?;
            self.page.content().await.map_err(|e| {
                RoutineError::new(kinds::HTTP, format!("Failed to read page content: {e}"))
            })
        };

        tokio::time::timeout(self.timeout, work)
            .await
            .unwrap_or_else(|_| {
                Err(RoutineError::new(
                    kinds::TIMEOUT,
                    format!("{url} did not render within {}s", self.timeout.as_secs()),
                ))
            })
    }
}

/// Headless Chromium shared by all runs; each run gets its own tab.
///
/// Requires a Chromium / Chrome binary reachable via `$PATH`, `CHROME_BIN`
/// or one of the well-known install locations.
#[derive(Clone)]
pub struct BrowserSessionProvider {
    browser: Arc<Browser>,
    timeout: Duration,
}

impl BrowserSessionProvider {
    /// Launch Chromium with a 30 s navigation timeout.
    pub async fn launch() -> Result<Self, AppError> {
        Self::launch_with_timeout(Duration::from_secs(30)).await
    }

    pub async fn launch_with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();
        if let Some(bin) = find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::SessionError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::SessionError(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled for the connection to make progress.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            timeout,
        })
    }
}

impl SessionProvider for BrowserSessionProvider {
    async fn acquire(&self, scraper_name: &str, run_id: Uuid) -> Result<Session, AppError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::SessionError(format!("Failed to open tab: {e}")))?;
        tracing::debug!(%run_id, scraper = %scraper_name, "Browser tab opened");
        Ok(Session::new(BrowserSession {
            page,
            timeout: self.timeout,
        }))
    }

    async fn release(&self, session: Session) -> Result<(), AppError> {
        let page = session
            .downcast_ref::<BrowserSession>()
            .map(|s| s.page.clone())
            .ok_or_else(|| {
                AppError::ResourceRelease("session was not issued by the browser provider".into())
            })?;
        page.close()
            .await
            .map_err(|e| AppError::ResourceRelease(format!("Failed to close tab: {e}")))
    }
}

/// Locate a real Chrome/Chromium binary.
///
/// The snap wrapper at `/snap/bin/chromium` drops unknown flags and breaks
/// headless mode, so the binary inside the snap is preferred. `None` leaves
/// the lookup to `chromiumoxide`.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}
