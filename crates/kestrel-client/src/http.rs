use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kestrel_core::error::AppError;
use kestrel_core::routine::RoutineError;
use kestrel_core::session::{Session, SessionProvider};
use reqwest::{Client, Response};
use url::Url;
use uuid::Uuid;

pub const DEFAULT_USER_AGENT: &str = "Kestrel/0.1 (scraper orchestrator)";

/// Error kinds reported by [`HttpSession`].
pub mod kinds {
    pub const TIMEOUT: &str = "Timeout";
    pub const NETWORK: &str = "Network";
    pub const HTTP: &str = "Http";
    pub const BLOCKED: &str = "Blocked";
}

/// Per-run HTTP handle. Routines get it with
/// `ctx.session.downcast_ref::<HttpSession>()`.
#[derive(Clone)]
pub struct HttpSession {
    client: Client,
    timeout_secs: u64,
    ssrf_protection: bool,
}

impl HttpSession {
    /// GET `url` and return the body as text. Non-2xx statuses are errors.
    pub async fn get_text(&self, url: &str) -> Result<String, RoutineError> {
        self.get(url)
            .await?
            .text()
            .await
            .map_err(|e| RoutineError::new(kinds::HTTP, format!("Failed to read response body: {e}")))
    }

    /// GET `url` and decode the body as JSON.
    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value, RoutineError> {
        self.get(url)
            .await?
            .json()
            .await
            .map_err(|e| RoutineError::new(kinds::HTTP, format!("Invalid JSON from {url}: {e}")))
    }

    async fn get(&self, url: &str) -> Result<Response, RoutineError> {
        if self.ssrf_protection {
            check_url(url).await?;
        }

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                RoutineError::new(
                    kinds::TIMEOUT,
                    format!("{url} did not respond within {}s", self.timeout_secs),
                )
            } else if e.is_connect() {
                RoutineError::new(kinds::NETWORK, format!("Connection failed: {e}"))
            } else {
                RoutineError::new(kinds::HTTP, e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RoutineError::new(
                kinds::HTTP,
                format!("HTTP {} for {}", status.as_u16(), url),
            ));
        }
        Ok(response)
    }
}

/// Hands every run an [`HttpSession`] sharing one connection pool.
///
/// Requests to private/reserved addresses are refused unless
/// [`allow_private_urls`](Self::allow_private_urls) is set.
#[derive(Clone)]
pub struct HttpSessionProvider {
    client: Client,
    timeout_secs: u64,
    ssrf_protection: bool,
    open: Arc<AtomicUsize>,
}

impl HttpSessionProvider {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::SessionError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
            ssrf_protection: true,
            open: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Allow requests to private/reserved IPs (local development, tests).
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    /// Sessions acquired and not yet released.
    pub fn open_sessions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl SessionProvider for HttpSessionProvider {
    async fn acquire(&self, scraper_name: &str, run_id: Uuid) -> Result<Session, AppError> {
        self.open.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(%run_id, scraper = %scraper_name, "HTTP session acquired");
        Ok(Session::new(HttpSession {
            client: self.client.clone(),
            timeout_secs: self.timeout_secs,
            ssrf_protection: self.ssrf_protection,
        }))
    }

    async fn release(&self, session: Session) -> Result<(), AppError> {
        if session.downcast_ref::<HttpSession>().is_none() {
            return Err(AppError::ResourceRelease(
                "session was not issued by the HTTP provider".into(),
            ));
        }
        let _ = self
            .open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Refuse non-http(s) URLs and hosts resolving to private/reserved addresses.
async fn check_url(url: &str) -> Result<(), RoutineError> {
    let blocked = |msg: String| RoutineError::new(kinds::BLOCKED, msg);

    let parsed = Url::parse(url).map_err(|e| blocked(format!("Invalid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(blocked(format!(
            "URL scheme '{}' is not allowed (only http/https)",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| blocked("URL has no host".to_string()))?;

    let literal = host.trim_start_matches('[').trim_end_matches(']');
    let addresses: Vec<IpAddr> = match literal.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => {
            let port = parsed.port_or_known_default().unwrap_or(80);
            tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| {
                    RoutineError::new(kinds::NETWORK, format!("DNS resolution failed for {host}: {e}"))
                })?
                .map(|addr| addr.ip())
                .collect()
        }
    };

    if addresses.is_empty() {
        return Err(RoutineError::new(
            kinds::NETWORK,
            format!("DNS resolution returned no addresses for {host}"),
        ));
    }
    if let Some(ip) = addresses.into_iter().find(|ip| is_private_ip(*ip)) {
        return Err(blocked(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {ip}"
        )));
    }
    Ok(())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                // 100.64.0.0/10 carrier-grade NAT
                || (a == 100 && (b & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xFFC0) == 0xFE80
                || (first & 0xFE00) == 0xFC00
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}
