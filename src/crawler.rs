use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::config::{Config, FetchStrategy, RetryPolicy};
use crate::error::{FetchError, TransportError};

static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:124.0) Gecko/20100101 Firefox/124.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edge/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
    ]
});

const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

/// Headers sent with one fetch attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeaders {
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
}

impl RequestHeaders {
    /// Fresh headers with a user agent drawn at random from the pool.
    pub fn randomized() -> Self {
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(FALLBACK_USER_AGENT);
        Self {
            user_agent: user_agent.to_string(),
            accept: ACCEPT.to_string(),
            accept_language: ACCEPT_LANGUAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub body: String,
}

/// One way of turning a url into page markup. Makes a single attempt.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get(&self, url: &str, headers: &RequestHeaders) -> Result<PageResponse, TransportError>;
}

pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn get(&self, url: &str, headers: &RequestHeaders) -> Result<PageResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, &headers.user_agent)
            .header(reqwest::header::ACCEPT, &headers.accept)
            .header(reqwest::header::ACCEPT_LANGUAGE, &headers.accept_language)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        debug!(url, status, bytes = body.len(), "Fetched page");
        Ok(PageResponse { status, body })
    }
}

/// Renders the page in headless Chrome so the state script is present even
/// when the plain HTML response is a bot challenge.
pub struct ChromePageFetcher {
    timeout: Duration,
}

impl ChromePageFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PageFetcher for ChromePageFetcher {
    async fn get(&self, url: &str, headers: &RequestHeaders) -> Result<PageResponse, TransportError> {
        let url = url.to_string();
        let user_agent = headers.user_agent.clone();
        let accept_language = headers.accept_language.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || render_page(&url, &user_agent, &accept_language, timeout))
            .await
            .map_err(|e| TransportError::Browser(e.to_string()))?
    }
}

fn render_page(
    url: &str,
    user_agent: &str,
    accept_language: &str,
    timeout: Duration,
) -> Result<PageResponse, TransportError> {
    let ua_arg = format!("--user-agent={}", user_agent);
    let args = vec![
        std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
        std::ffi::OsStr::new("--no-sandbox"),
        std::ffi::OsStr::new("--disable-dev-shm-usage"),
        std::ffi::OsStr::new("--disable-infobars"),
        std::ffi::OsStr::new(&ua_arg),
    ];

    let browser = Browser::new(LaunchOptions {
        headless: true,
        window_size: Some((1920, 1080)),
        args,
        ..Default::default()
    })
    .map_err(|e| TransportError::Browser(e.to_string()))?;

    let tab = browser
        .new_tab()
        .map_err(|e| TransportError::Browser(e.to_string()))?;
    tab.set_default_timeout(timeout);
    tab.set_user_agent(user_agent, Some(accept_language), None)
        .map_err(|e| TransportError::Browser(e.to_string()))?;

    tab.navigate_to(url)
        .and_then(|t| t.wait_until_navigated())
        .map_err(|e| {
            let message = e.to_string();
            if message.to_lowercase().contains("timeout") {
                TransportError::Timeout
            } else {
                TransportError::Browser(message)
            }
        })?;

    let body = tab
        .get_content()
        .map_err(|e| TransportError::Browser(e.to_string()))?;
    Ok(PageResponse { status: 200, body })
}

/// Waits between fetch attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Retrying front of a [`PageFetcher`]. Every attempt gets new headers.
pub struct Fetcher {
    page: Arc<dyn PageFetcher>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl Fetcher {
    pub fn new(page: Arc<dyn PageFetcher>, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            page,
            policy,
            sleeper,
        }
    }

    /// Picks the page strategy named in the config.
    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        let page: Arc<dyn PageFetcher> = match config.fetch_strategy {
            FetchStrategy::Http => Arc::new(HttpPageFetcher::new(config.request_timeout)?),
            FetchStrategy::Chrome => Arc::new(ChromePageFetcher::new(config.request_timeout)),
        };
        Ok(Self::new(page, config.retry.clone(), Arc::new(TokioSleeper)))
    }

    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let attempts = self.policy.attempts.max(1);
        let mut last = TransportError::Network("no attempt made".to_string());

        for attempt in 1..=attempts {
            let headers = RequestHeaders::randomized();
            debug!(attempt, user_agent = %headers.user_agent, "Fetch attempt");

            match self.page.get(url, &headers).await {
                Ok(resp) if (200..300).contains(&resp.status) => {
                    info!(url, attempt, bytes = resp.body.len(), "Page fetched");
                    return Ok(resp.body);
                }
                Ok(resp) => {
                    warn!(url, attempt, attempts, status = resp.status, "Non-success status");
                    last = TransportError::Status(resp.status);
                }
                Err(e) => {
                    warn!(url, attempt, attempts, error = %e, "Request failed");
                    last = e;
                }
            }

            if attempt < attempts {
                let delay = self.policy.delay_for(attempt);
                debug!(?delay, "Waiting before retry");
                self.sleeper.sleep(delay).await;
            }
        }

        Err(FetchError {
            url: url.to_string(),
            attempts,
            last,
        })
    }
}
