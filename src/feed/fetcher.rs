use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedMutexGuard};

use super::normalize::{normalize, FeedMeta, ParseError, RawItem};
use crate::store::{FeedId, FeedSource};
use crate::util::{validate_url, HostPolicy, UrlValidationError};

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 6;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_MAX_FEED_BYTES: usize = 10 * 1024 * 1024; // 10MB
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_USER_AGENT: &str = concat!("feedmill/", env!("CARGO_PKG_VERSION"));

/// Redirect hops followed before a fetch fails.
const MAX_REDIRECTS: usize = 5;

/// Knobs for the [`Fetcher`]. Build one directly or via `Config::fetch_config`.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Maximum number of feeds fetched at the same time.
    pub concurrency_limit: usize,
    /// Upper bound for one feed's whole fetch, retries included.
    pub timeout: Duration,
    /// Response bodies larger than this fail with [`FetchError::ResponseTooLarge`].
    pub max_body_bytes: usize,
    /// Extra attempts after a 429 or 5xx response.
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry.
    pub retry_base_delay: Duration,
    pub host_policy: HostPolicy,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            timeout: DEFAULT_FETCH_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_FEED_BYTES,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            host_policy: HostPolicy::PublicOnly,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Invalid [`FetchConfig`] values. These are programmer errors and are
/// reported when the [`Fetcher`] is built, never during a refresh.
#[derive(Debug, Error)]
pub enum FetchConfigError {
    #[error("concurrency limit must be at least 1")]
    ZeroConcurrency,
    #[error("fetch timeout must be greater than zero")]
    ZeroTimeout,
    #[error("maximum feed size must be greater than zero")]
    ZeroBodyLimit,
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl FetchConfig {
    pub fn validate(&self) -> Result<(), FetchConfigError> {
        if self.concurrency_limit == 0 {
            return Err(FetchConfigError::ZeroConcurrency);
        }
        if self.timeout.is_zero() {
            return Err(FetchConfigError::ZeroTimeout);
        }
        if self.max_body_bytes == 0 {
            return Err(FetchConfigError::ZeroBodyLimit);
        }
        Ok(())
    }
}

/// Errors that can occur while fetching one feed.
///
/// All of them are scoped to that feed: a refresh over many feeds reports
/// them per feed and carries on.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection refused, TLS, reset)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// The fetch did not finish within the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Body is not well-formed XML or not a recognized feed format
    #[error("Parse error: {0}")]
    Parse(String),
    /// Recognized format with a required element missing
    #[error("Unsupported feed: {0}")]
    UnsupportedFeedElement(String),
    /// URL failed validation before any request was made
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),
    /// Response body exceeded the configured size limit
    #[error("Response too large")]
    ResponseTooLarge,
}

impl From<ParseError> for FetchError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::MissingElement(_) => FetchError::UnsupportedFeedElement(err.to_string()),
            ParseError::Malformed(_) | ParseError::UnknownFormat => {
                FetchError::Parse(err.to_string())
            }
        }
    }
}

/// Serializable classification of a [`FetchError`], used for status
/// indicators and the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    HttpStatus,
    Parse,
    UnsupportedFeedElement,
    InvalidUrl,
    ResponseTooLarge,
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Network(_) => ErrorKind::Network,
            FetchError::Timeout => ErrorKind::Timeout,
            FetchError::HttpStatus(_) => ErrorKind::HttpStatus,
            FetchError::Parse(_) => ErrorKind::Parse,
            FetchError::UnsupportedFeedElement(_) => ErrorKind::UnsupportedFeedElement,
            FetchError::InvalidUrl(_) => ErrorKind::InvalidUrl,
            FetchError::ResponseTooLarge => ErrorKind::ResponseTooLarge,
        }
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    Success { meta: FeedMeta, items: Vec<RawItem> },
    Failure(FetchError),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            FetchOutcome::Success { .. } => None,
            FetchOutcome::Failure(e) => Some(e),
        }
    }
}

impl From<Result<(FeedMeta, Vec<RawItem>), FetchError>> for FetchOutcome {
    fn from(result: Result<(FeedMeta, Vec<RawItem>), FetchError>) -> Self {
        match result {
            Ok((meta, items)) => FetchOutcome::Success { meta, items },
            Err(e) => FetchOutcome::Failure(e),
        }
    }
}

/// Result of a single feed fetch, correlated by feed id.
#[derive(Debug)]
pub struct FetchResult {
    pub feed_id: FeedId,
    pub outcome: FetchOutcome,
}

/// Concurrent, time-bounded feed fetcher.
///
/// Cheap to share behind an `Arc`; the underlying `reqwest::Client` pools
/// connections across feeds.
pub struct Fetcher {
    client: reqwest::Client,
    config: FetchConfig,
    /// One async mutex per feed: at most one fetch of a feed is in flight.
    in_flight: Mutex<HashMap<FeedId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Fetcher {
    /// Validates `config` and builds a client with its user agent and a
    /// redirect policy enforcing `config.host_policy` on every hop.
    pub fn new(config: FetchConfig) -> Result<Self, FetchConfigError> {
        config.validate()?;
        let client = client_builder(&config).build()?;
        Self::with_client(client, config)
    }

    /// Uses a caller-configured client (proxies, custom TLS roots).
    ///
    /// The host policy is only checked on the initial URL unless the client
    /// also carries a redirect policy that enforces it.
    pub fn with_client(
        client: reqwest::Client,
        config: FetchConfig,
    ) -> Result<Self, FetchConfigError> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetches and parses every source with at most `concurrency_limit`
    /// requests in flight.
    ///
    /// # Behavior
    ///
    /// - Feeds beyond the limit queue until a slot frees up
    /// - A failing or slow feed never delays or cancels the others
    /// - Two entries for the same feed id are fetched one after the other
    /// - Progress is reported as `(completed, total)` when a channel is given
    ///
    /// Results come back in completion order, not input order.
    ///
    /// Dropping the returned future (e.g. via `futures::future::abortable`)
    /// abandons queued and in-flight requests.
    pub async fn refresh(
        &self,
        sources: &[FeedSource],
        progress_tx: Option<mpsc::Sender<(usize, usize)>>,
    ) -> Vec<FetchResult> {
        if sources.is_empty() {
            return Vec::new();
        }

        let total = sources.len();
        let completed = AtomicUsize::new(0);

        stream::iter(sources)
            .map(|source| {
                let completed = &completed;
                let progress_tx = progress_tx.clone();
                async move {
                    let result = self.fetch_one(source).await;
                    let done = completed.fetch_add(1, Ordering::Relaxed).saturating_add(1);
                    if let Some(tx) = progress_tx {
                        if let Err(e) = tx.send((done, total)).await {
                            tracing::debug!(error = %e, done, total, "Progress receiver dropped");
                        }
                    }
                    result
                }
            })
            .buffer_unordered(self.config.concurrency_limit)
            .collect()
            .await
    }

    /// Fetches one feed while holding its per-feed lock.
    pub async fn fetch_one(&self, source: &FeedSource) -> FetchResult {
        let _guard = self.lock_feed(source.id).await;
        FetchResult {
            feed_id: source.id,
            outcome: self.fetch_source(source).await,
        }
    }

    /// Waits until no other fetch of `feed_id` is in flight.
    ///
    /// Idle entries of other feeds are pruned on the way. An entry only the
    /// map refers to has no holder and no waiter, so dropping it cannot
    /// break serialization.
    pub(crate) async fn lock_feed(&self, feed_id: FeedId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            map.retain(|id, lock| *id == feed_id || Arc::strong_count(lock) > 1);
            Arc::clone(map.entry(feed_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Fetch without taking the per-feed lock; callers hold it.
    pub(crate) async fn fetch_source(&self, source: &FeedSource) -> FetchOutcome {
        let outcome: FetchOutcome = self.fetch_url(&source.url).await.into();
        match &outcome {
            FetchOutcome::Success { items, .. } => {
                tracing::debug!(feed_id = %source.id, url = %source.url, items = items.len(), "Feed fetched");
            }
            FetchOutcome::Failure(e) => {
                tracing::warn!(feed_id = %source.id, url = %source.url, error = %e, "Feed fetch failed");
            }
        }
        outcome
    }

    /// Fetches and normalizes a single URL, bounded by the configured timeout.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] - URL rejected by the host policy
    /// - [`FetchError::Timeout`] - whole fetch (retries included) exceeded the timeout
    /// - [`FetchError::HttpStatus`] - non-2xx response (after retries for 429/5xx)
    /// - [`FetchError::Network`] - connection or TLS errors
    /// - [`FetchError::ResponseTooLarge`] - body exceeded `max_body_bytes`
    /// - [`FetchError::Parse`] / [`FetchError::UnsupportedFeedElement`] - unusable document
    pub async fn fetch_url(&self, url: &str) -> Result<(FeedMeta, Vec<RawItem>), FetchError> {
        let validated = validate_url(url, self.config.host_policy)
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        let bytes = tokio::time::timeout(self.config.timeout, self.download(validated.as_str()))
            .await
            .map_err(|_| FetchError::Timeout)??;

        Ok(normalize(&bytes, url)?)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut retry_count = 0;

        loop {
            let response = self.client.get(url).send().await.map_err(request_error)?;
            let status = response.status();

            // EDGE-004: 429 and 5xx are worth another try with exponential backoff
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if retry_count >= self.config.max_retries {
                    return Err(FetchError::HttpStatus(status.as_u16()));
                }
                let delay = self.config.retry_base_delay * 2u32.saturating_pow(retry_count);
                tracing::warn!(
                    url = %url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying feed after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // 4xx and anything else non-2xx fails immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            return read_limited_bytes(response, self.config.max_body_bytes).await;
        }
    }
}

// ============================================================================
// HTTP Client Configuration
// ============================================================================

fn client_builder(config: &FetchConfig) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .redirect(redirect_policy(config.host_policy))
}

/// SEC-001: Redirect policy with loop detection and limited hops.
///
/// Every hop is validated against `host_policy`, so a public feed cannot
/// bounce the fetcher onto localhost or a private network.
fn redirect_policy(host_policy: HostPolicy) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(format!("Too many redirects (max {MAX_REDIRECTS})"));
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        if let Err(e) = validate_url(url.as_str(), host_policy) {
            tracing::warn!(to = %url, error = %e, "Refusing redirect");
            return attempt.error(e);
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    })
}

/// A redirect refused by the host policy is an invalid URL, not a network
/// failure.
fn request_error(err: reqwest::Error) -> FetchError {
    let mut source = std::error::Error::source(&err);
    while let Some(inner) = source {
        if let Some(rejected) = inner.downcast_ref::<UrlValidationError>() {
            return FetchError::InvalidUrl(format!("redirect target rejected: {rejected}"));
        }
        source = inner.source();
    }
    FetchError::Network(err)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ListId;
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Mock</title>
    <item><guid>1</guid><title>Test</title></item>
</channel></rss>"#;

    fn test_config() -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(5),
            max_retries: 0,
            retry_base_delay: Duration::from_millis(10),
            host_policy: HostPolicy::AllowPrivate,
            ..FetchConfig::default()
        }
    }

    fn source(id: i64, url: String) -> FeedSource {
        FeedSource::new(FeedId(id), url, String::new(), ListId::DEFAULT)
    }

    async fn mount(server: &MockServer, at: &str, template: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(template)
            .mount(server)
            .await;
    }

    #[test]
    fn test_zero_concurrency_rejected_at_construction() {
        let config = FetchConfig {
            concurrency_limit: 0,
            ..FetchConfig::default()
        };
        assert!(matches!(
            Fetcher::new(config),
            Err(FetchConfigError::ZeroConcurrency)
        ));
    }

    #[test]
    fn test_zero_timeout_rejected_at_construction() {
        let config = FetchConfig {
            timeout: Duration::ZERO,
            ..FetchConfig::default()
        };
        assert!(matches!(
            Fetcher::new(config),
            Err(FetchConfigError::ZeroTimeout)
        ));
    }

    #[test]
    fn test_parse_error_mapping() {
        assert_eq!(
            FetchError::from(ParseError::UnknownFormat).kind(),
            ErrorKind::Parse
        );
        assert_eq!(
            FetchError::from(ParseError::MissingElement("channel")).kind(),
            ErrorKind::UnsupportedFeedElement
        );
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(200)
                .set_body_string(VALID_RSS)
                .insert_header("Content-Type", "application/xml"),
        )
        .await;

        let fetcher = Fetcher::new(test_config()).unwrap();
        let result = fetcher
            .fetch_one(&source(1, format!("{}/feed", server.uri())))
            .await;

        match result.outcome {
            FetchOutcome::Success { meta, items } => {
                assert_eq!(meta.title, "Mock");
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].guid.as_deref(), Some("1"));
            }
            FetchOutcome::Failure(e) => panic!("Expected success, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_fetch_404_error() {
        let server = MockServer::start().await;
        mount(&server, "/feed", ResponseTemplate::new(404)).await;

        let fetcher = Fetcher::new(test_config()).unwrap();
        let result = fetcher
            .fetch_one(&source(1, format!("{}/feed", server.uri())))
            .await;
        match result.outcome {
            FetchOutcome::Failure(FetchError::HttpStatus(404)) => {}
            other => panic!("Expected HttpStatus(404), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_500_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3) // Initial request + 2 retries
            .mount(&server)
            .await;

        let config = FetchConfig {
            max_retries: 2,
            ..test_config()
        };
        let fetcher = Fetcher::new(config).unwrap();
        let result = fetcher.fetch_url(&format!("{}/feed", server.uri())).await;
        assert!(matches!(result, Err(FetchError::HttpStatus(500))));
    }

    #[tokio::test]
    async fn test_503_retry_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount(&server, "/feed", ResponseTemplate::new(200).set_body_string(VALID_RSS)).await;

        let config = FetchConfig {
            max_retries: 1,
            ..test_config()
        };
        let fetcher = Fetcher::new(config).unwrap();
        let (_, items) = fetcher
            .fetch_url(&format!("{}/feed", server.uri()))
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_feed_parse_error() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(200).set_body_string("<not valid xml"),
        )
        .await;

        let fetcher = Fetcher::new(test_config()).unwrap();
        let result = fetcher.fetch_url(&format!("{}/feed", server.uri())).await;
        assert!(matches!(result, Err(FetchError::Parse(_))));
    }

    #[tokio::test]
    async fn test_rss_without_channel_is_unsupported() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(200).set_body_string("<rss version=\"2.0\"></rss>"),
        )
        .await;

        let fetcher = Fetcher::new(test_config()).unwrap();
        let result = fetcher.fetch_url(&format!("{}/feed", server.uri())).await;
        assert!(matches!(result, Err(FetchError::UnsupportedFeedElement(_))));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(200).set_body_string("x".repeat(2048)),
        )
        .await;

        let config = FetchConfig {
            max_body_bytes: 1024,
            ..test_config()
        };
        let fetcher = Fetcher::new(config).unwrap();
        let result = fetcher.fetch_url(&format!("{}/feed", server.uri())).await;
        assert!(matches!(result, Err(FetchError::ResponseTooLarge)));
    }

    #[tokio::test]
    async fn test_private_host_rejected_by_default_policy() {
        let server = MockServer::start().await;
        mount(&server, "/feed", ResponseTemplate::new(200).set_body_string(VALID_RSS)).await;

        let config = FetchConfig {
            host_policy: HostPolicy::PublicOnly,
            ..test_config()
        };
        let fetcher = Fetcher::new(config).unwrap();
        let result = fetcher.fetch_url(&format!("{}/feed", server.uri())).await;
        assert!(matches!(result, Err(FetchError::InvalidUrl(_))));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    /// Fetcher whose client resolves `feeds.test` to the mock server, so the
    /// initial URL passes the public-only host policy.
    fn public_fetcher(server: &MockServer, host_policy: HostPolicy) -> Fetcher {
        let config = FetchConfig {
            host_policy,
            ..test_config()
        };
        let client = client_builder(&config)
            .resolve("feeds.test", *server.address())
            .build()
            .unwrap();
        Fetcher::with_client(client, config).unwrap()
    }

    async fn mount_redirect(server: &MockServer, at: &str, to: String) {
        mount(
            server,
            at,
            ResponseTemplate::new(302).insert_header("Location", to.as_str()),
        )
        .await;
    }

    #[tokio::test]
    async fn test_redirect_to_loopback_rejected() {
        let server = MockServer::start().await;
        let port = server.address().port();
        mount_redirect(&server, "/hop", format!("http://127.0.0.1:{port}/internal")).await;
        mount(&server, "/internal", ResponseTemplate::new(200).set_body_string(VALID_RSS)).await;

        let fetcher = public_fetcher(&server, HostPolicy::PublicOnly);
        let result = fetcher
            .fetch_url(&format!("http://feeds.test:{port}/hop"))
            .await;

        assert!(matches!(result, Err(FetchError::InvalidUrl(_))), "{:?}", result);
        let paths: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.url.path().to_string())
            .collect();
        assert_eq!(paths, vec!["/hop"]);
    }

    #[tokio::test]
    async fn test_redirect_within_policy_followed() {
        let server = MockServer::start().await;
        let port = server.address().port();
        mount_redirect(&server, "/old", format!("http://feeds.test:{port}/new")).await;
        mount(&server, "/new", ResponseTemplate::new(200).set_body_string(VALID_RSS)).await;

        let fetcher = public_fetcher(&server, HostPolicy::PublicOnly);
        let (meta, _) = fetcher
            .fetch_url(&format!("http://feeds.test:{port}/old"))
            .await
            .unwrap();
        assert_eq!(meta.title, "Mock");
    }

    #[tokio::test]
    async fn test_redirect_loop_fails() {
        let server = MockServer::start().await;
        let port = server.address().port();
        mount_redirect(&server, "/a", format!("http://feeds.test:{port}/b")).await;
        mount_redirect(&server, "/b", format!("http://feeds.test:{port}/a")).await;

        let fetcher = public_fetcher(&server, HostPolicy::PublicOnly);
        let result = fetcher.fetch_url(&format!("http://feeds.test:{port}/a")).await;
        assert!(matches!(result, Err(FetchError::Network(_))), "{:?}", result);
    }

    #[tokio::test]
    async fn test_idle_feed_locks_are_pruned() {
        let server = MockServer::start().await;
        mount(&server, "/feed", ResponseTemplate::new(200).set_body_string(VALID_RSS)).await;

        let fetcher = Fetcher::new(test_config()).unwrap();
        for id in 1..=3 {
            fetcher
                .fetch_one(&source(id, format!("{}/feed", server.uri())))
                .await;
        }
        let held: Vec<FeedId> = fetcher.in_flight.lock().unwrap().keys().copied().collect();
        assert_eq!(held, vec![FeedId(3)]);
    }

    #[tokio::test]
    async fn test_slow_feed_times_out() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/slow",
            ResponseTemplate::new(200)
                .set_body_string(VALID_RSS)
                .set_delay(Duration::from_secs(3)),
        )
        .await;

        let config = FetchConfig {
            timeout: Duration::from_millis(200),
            ..test_config()
        };
        let fetcher = Fetcher::new(config).unwrap();
        let result = fetcher.fetch_url(&format!("{}/slow", server.uri())).await;
        assert!(matches!(result, Err(FetchError::Timeout)));
    }

    #[tokio::test]
    async fn test_refresh_isolates_failures() {
        let server = MockServer::start().await;
        for i in [1, 2, 4, 5] {
            mount(
                &server,
                &format!("/{i}"),
                ResponseTemplate::new(200).set_body_string(VALID_RSS),
            )
            .await;
        }
        mount(&server, "/3", ResponseTemplate::new(500)).await;

        let sources: Vec<_> = (1..=5)
            .map(|i| source(i, format!("{}/{i}", server.uri())))
            .collect();
        let fetcher = Fetcher::new(test_config()).unwrap();
        let mut results = fetcher.refresh(&sources, None).await;
        results.sort_by_key(|r| r.feed_id);

        assert_eq!(results.len(), 5);
        for r in &results {
            if r.feed_id == FeedId(3) {
                assert!(matches!(
                    r.outcome,
                    FetchOutcome::Failure(FetchError::HttpStatus(500))
                ));
            } else {
                assert!(r.outcome.is_success(), "feed {} failed", r.feed_id);
            }
        }
    }

    #[tokio::test]
    async fn test_slow_feed_does_not_delay_others() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/slow",
            ResponseTemplate::new(200)
                .set_body_string(VALID_RSS)
                .set_delay(Duration::from_secs(10)),
        )
        .await;
        mount(&server, "/fast", ResponseTemplate::new(200).set_body_string(VALID_RSS)).await;

        let mut sources = vec![source(1, format!("{}/slow", server.uri()))];
        sources.extend((2..=6).map(|i| source(i, format!("{}/fast", server.uri()))));

        let config = FetchConfig {
            concurrency_limit: 2,
            timeout: Duration::from_millis(750),
            ..test_config()
        };
        let fetcher = Fetcher::new(config).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let started = Instant::now();
        let results = fetcher.refresh(&sources, Some(tx)).await;
        let elapsed = started.elapsed();

        assert_eq!(results.len(), 6);
        assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
        // The slow feed finishes last; everything else completed while it hung
        let last = results.last().unwrap();
        assert_eq!(last.feed_id, FeedId(1));
        assert!(matches!(last.outcome, FetchOutcome::Failure(FetchError::Timeout)));

        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p);
        }
        assert_eq!(seen.last(), Some(&(6, 6)));
    }

    #[tokio::test]
    async fn test_same_feed_fetches_are_serialized() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/feed",
            ResponseTemplate::new(200)
                .set_body_string(VALID_RSS)
                .set_delay(Duration::from_millis(300)),
        )
        .await;

        let feed = source(1, format!("{}/feed", server.uri()));
        let fetcher = Fetcher::new(test_config()).unwrap();

        let started = Instant::now();
        let (a, b) = tokio::join!(fetcher.fetch_one(&feed), fetcher.fetch_one(&feed));
        assert!(a.outcome.is_success() && b.outcome.is_success());
        // Two overlapping 300ms fetches would finish in ~300ms
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_empty_refresh() {
        let fetcher = Fetcher::new(test_config()).unwrap();
        assert!(fetcher.refresh(&[], None).await.is_empty());
    }
}
