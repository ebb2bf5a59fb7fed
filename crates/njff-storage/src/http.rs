//! HTTP fetch plumbing: per-source pacing, retry ladder, shared rate limit.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Context;
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Worth another attempt after a backoff pause: connection-level
    /// trouble, timeouts, 5xx, and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            FetchError::HttpStatus { status, .. } => {
                *status == 429 || (500..=599).contains(status)
            }
        }
    }

    /// 429 and challenge-page statuses, for the adapter cool-down path.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 429 | 403, .. })
    }
}

/// Fixed 2 s / 10 s / 60 s ladder. Each pause is stretched by up to
/// `jitter` of itself so retries from parallel adapters do not land on a
/// struggling source in lockstep.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub delays: Vec<Duration>,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(60),
            ],
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn jittered(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return base;
        }
        base.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..self.jitter))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub rate_per_minute: u32,
    pub burst: u32,
}

/// Process-wide limiter with continuous refill: the level accrues
/// fractional tokens over elapsed time up to `burst`, and a waiter sleeps
/// exactly long enough for the next whole token rather than polling on a
/// fixed interval.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    level: Mutex<BucketLevel>,
}

#[derive(Debug)]
struct BucketLevel {
    tokens: f64,
    refreshed: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rate_per_sec: rate_per_sec.max(f64::MIN_POSITIVE),
            burst,
            level: Mutex::new(BucketLevel {
                tokens: burst,
                refreshed: Instant::now(),
            }),
        }
    }

    /// Rate for "n requests per minute" style configuration.
    pub fn per_minute(tokens: u32) -> Self {
        let tokens = tokens.max(1);
        Self::new(tokens as f64 / 60.0, tokens)
    }

    /// Blocks until a token is available. Cancel-safe: an abandoned waiter
    /// consumes nothing.
    pub async fn take(&self) {
        loop {
            let wait = {
                let mut level = self.level.lock().await;
                let now = Instant::now();
                let accrued =
                    now.duration_since(level.refreshed).as_secs_f64() * self.rate_per_sec;
                level.tokens = (level.tokens + accrued).min(self.burst);
                level.refreshed = now;
                if level.tokens >= 1.0 {
                    level.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - level.tokens) / self.rate_per_sec)
            };
            // Re-check after sleeping; another waiter may claim the token.
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Client-wide ceiling; individual calls pass their own tighter timeout.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Cap on simultaneous requests across all sources.
    pub max_in_flight: usize,
    /// Minimum gap between successive requests to the same source.
    pub per_source_spacing: Duration,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            max_in_flight: 16,
            per_source_spacing: Duration::from_millis(200),
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Shared fetcher. A request passes three gates before the wire: the
/// global in-flight cap, the per-source send schedule, and the optional
/// token bucket. Transient failures then walk the backoff ladder until it
/// runs out.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    /// Next allowed send instant per source.
    schedule: Mutex<HashMap<String, Instant>>,
    spacing: Duration,
    bucket: Option<TokenBucket>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            schedule: Mutex::new(HashMap::new()),
            spacing: config.per_source_spacing,
            bucket: config
                .token_bucket
                .map(|c| TokenBucket::new(c.rate_per_minute as f64 / 60.0, c.burst)),
            backoff: config.backoff,
        })
    }

    /// Reserve the next send slot for a source and return how long to wait
    /// for it. Slots advance monotonically by `spacing`, so a burst of
    /// tasks against one host spreads out even when all of them arrive at
    /// once.
    async fn reserve_slot(&self, source_id: &str) -> Option<Duration> {
        if self.spacing.is_zero() {
            return None;
        }
        let mut schedule = self.schedule.lock().await;
        let now = Instant::now();
        let slot = schedule.entry(source_id.to_string()).or_insert(now);
        let wait = slot.checked_duration_since(now).filter(|w| !w.is_zero());
        *slot = (*slot).max(now) + self.spacing;
        wait
    }

    async fn attempt(&self, url: &str, timeout: Duration) -> Result<FetchedResponse, FetchError> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = response.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    /// GET with a per-call timeout (list pages 15 s, detail pages 5 s).
    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedResponse, FetchError> {
        // The semaphore is never closed; if it somehow were, run uncapped.
        let _permit = self.in_flight.acquire().await.ok();

        if let Some(wait) = self.reserve_slot(source_id).await {
            tokio::time::sleep(wait).await;
        }
        if let Some(bucket) = &self.bucket {
            bucket.take().await;
        }

        let mut remaining = self.backoff.delays.iter().copied();
        loop {
            match self.attempt(url, timeout).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() => {
                    let Some(base) = remaining.next() else {
                        return Err(err);
                    };
                    let pause = self.backoff.jittered(base);
                    debug!(source_id, url, error = %err, ?pause, "transient fetch failure; backing off");
                    tokio::time::sleep(pause).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stretches_each_rung_within_bounds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delays.len(), 3);

        for base in [2u64, 10, 60].map(Duration::from_secs) {
            let d = policy.jittered(base);
            assert!(d >= base, "{d:?} < {base:?}");
            assert!(d <= base.mul_f64(1.2), "{d:?} too long");
        }

        let exact = BackoffPolicy {
            delays: vec![Duration::from_secs(2)],
            jitter: 0.0,
        };
        assert_eq!(exact.jittered(Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[test]
    fn transient_and_rate_limit_classification() {
        let status = |code: u16| FetchError::HttpStatus {
            status: code,
            url: "https://example.com".into(),
        };

        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(403).is_transient());

        assert!(status(429).is_rate_limit());
        assert!(status(403).is_rate_limit());
        assert!(!status(500).is_rate_limit());
    }

    #[tokio::test]
    async fn token_bucket_bursts_then_meters() {
        // 50 tokens/sec, burst of 2: two free takes, then ~20 ms per token.
        let bucket = TokenBucket::new(50.0, 2);
        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(start.elapsed() < Duration::from_millis(15));

        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn per_minute_constructor_sets_rate_and_burst() {
        let bucket = TokenBucket::per_minute(10);
        assert!((bucket.rate_per_sec - 10.0 / 60.0).abs() < 1e-9);
        assert!((bucket.burst - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn send_slots_space_out_one_source_but_not_others() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            per_source_spacing: Duration::from_millis(30),
            ..HttpClientConfig::default()
        })
        .unwrap();

        assert!(fetcher.reserve_slot("civilview-hudson").await.is_none());
        let wait = fetcher
            .reserve_slot("civilview-hudson")
            .await
            .expect("second caller waits");
        assert!(wait <= Duration::from_millis(30));
        assert!(wait >= Duration::from_millis(10));

        // A different source has its own schedule.
        assert!(fetcher.reserve_slot("auction-aggregator").await.is_none());
    }

    #[tokio::test]
    async fn zero_spacing_disables_the_schedule() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            per_source_spacing: Duration::ZERO,
            ..HttpClientConfig::default()
        })
        .unwrap();
        assert!(fetcher.reserve_slot("civilview-hudson").await.is_none());
        assert!(fetcher.reserve_slot("civilview-hudson").await.is_none());
    }
}
