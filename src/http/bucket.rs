use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

/// Reserved key for the account-wide lockout bucket.
pub const GLOBAL_KEY: &str = "global";

#[derive(Debug, Clone, Copy)]
struct Quota {
    limit: u32,
    remaining: u32,
    reset_at: Instant,
}

/// One server-side quota window: `(limit, remaining, reset_at)` plus a gate
/// that is held across pre-emptive sleeps.
#[derive(Debug)]
pub struct Bucket {
    state: Mutex<Quota>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Bucket {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Quota {
                limit: 1,
                remaining: 1,
                reset_at: Instant::now(),
            }),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn store(&self, limit: u32, remaining: u32, reset_after: Duration) {
        let mut quota = self.state.lock().expect("lock not poisoned");
        quota.limit = limit;
        quota.remaining = remaining.min(limit);
        quota.reset_at = Instant::now() + reset_after;
    }

    /// Whether the next request would be rejected: no permits left and the
    /// window has not yet reset.
    pub fn predicts_limit(&self) -> bool {
        let quota = self.state.lock().expect("lock not poisoned");
        quota.remaining == 0 && Instant::now() <= quota.reset_at
    }

    pub fn remaining(&self) -> u32 {
        self.state.lock().expect("lock not poisoned").remaining
    }

    pub fn reset_at(&self) -> Instant {
        self.state.lock().expect("lock not poisoned").reset_at
    }

    /// Barrier: acquire the gate and release it immediately. Blocks only
    /// while another task holds the gate across a reset sleep.
    pub async fn wait_until_available(&self) {
        drop(self.gate.lock().await);
    }

    /// Hold the gate for the remaining time to `reset_at`. Zero wait when
    /// the reset instant has already passed.
    pub async fn lock_until_reset(&self) {
        let _guard = self.gate.lock().await;
        self.sleep_until_reset().await;
    }

    async fn sleep_until_reset(&self) {
        let reset_at = self.state.lock().expect("lock not poisoned").reset_at;
        let now = Instant::now();
        if reset_at > now {
            sleep(reset_at - now).await;
        }
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate-limit headers recognized on REST responses. Header-name lookup is
/// case-insensitive via `HeaderMap`.
#[derive(Debug, Clone, Default)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after_secs: Option<f64>,
    pub bucket: Option<String>,
    pub retry_after_ms: Option<f64>,
    pub global: bool,
}

impl RateLimitHeaders {
    pub fn parse(headers: &HeaderMap) -> Self {
        Self {
            limit: header_parse(headers, "x-ratelimit-limit"),
            remaining: header_parse(headers, "x-ratelimit-remaining"),
            reset_after_secs: header_parse(headers, "x-ratelimit-reset-after"),
            bucket: header_str(headers, "x-ratelimit-bucket").map(str::to_owned),
            // retry-after arrives in milliseconds, unlike reset-after.
            retry_after_ms: header_parse(headers, "retry-after"),
            global: header_str(headers, "x-ratelimit-global") == Some("true"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.remaining.is_none()
            && self.reset_after_secs.is_none()
            && self.bucket.is_none()
            && self.retry_after_ms.is_none()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms
            .map(|ms| Duration::from_secs_f64((ms / 1000.0).max(0.0)))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_parse<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

/// Maps route keys and server bucket ids onto shared [`Bucket`] state.
///
/// A key resolves through `key_to_id` once the server has revealed its bucket
/// id; before that, through the fallback map. Both paths reach the same
/// bucket at steady state.
#[derive(Debug, Default)]
pub struct BucketTable {
    key_to_id: DashMap<String, String>,
    by_id: DashMap<String, Arc<Bucket>>,
    fallback: DashMap<String, Arc<Bucket>>,
}

impl BucketTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, route_key: &str) -> Option<Arc<Bucket>> {
        if let Some(id) = self.key_to_id.get(route_key) {
            if let Some(bucket) = self.by_id.get(id.value()) {
                return Some(bucket.clone());
            }
        }
        self.fallback.get(route_key).map(|b| b.clone())
    }

    pub fn global(&self) -> Arc<Bucket> {
        self.by_id.entry(GLOBAL_KEY.to_owned()).or_default().clone()
    }

    /// Update state from response headers. Idempotent; unknown or absent
    /// headers leave the table untouched.
    pub fn observe(&self, route_key: &str, parsed: &RateLimitHeaders, trace: &str) {
        if let (Some(limit), Some(remaining), Some(reset_after), Some(id)) = (
            parsed.limit,
            parsed.remaining,
            parsed.reset_after_secs,
            parsed.bucket.as_deref(),
        ) {
            let bucket = self
                .by_id
                .entry(id.to_owned())
                .or_insert_with(|| {
                    // Re-home the pre-id bucket so tasks already queued on
                    // its gate stay coherent with the id-keyed entry.
                    self.fallback
                        .get(route_key)
                        .map(|b| b.clone())
                        .unwrap_or_default()
                })
                .clone();
            bucket.store(limit, remaining, Duration::from_secs_f64(reset_after.max(0.0)));
            self.key_to_id.insert(route_key.to_owned(), id.to_owned());
            self.fallback.insert(route_key.to_owned(), bucket);
        } else if let Some(retry_after) = parsed.retry_after() {
            let bucket = self
                .fallback
                .entry(route_key.to_owned())
                .or_default()
                .clone();
            bucket.store(0, 0, retry_after);
        } else if parsed.is_empty() {
            debug!(route_key, trace, "response carried no rate limit headers");
        }
    }

    /// Account-wide lockout: update the global bucket from `retry-after` and
    /// keep its gate held until the reset instant elapses.
    ///
    /// The gate is taken synchronously, before this returns, so a request
    /// racing in right behind the 429 already blocks at the barrier; only
    /// the timed release runs on a background task. When the gate is held by
    /// an earlier lockout, the refreshed quota makes the next acquirer sleep
    /// out the remainder itself.
    pub fn global_lock(&self, parsed: &RateLimitHeaders, trace: &str) {
        let Some(retry_after) = parsed.retry_after() else {
            debug!(trace, "global rate limit without retry-after");
            return;
        };
        let global = self.global();
        global.store(0, 0, retry_after);
        if let Ok(guard) = global.gate.clone().try_lock_owned() {
            tokio::spawn(async move {
                let _guard = guard;
                global.sleep_until_reset().await;
            });
        }
    }
}
