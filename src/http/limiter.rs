use crate::http::bucket::{BucketTable, RateLimitHeaders};
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

const TRACE_LEN: usize = 6;
const TRACE_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

static TRACE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Short alphanumeric id correlating one request across log lines and errors.
pub fn trace_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mut seed = nanos ^ TRACE_COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9e37);
    let mut out = String::with_capacity(TRACE_LEN);
    for _ in 0..TRACE_LEN {
        out.push(TRACE_CHARSET[(seed % TRACE_CHARSET.len() as u64) as usize] as char);
        seed /= TRACE_CHARSET.len() as u64;
        seed ^= nanos.rotate_left(17);
    }
    out
}

/// Context carried by one request through the rate-limit middleware.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub rl_key: String,
    pub trace: String,
}

impl RequestContext {
    pub fn new(rl_key: impl Into<String>) -> Self {
        Self {
            rl_key: rl_key.into(),
            trace: trace_id(),
        }
    }
}

/// Held for the whole request/response cycle of one key; dropping it lets the
/// next same-key request proceed.
#[derive(Debug)]
pub struct KeyLease {
    _guard: OwnedMutexGuard<()>,
}

/// Serializes requests that share a rate-limit key, waits out known-empty
/// buckets before hitting the wire, and folds response headers back into the
/// bucket table.
#[derive(Debug, Default)]
pub struct RateLimiter {
    table: BucketTable,
    keys: DashMap<String, Arc<Mutex<()>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> &BucketTable {
        &self.table
    }

    /// Blocks until the request may be sent: passes the global barrier
    /// first, then takes the per-key mutex (FIFO among same-key callers),
    /// and if the known bucket predicts a 429, sleeps until its reset while
    /// holding the bucket gate.
    ///
    /// An active global lockout whose holder has not engaged the gate yet is
    /// still observed: the quota check runs before the barrier, and the
    /// acquirer sleeps out the reset itself, gate held.
    pub async fn acquire(&self, ctx: &RequestContext) -> KeyLease {
        let global = self.table.global();
        if global.predicts_limit() {
            debug!(
                rl_key = %ctx.rl_key,
                trace = %ctx.trace,
                "global lockout active, sleeping until reset"
            );
            global.lock_until_reset().await;
        } else {
            global.wait_until_available().await;
        }

        let mutex = self
            .keys
            .entry(ctx.rl_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;

        if let Some(bucket) = self.table.lookup(&ctx.rl_key) {
            if bucket.predicts_limit() {
                debug!(
                    rl_key = %ctx.rl_key,
                    trace = %ctx.trace,
                    "bucket exhausted, sleeping until reset"
                );
                bucket.lock_until_reset().await;
            }
        }

        KeyLease { _guard: guard }
    }

    /// Folds response headers into the table. A 429 flagged global installs
    /// the account-wide lockout so every key blocks at the barrier.
    pub fn observe(&self, ctx: &RequestContext, status: u16, headers: &HeaderMap) {
        let parsed = RateLimitHeaders::parse(headers);
        self.table.observe(&ctx.rl_key, &parsed, &ctx.trace);
        if status == 429 && parsed.global {
            self.table.global_lock(&parsed, &ctx.trace);
        }
    }
}
