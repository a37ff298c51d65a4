//! Rate limiting (§4.4/§6): per-client dual token bucket with tiered presets. Grounded on
//! `api/rate_limit.py`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const CLIENT_ID_PREFIX_LEN: usize = 16;
const STALE_BUCKET_MAX_AGE: Duration = Duration::from_secs(3600);

/// Lazily-refilling token bucket (§3 TokenBucket). `tokens = min(capacity, tokens + elapsed *
/// refill_rate)` on every `consume` call, matching `api/rate_limit.py::TokenBucket._refill`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        let now = Instant::now();
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: now,
            last_used: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Attempts to consume `cost` tokens. Returns `Ok(())` on success, or `Err(retry_after)`
    /// (seconds) on failure.
    pub fn consume(&mut self, cost: f64) -> Result<(), f64> {
        let now = Instant::now();
        self.refill(now);
        self.last_used = now;
        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            let deficit = cost - self.tokens;
            Err(deficit / self.refill_rate)
        }
    }

    pub fn remaining(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }
}

/// `(rpm, heavy_rpm)` preset per tier, `bucket_capacity = rpm * burst_multiplier`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub rpm: f64,
    pub heavy_rpm: f64,
    pub burst_multiplier: f64,
}

impl RateLimitConfig {
    pub fn tokens_per_second(&self) -> f64 {
        self.rpm / 60.0
    }

    pub fn heavy_tokens_per_second(&self) -> f64 {
        self.heavy_rpm / 60.0
    }

    pub fn bucket_capacity(&self) -> f64 {
        self.rpm * self.burst_multiplier
    }

    pub fn heavy_bucket_capacity(&self) -> f64 {
        self.heavy_rpm * self.burst_multiplier
    }
}

/// Verbatim from `RATE_LIMIT_TIERS`.
pub fn tier_config(tier: &str) -> RateLimitConfig {
    let (rpm, heavy_rpm) = match tier {
        "free" => (30.0, 5.0),
        "premium" => (120.0, 30.0),
        "unlimited" => (1000.0, 100.0),
        _ => (60.0, 10.0), // "standard" and unrecognized tiers fall back to standard.
    };
    RateLimitConfig {
        rpm,
        heavy_rpm,
        burst_multiplier: 1.5,
    }
}

/// Endpoints that draw from the heavy bucket and their admission cost, ported from
/// `HEAVY_PATHS`/`_get_cost`.
pub fn request_cost(path: &str) -> f64 {
    match path {
        "/v1/chat" => 2.0,
        "/v1/skills/call" => 3.0,
        _ => 1.0,
    }
}

pub fn is_heavy_path(path: &str) -> bool {
    matches!(path, "/v1/chat" | "/v1/skills/call")
}

/// Paths that bypass rate limiting entirely.
pub const EXEMPT_PATHS: &[&str] = &["/", "/health", "/docs", "/redoc", "/openapi.json"];

struct ClientBuckets {
    normal: TokenBucket,
    heavy: TokenBucket,
}

/// Mapping from client id to its dual bucket pair (§3 RateLimiter).
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, ClientBuckets>>,
}

impl RateLimiter {
    pub fn new(tier: &str) -> Self {
        Self {
            config: tier_config(tier),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_insert<'a>(buckets: &'a mut HashMap<String, ClientBuckets>, client_id: &str, config: &RateLimitConfig) -> &'a mut ClientBuckets {
        buckets.entry(client_id.to_string()).or_insert_with(|| ClientBuckets {
            normal: TokenBucket::new(config.bucket_capacity(), config.tokens_per_second()),
            heavy: TokenBucket::new(config.heavy_bucket_capacity(), config.heavy_tokens_per_second()),
        })
    }

    /// Checks and consumes admission for `client_id` against the bucket implied by `path`.
    /// Returns `Ok(())` on success, `Err(retry_after_seconds)` when rate-limited.
    pub fn check_rate_limit(&self, client_id: &str, path: &str) -> Result<(), f64> {
        let cost = request_cost(path);
        let mut buckets = self.buckets.lock().unwrap();
        let entry = Self::get_or_insert(&mut buckets, client_id, &self.config);
        if is_heavy_path(path) {
            entry.heavy.consume(cost)
        } else {
            entry.normal.consume(cost)
        }
    }

    pub fn remaining(&self, client_id: &str) -> (f64, f64) {
        let mut buckets = self.buckets.lock().unwrap();
        let entry = Self::get_or_insert(&mut buckets, client_id, &self.config);
        (entry.normal.remaining(), entry.heavy.remaining())
    }

    /// `(limit, remaining, reset_seconds)` for the bucket `path` draws from, for the
    /// `X-RateLimit-*` header triplet (§6 scenario S5). `reset_seconds` estimates time until
    /// the bucket is back at full capacity, not until the next single token is available.
    pub fn limit_info(&self, client_id: &str, path: &str) -> (f64, f64, f64) {
        let mut buckets = self.buckets.lock().unwrap();
        let entry = Self::get_or_insert(&mut buckets, client_id, &self.config);
        let (capacity, refill_rate, remaining) = if is_heavy_path(path) {
            (self.config.heavy_bucket_capacity(), self.config.heavy_tokens_per_second(), entry.heavy.remaining())
        } else {
            (self.config.bucket_capacity(), self.config.tokens_per_second(), entry.normal.remaining())
        };
        let reset = if refill_rate > 0.0 { (capacity - remaining).max(0.0) / refill_rate } else { 0.0 };
        (capacity, remaining, reset)
    }

    /// Drops buckets untouched for longer than an hour, bounding memory for long-lived
    /// processes with many transient clients.
    pub fn cleanup_old_buckets(&self) {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.normal.last_used) < STALE_BUCKET_MAX_AGE);
    }
}

/// Client id derivation precedence (§4.4): API key prefix > JWT prefix > `X-Forwarded-For`
/// head > peer address. The prefix length caps credential leakage into logs/metrics.
pub fn client_id(api_key: Option<&str>, bearer_token: Option<&str>, forwarded_for: Option<&str>, peer_addr: &str) -> String {
    if let Some(key) = api_key {
        return format!("key:{}", truncate(key));
    }
    if let Some(token) = bearer_token {
        return format!("jwt:{}", truncate(token));
    }
    if let Some(forwarded) = forwarded_for {
        if let Some(first) = forwarded.split(',').next() {
            return format!("ip:{}", first.trim());
        }
    }
    format!("ip:{peer_addr}")
}

fn truncate(s: &str) -> String {
    s.chars().take(CLIENT_ID_PREFIX_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn bucket_refill_scenario_s1() {
        // S1: capacity=5, refill=1/s. Five cost=1 consumes succeed; the sixth fails with
        // retry_after ~1.0s; after 2s a cost=2 consume succeeds.
        let mut bucket = TokenBucket::new(5.0, 1.0);
        for _ in 0..5 {
            assert!(bucket.consume(1.0).is_ok());
        }
        let err = bucket.consume(1.0).unwrap_err();
        assert!((err - 1.0).abs() < 0.05);

        sleep(Duration::from_millis(2000));
        assert!(bucket.consume(2.0).is_ok());
    }

    #[test]
    fn tier_presets_match_documented_values() {
        let free = tier_config("free");
        assert_eq!(free.rpm, 30.0);
        assert_eq!(free.heavy_rpm, 5.0);
        let standard = tier_config("standard");
        assert_eq!(standard.rpm, 60.0);
        assert_eq!(standard.heavy_rpm, 10.0);
        let premium = tier_config("premium");
        assert_eq!(premium.rpm, 120.0);
        assert_eq!(premium.heavy_rpm, 30.0);
        let unlimited = tier_config("unlimited");
        assert_eq!(unlimited.rpm, 1000.0);
        assert_eq!(unlimited.heavy_rpm, 100.0);
    }

    #[test]
    fn client_id_prefers_api_key_over_jwt_over_forwarded_for() {
        let id = client_id(Some("abcdefghijklmnopqrstuvwxyz"), Some("sometoken"), Some("1.2.3.4"), "5.6.7.8");
        assert_eq!(id, "key:abcdefghijklmnop");

        let id = client_id(None, Some("abcdefghijklmnopqrstuvwxyz"), Some("1.2.3.4"), "5.6.7.8");
        assert_eq!(id, "jwt:abcdefghijklmnop");

        let id = client_id(None, None, Some("1.2.3.4, 5.6.7.8"), "9.9.9.9");
        assert_eq!(id, "ip:1.2.3.4");

        let id = client_id(None, None, None, "9.9.9.9");
        assert_eq!(id, "ip:9.9.9.9");
    }

    #[test]
    fn heavy_path_draws_from_separate_bucket() {
        let limiter = RateLimiter::new("free");
        // Heavy bucket capacity = 5 * 1.5 = 7.5, cost 2 per /v1/chat call.
        assert!(limiter.check_rate_limit("c1", "/v1/chat").is_ok());
        assert!(limiter.check_rate_limit("c1", "/v1/chat").is_ok());
        assert!(limiter.check_rate_limit("c1", "/v1/chat").is_ok());
        // Normal bucket is untouched by heavy-path consumption.
        assert!(limiter.check_rate_limit("c1", "/v1/status").is_ok());
    }
}
