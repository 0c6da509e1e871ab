//! Per-caller token-bucket rate limiting.
//!
//! Buckets are keyed by the resolved caller identity (`user:<id>`) and fall
//! back to the remote address (`ip:<addr>`).
//!
//! ## Security Note
//!
//! By default, X-Forwarded-For and X-Real-IP headers are NOT trusted
//! to prevent rate limit bypass attacks. Configure `trusted_proxies`
//! with your proxy IP addresses to enable header-based IP detection.

use std::collections::HashSet;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::http::HeaderMap;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorLimiter};

use crate::config::RateLimitConfig;

/// Shared rate limiter state
#[derive(Clone)]
pub struct RateLimiter {
    limiter: Option<Arc<DefaultKeyedRateLimiter<String>>>,
    config: RateLimitConfig,
    trusted_proxies: HashSet<IpAddr>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let trusted_proxies: HashSet<IpAddr> = config
            .trusted_proxies
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();

        if !trusted_proxies.is_empty() {
            tracing::info!(
                count = trusted_proxies.len(),
                "Configured trusted proxies for client address detection"
            );
        }

        if !config.enabled {
            return Self {
                limiter: None,
                config: config.clone(),
                trusted_proxies,
            };
        }

        // Burst of `burst_size`, refilling at `requests_per_second`.
        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rps).allow_burst(burst);

        Self {
            limiter: Some(Arc::new(GovernorLimiter::keyed(quota))),
            config: config.clone(),
            trusted_proxies,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.limiter.is_some()
    }

    /// Take one token from `key`'s bucket. Always allows when disabled.
    pub fn check(&self, key: &str) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check_key(&key.to_string()).is_ok(),
            None => true,
        }
    }

    /// Evict buckets that have fully refilled and free the backing memory.
    pub fn evict_idle(&self) -> usize {
        let Some(limiter) = &self.limiter else {
            return 0;
        };
        let before = limiter.len();
        limiter.retain_recent();
        limiter.shrink_to_fit();
        before.saturating_sub(limiter.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.limiter.as_ref().map(|l| l.len()).unwrap_or(0)
    }

    /// Check if headers should be trusted for the given connection IP
    pub fn should_trust_headers(&self, connection_ip: Option<IpAddr>) -> bool {
        if self.config.trust_xff_from_any {
            return true;
        }

        match connection_ip {
            Some(ip) => self.trusted_proxies.contains(&ip),
            None => false,
        }
    }

    /// Client address for a call.
    ///
    /// Forwarded headers are only honored when the connection comes from a
    /// trusted proxy.
    pub fn client_ip(&self, connection_ip: Option<IpAddr>, headers: &HeaderMap) -> Option<IpAddr> {
        if self.should_trust_headers(connection_ip) {
            if let Some(forwarded) = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                // First hop is the original client
                if let Some(ip) = forwarded
                    .split(',')
                    .next()
                    .and_then(|s| s.trim().parse().ok())
                {
                    return Some(ip);
                }
            }

            if let Some(ip) = headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
            {
                return Some(ip);
            }
        }

        connection_ip
    }
}

/// Bucket key for a call: caller identity first, then remote address.
pub fn bucket_key(user_id: Option<&str>, client_ip: Option<IpAddr>) -> String {
    match (user_id, client_ip) {
        (Some(id), _) => format!("user:{id}"),
        (None, Some(ip)) => format!("ip:{ip}"),
        (None, None) => "anonymous".to_string(),
    }
}
