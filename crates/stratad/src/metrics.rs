//! Minimal Prometheus-style metrics (no external deps).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::Code;

/// Label for calls to methods the daemon does not know
pub const UNKNOWN_METHOD: &str = "unknown";

/// Process-wide daemon metrics.
#[derive(Default)]
pub struct Metrics {
    calls_in_flight: AtomicI64,
    call_duration_ms_total: AtomicU64,
    calls_by_method: Mutex<BTreeMap<(String, &'static str), u64>>,
    rate_limited_total: AtomicU64,
    panics_recovered_total: AtomicU64,
    audit_entries_total: AtomicU64,
    audit_failures_total: AtomicU64,
}

impl Metrics {
    pub fn call_started(&self) {
        self.calls_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// `code` is `None` for a successful call.
    pub fn call_finished(&self, method: &str, code: Option<Code>, elapsed: Duration) {
        self.calls_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.call_duration_ms_total
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);

        let code = code.map(|c| c.as_str()).unwrap_or("ok");
        let mut calls = self
            .calls_by_method
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        *calls.entry((method.to_string(), code)).or_insert(0) += 1;
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_panic_recovered(&self) {
        self.panics_recovered_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_audit_entry(&self) {
        self.audit_entries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_audit_failure(&self) {
        self.audit_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn calls_total(&self) -> u64 {
        let calls = self
            .calls_by_method
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        calls.values().sum()
    }

    pub fn calls_with_code(&self, code: &str) -> u64 {
        let calls = self
            .calls_by_method
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        calls
            .iter()
            .filter(|((_, c), _)| *c == code)
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn audit_failures(&self) -> u64 {
        self.audit_failures_total.load(Ordering::Relaxed)
    }

    pub fn render(&self, uptime_secs: i64, rate_limit_keys: Option<u64>) -> String {
        let mut out = String::new();

        out.push_str("# HELP stratad_uptime_seconds Daemon uptime in seconds.\n");
        out.push_str("# TYPE stratad_uptime_seconds gauge\n");
        out.push_str(&format!("stratad_uptime_seconds {}\n", uptime_secs.max(0)));

        out.push_str("# HELP stratad_rpc_calls_total RPC calls completed, by method and code.\n");
        out.push_str("# TYPE stratad_rpc_calls_total counter\n");
        {
            let calls = self
                .calls_by_method
                .lock()
                .unwrap_or_else(|err| err.into_inner());
            for ((method, code), count) in calls.iter() {
                out.push_str(&format!(
                    "stratad_rpc_calls_total{{method=\"{}\",code=\"{}\"}} {}\n",
                    escape_label_value(method),
                    code,
                    count
                ));
            }
        }

        out.push_str("# HELP stratad_rpc_calls_in_flight RPC calls currently executing.\n");
        out.push_str("# TYPE stratad_rpc_calls_in_flight gauge\n");
        out.push_str(&format!(
            "stratad_rpc_calls_in_flight {}\n",
            self.calls_in_flight.load(Ordering::Relaxed).max(0)
        ));

        out.push_str(
            "# HELP stratad_rpc_duration_ms_total Cumulative RPC latency in milliseconds.\n",
        );
        out.push_str("# TYPE stratad_rpc_duration_ms_total counter\n");
        out.push_str(&format!(
            "stratad_rpc_duration_ms_total {}\n",
            self.call_duration_ms_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP stratad_rate_limited_total Calls rejected by the rate limiter.\n");
        out.push_str("# TYPE stratad_rate_limited_total counter\n");
        out.push_str(&format!(
            "stratad_rate_limited_total {}\n",
            self.rate_limited_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP stratad_panics_recovered_total Handler panics converted to errors.\n");
        out.push_str("# TYPE stratad_panics_recovered_total counter\n");
        out.push_str(&format!(
            "stratad_panics_recovered_total {}\n",
            self.panics_recovered_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP stratad_audit_entries_total Audit entries appended to the chain.\n");
        out.push_str("# TYPE stratad_audit_entries_total counter\n");
        out.push_str(&format!(
            "stratad_audit_entries_total {}\n",
            self.audit_entries_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP stratad_audit_failures_total Audit appends that failed.\n");
        out.push_str("# TYPE stratad_audit_failures_total counter\n");
        out.push_str(&format!(
            "stratad_audit_failures_total {}\n",
            self.audit_failures_total.load(Ordering::Relaxed)
        ));

        if let Some(keys) = rate_limit_keys {
            out.push_str(
                "# HELP stratad_rate_limit_keys Rate limiter buckets currently tracked.\n",
            );
            out.push_str("# TYPE stratad_rate_limit_keys gauge\n");
            out.push_str(&format!("stratad_rate_limit_keys {}\n", keys));
        }

        out
    }
}

fn escape_label_value(value: &str) -> String {
    // Prometheus label escaping: backslash, double-quote, and newlines.
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
