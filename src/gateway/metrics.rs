//! In-process request counters with a plain-text exposition. Anything
//! richer (histograms, push collectors) lives outside this crate.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    auth_failures: AtomicU64,
    rate_limited: AtomicU64,
    upstream_attempts: AtomicU64,
    upstream_failures: AtomicU64,
    fallback_advances: AtomicU64,
    responses_ok: AtomicU64,
    responses_err: AtomicU64,
}

impl Metrics {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_attempt(&self) {
        self.upstream_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_advance(&self) {
        self.fallback_advances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self, ok: bool) {
        if ok {
            self.responses_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.responses_err.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn responses_err(&self) -> u64 {
        self.responses_err.load(Ordering::Relaxed)
    }

    pub fn upstream_failures(&self) -> u64 {
        self.upstream_failures.load(Ordering::Relaxed)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, value) in [
            ("modelgate_requests_total", self.requests.load(Ordering::Relaxed)),
            (
                "modelgate_auth_failures_total",
                self.auth_failures.load(Ordering::Relaxed),
            ),
            (
                "modelgate_rate_limited_total",
                self.rate_limited.load(Ordering::Relaxed),
            ),
            (
                "modelgate_upstream_attempts_total",
                self.upstream_attempts.load(Ordering::Relaxed),
            ),
            (
                "modelgate_upstream_failures_total",
                self.upstream_failures.load(Ordering::Relaxed),
            ),
            (
                "modelgate_fallback_advances_total",
                self.fallback_advances.load(Ordering::Relaxed),
            ),
            (
                "modelgate_responses_ok_total",
                self.responses_ok.load(Ordering::Relaxed),
            ),
            (
                "modelgate_responses_error_total",
                self.responses_err.load(Ordering::Relaxed),
            ),
        ] {
            out.push_str("# TYPE ");
            out.push_str(name);
            out.push_str(" counter\n");
            out.push_str(name);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out
    }
}
