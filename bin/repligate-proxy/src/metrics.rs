//! Proxy metrics, exposed as Prometheus text on the technical listener

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Request counters by method and status class
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    requests_total: AtomicU64,
    responses_success: AtomicU64,
    responses_client_error: AtomicU64,
    responses_server_error: AtomicU64,
    request_errors: AtomicU64,
    request_bytes_total: AtomicU64,
    rejected_too_large: AtomicU64,
}

impl ProxyMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, body_bytes: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.request_bytes_total.fetch_add(body_bytes, Ordering::Relaxed);
    }

    pub fn record_response(&self, status: u16) {
        let counter = match status {
            200..=399 => &self.responses_success,
            400..=499 => &self.responses_client_error,
            _ => &self.responses_server_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.request_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_too_large(&self) {
        self.rejected_too_large.fetch_add(1, Ordering::Relaxed);
    }

    /// Render in Prometheus text exposition format
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        let counters = [
            ("repligate_requests_total", "Client requests accepted", &self.requests_total),
            (
                "repligate_responses_success_total",
                "Responses with status 2xx/3xx",
                &self.responses_success,
            ),
            (
                "repligate_responses_client_error_total",
                "Responses with status 4xx",
                &self.responses_client_error,
            ),
            (
                "repligate_responses_server_error_total",
                "Responses with status 5xx",
                &self.responses_server_error,
            ),
            (
                "repligate_request_errors_total",
                "Requests that failed before a backend response",
                &self.request_errors,
            ),
            (
                "repligate_request_bytes_total",
                "Request body bytes accepted",
                &self.request_bytes_total,
            ),
            (
                "repligate_rejected_too_large_total",
                "Requests rejected for exceeding the body size limit",
                &self.rejected_too_large,
            ),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", counter.load(Ordering::Relaxed));
        }
        out
    }
}
