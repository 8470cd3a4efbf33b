//! Process-wide counters and a request latency histogram, exposed in the
//! Prometheus text format on `/metrics`.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};

/// Histogram bucket upper bounds in milliseconds.  Upstream calls dominate
/// latency, so the range reaches well past typical completion times.
const LATENCY_BUCKETS_MS: &[u64] = &[5, 10, 50, 100, 250, 500, 1000, 2000, 5000, 10000, 30000];

pub struct Metrics {
    requests_total: AtomicU64,
    rate_limited_total: AtomicU64,
    rejected_total: AtomicU64,
    answers_total: AtomicU64,
    fallbacks_total: AtomicU64,
    failures_total: AtomicU64,
    hist_counts: Vec<AtomicU64>,
    hist_sum_ms: AtomicU64,
    hist_count: AtomicU64,
    started_at: DateTime<Utc>,
    started_instant: Instant,
}

/// Outcome of one chat request, as counted by [`Metrics::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    RateLimited,
    Rejected,
    Answered { fallbacks: u64 },
    Failed,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            answers_total: AtomicU64::new(0),
            fallbacks_total: AtomicU64::new(0),
            failures_total: AtomicU64::new(0),
            hist_counts: LATENCY_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
            started_at: Utc::now(),
            started_instant: Instant::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn record(&self, outcome: Outcome, latency_ms: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Outcome::RateLimited => {
                self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Rejected => {
                self.rejected_total.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Answered { fallbacks } => {
                self.answers_total.fetch_add(1, Ordering::Relaxed);
                self.fallbacks_total.fetch_add(fallbacks, Ordering::Relaxed);
            }
            Outcome::Failed => {
                self.failures_total.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.hist_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
        if let Some(idx) = LATENCY_BUCKETS_MS.iter().position(|ub| latency_ms <= *ub) {
            self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn render(&self, tracked_clients: usize) -> String {
        let mut buf = String::new();
        let counters = [
            ("folio_requests_total", "Chat requests received", &self.requests_total),
            ("folio_rate_limited_total", "Requests denied by the rate limiter", &self.rate_limited_total),
            ("folio_rejected_total", "Requests rejected by the input guard", &self.rejected_total),
            ("folio_answers_total", "Requests answered successfully", &self.answers_total),
            ("folio_fallbacks_total", "Model candidates skipped before an answer", &self.fallbacks_total),
            ("folio_upstream_failures_total", "Requests failed by the upstream", &self.failures_total),
        ];
        for (name, help, value) in counters {
            writeln!(&mut buf, "# HELP {name} {help}").ok();
            writeln!(&mut buf, "# TYPE {name} counter").ok();
            writeln!(&mut buf, "{name} {}", value.load(Ordering::Relaxed)).ok();
        }

        writeln!(&mut buf, "# HELP folio_request_latency_ms Chat request latency histogram milliseconds").ok();
        writeln!(&mut buf, "# TYPE folio_request_latency_ms histogram").ok();
        let mut cumulative: u64 = 0;
        for (i, ub) in LATENCY_BUCKETS_MS.iter().enumerate() {
            cumulative += self.hist_counts[i].load(Ordering::Relaxed);
            writeln!(&mut buf, "folio_request_latency_ms_bucket{{le=\"{}\"}} {}", ub, cumulative).ok();
        }
        let count = self.hist_count.load(Ordering::Relaxed);
        writeln!(&mut buf, "folio_request_latency_ms_bucket{{le=\"+Inf\"}} {}", count).ok();
        writeln!(&mut buf, "folio_request_latency_ms_sum {}", self.hist_sum_ms.load(Ordering::Relaxed)).ok();
        writeln!(&mut buf, "folio_request_latency_ms_count {}", count).ok();

        writeln!(&mut buf, "# HELP folio_rate_limit_clients Client identities tracked by the rate limiter\n# TYPE folio_rate_limit_clients gauge").ok();
        writeln!(&mut buf, "folio_rate_limit_clients {}", tracked_clients).ok();
        writeln!(&mut buf, "# HELP folio_build_info Build information\n# TYPE folio_build_info gauge").ok();
        writeln!(&mut buf, "folio_build_info{{version=\"{}\"}} 1", env!("CARGO_PKG_VERSION")).ok();
        writeln!(&mut buf, "# HELP folio_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE folio_process_start_time_seconds gauge").ok();
        writeln!(&mut buf, "folio_process_start_time_seconds {}", self.started_at.timestamp()).ok();
        writeln!(&mut buf, "# HELP folio_process_uptime_seconds Process uptime seconds\n# TYPE folio_process_uptime_seconds gauge").ok();
        writeln!(&mut buf, "folio_process_uptime_seconds {}", self.started_instant.elapsed().as_secs_f64()).ok();
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
