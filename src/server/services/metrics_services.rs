use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

// fixed latency bins (ms), last bin is the overflow bucket
const LATENCY_BOUNDS_MS: [u64; 12] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000, u64::MAX];

// fixed body-size bins (bytes)
const SIZE_BOUNDS: [u64; 10] = [
    1 << 10,
    8 << 10,
    64 << 10,
    256 << 10,
    1 << 20,
    4 << 20,
    10 << 20,
    50 << 20,
    200 << 20,
    u64::MAX,
];

/// Fixed-bin histogram, quantiles read off the bucket bounds.
#[derive(Clone, Debug)]
struct FixedHistogram<const N: usize> {
    bounds: [u64; N],
    bins: [u64; N],
    count: u64,
    sum: u64,
}

impl<const N: usize> FixedHistogram<N> {
    fn new(bounds: [u64; N]) -> Self {
        Self {
            bounds,
            bins: [0; N],
            count: 0,
            sum: 0,
        }
    }

    fn observe(&mut self, value: u64) {
        let mut idx = 0;
        while idx < N - 1 && value > self.bounds[idx] {
            idx += 1;
        }
        self.bins[idx] += 1;
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
    }

    fn quantile(&self, q: f64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let target = (self.count as f64 * q).ceil() as u64;
        let mut acc = 0u64;
        for (i, c) in self.bins.iter().enumerate() {
            acc += *c;
            if acc >= target {
                return self.bounds[i];
            }
        }
        self.bounds[N - 1]
    }

    fn reset(&mut self) {
        self.bins = [0; N];
        self.count = 0;
        self.sum = 0;
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
}

#[derive(Serialize, Debug, Clone)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub responses_total: u64,
    pub errors_total: u64,
    pub cancellations_total: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub worker_successes: u64,
    pub worker_failures: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub in_flight: i64,
    pub latency_ms: HistogramSnapshot,
    pub body_bytes: HistogramSnapshot,
}

/// Process-wide telemetry: atomic counters, an in-flight gauge and two
/// fixed-bin histograms behind a short-held lock.
pub struct MetricsService {
    requests_total: AtomicU64,
    responses_total: AtomicU64,
    errors_total: AtomicU64,
    cancellations_total: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    worker_successes: AtomicU64,
    worker_failures: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    in_flight: AtomicI64,
    latency: Mutex<FixedHistogram<12>>,
    body_size: Mutex<FixedHistogram<10>>,
}

impl MetricsService {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            responses_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            cancellations_total: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            worker_successes: AtomicU64::new(0),
            worker_failures: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            latency: Mutex::new(FixedHistogram::new(LATENCY_BOUNDS_MS)),
            body_size: Mutex::new(FixedHistogram::new(SIZE_BOUNDS)),
        }
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self, latency: Duration, body_bytes: u64) {
        self.responses_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(body_bytes, Ordering::Relaxed);
        self.latency
            .lock()
            .unwrap()
            .observe(latency.as_millis() as u64);
        self.body_size.lock().unwrap().observe(body_bytes);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// client went away before we answered
    pub fn record_cancellation(&self) {
        self.cancellations_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_success(&self) {
        self.worker_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_failure(&self) {
        self.worker_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.latency.lock().unwrap();
        let body_size = self.body_size.lock().unwrap();
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            responses_total: self.responses_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            cancellations_total: self.cancellations_total.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            worker_successes: self.worker_successes.load(Ordering::Relaxed),
            worker_failures: self.worker_failures.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            latency_ms: HistogramSnapshot {
                count: latency.count,
                sum: latency.sum,
                p50: latency.quantile(0.50),
                p90: latency.quantile(0.90),
                p99: latency.quantile(0.99),
            },
            body_bytes: HistogramSnapshot {
                count: body_size.count,
                sum: body_size.sum,
                p50: body_size.quantile(0.50),
                p90: body_size.quantile(0.90),
                p99: body_size.quantile(0.99),
            },
        }
    }

    pub fn reset(&self) {
        self.requests_total.store(0, Ordering::Relaxed);
        self.responses_total.store(0, Ordering::Relaxed);
        self.errors_total.store(0, Ordering::Relaxed);
        self.cancellations_total.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.worker_successes.store(0, Ordering::Relaxed);
        self.worker_failures.store(0, Ordering::Relaxed);
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        // in_flight is a live gauge, resetting it would lie
        self.latency.lock().unwrap().reset();
        self.body_size.lock().unwrap().reset();
    }
}

impl Default for MetricsService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_response_pairs_balance_in_flight() {
        let metrics = MetricsService::new();
        metrics.record_request();
        metrics.record_request();
        assert_eq!(metrics.snapshot().in_flight, 2);

        metrics.record_response(Duration::from_millis(12), 1024);
        metrics.record_cancellation();
        let snap = metrics.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.responses_total, 1);
        assert_eq!(snap.cancellations_total, 1);
    }

    #[test]
    fn histogram_quantiles_track_observations() {
        let metrics = MetricsService::new();
        for ms in [2u64, 4, 8, 30, 90, 400, 2000] {
            metrics.record_request();
            metrics.record_response(Duration::from_millis(ms), 100);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.latency_ms.count, 7);
        assert!(snap.latency_ms.p99 >= 2000);
        assert!(snap.latency_ms.p50 <= 100);
    }

    #[test]
    fn reset_clears_counters_but_not_gauge() {
        let metrics = MetricsService::new();
        metrics.record_request();
        metrics.record_cache_hit();
        metrics.reset();
        let snap = metrics.snapshot();
        assert_eq!(snap.requests_total, 0);
        assert_eq!(snap.cache_hits, 0);
        assert_eq!(snap.in_flight, 1);
    }
}
