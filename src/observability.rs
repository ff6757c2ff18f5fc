use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

const LATENCY_WINDOW: usize = 10_000;

/// Process-wide relay counters.
pub struct Observability {
    records_enqueued_total: AtomicU64,
    batches_flushed_total: AtomicU64,
    records_flushed_total: AtomicU64,
    batch_retries_total: AtomicU64,
    batches_exhausted_total: AtomicU64,
    forward_failures_total: AtomicU64,
    records_consumed_total: AtomicU64,
    offsets_committed_total: AtomicU64,
    malformed_payloads_total: AtomicU64,
    rebalances_total: AtomicU64,
    flush_latency_ms: Mutex<VecDeque<u64>>,
}

impl Observability {
    fn new() -> Self {
        Self {
            records_enqueued_total: AtomicU64::new(0),
            batches_flushed_total: AtomicU64::new(0),
            records_flushed_total: AtomicU64::new(0),
            batch_retries_total: AtomicU64::new(0),
            batches_exhausted_total: AtomicU64::new(0),
            forward_failures_total: AtomicU64::new(0),
            records_consumed_total: AtomicU64::new(0),
            offsets_committed_total: AtomicU64::new(0),
            malformed_payloads_total: AtomicU64::new(0),
            rebalances_total: AtomicU64::new(0),
            flush_latency_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }

    pub fn record_enqueued(&self) {
        self.records_enqueued_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, records: usize, latency: Duration) {
        self.batches_flushed_total.fetch_add(1, Ordering::Relaxed);
        self.records_flushed_total
            .fetch_add(records as u64, Ordering::Relaxed);
        let mut window = self.flush_latency_ms.lock();
        if window.len() >= LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(latency.as_millis() as u64);
    }

    pub fn record_retry(&self) {
        self.batch_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self) {
        self.batches_exhausted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward_failure(&self) {
        self.forward_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consumed(&self, records: usize) {
        self.records_consumed_total
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_commit(&self, positions: usize) {
        self.offsets_committed_total
            .fetch_add(positions as u64, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_payloads_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebalance(&self) {
        self.rebalances_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed_total.load(Ordering::Relaxed)
    }

    pub fn batches_exhausted(&self) -> u64 {
        self.batches_exhausted_total.load(Ordering::Relaxed)
    }

    pub fn malformed_payloads(&self) -> u64 {
        self.malformed_payloads_total.load(Ordering::Relaxed)
    }

    fn p99_flush_latency_ms(&self) -> u64 {
        let window = self.flush_latency_ms.lock();
        if window.is_empty() {
            return 0;
        }
        let mut v: Vec<u64> = window.iter().copied().collect();
        v.sort_unstable();
        let idx = ((v.len() as f64) * 0.99).floor() as usize;
        v[idx.min(v.len() - 1)]
    }

    pub fn render_prometheus(&self) -> String {
        let counters = [
            ("records_enqueued_total", &self.records_enqueued_total),
            ("batches_flushed_total", &self.batches_flushed_total),
            ("records_flushed_total", &self.records_flushed_total),
            ("batch_retries_total", &self.batch_retries_total),
            ("batches_exhausted_total", &self.batches_exhausted_total),
            ("forward_failures_total", &self.forward_failures_total),
            ("records_consumed_total", &self.records_consumed_total),
            ("offsets_committed_total", &self.offsets_committed_total),
            ("malformed_payloads_total", &self.malformed_payloads_total),
            ("rebalances_total", &self.rebalances_total),
        ];
        let mut out = String::new();
        for (name, value) in counters {
            out.push_str(&format!("# TYPE weather_relay_{} counter\n", name));
            out.push_str(&format!(
                "weather_relay_{} {}\n",
                name,
                value.load(Ordering::Relaxed)
            ));
        }
        out.push_str("# TYPE weather_relay_flush_latency_p99_ms gauge\n");
        out.push_str(&format!(
            "weather_relay_flush_latency_p99_ms {}\n",
            self.p99_flush_latency_ms()
        ));
        out
    }
}

static OBS: OnceLock<Observability> = OnceLock::new();

pub fn observability() -> &'static Observability {
    OBS.get_or_init(Observability::new)
}
