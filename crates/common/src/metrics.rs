use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct ReadMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    pages_fetched: CounterVec,
    page_fetch_seconds: HistogramVec,
    rows_delivered: CounterVec,
    cache_lookups: CounterVec,
    retries: CounterVec,
    stream_workers: CounterVec,
}

impl Default for ReadMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// `backend` is `cache`, `tabledata` or `query_results`.
    pub fn record_page(&self, backend: &str, rows: u64, secs: f64) {
        self.inner
            .pages_fetched
            .with_label_values(&[backend])
            .inc();
        self.inner
            .page_fetch_seconds
            .with_label_values(&[backend])
            .observe(secs);
        self.record_rows("rest", rows);
    }

    /// `mode` is `rest` or `storage`.
    pub fn record_rows(&self, mode: &str, rows: u64) {
        self.inner
            .rows_delivered
            .with_label_values(&[mode])
            .inc_by(rows as f64);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let outcome = if hit { "hit" } else { "miss" };
        self.inner
            .cache_lookups
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_retries(&self, call: &str) {
        self.inner.retries.with_label_values(&[call]).inc();
    }

    /// `event` is `started`, `finished` or `failed`.
    pub fn record_stream_worker(&self, event: &str) {
        self.inner
            .stream_workers
            .with_label_values(&[event])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();
        Self {
            pages_fetched: counter_vec(
                &registry,
                "rowstream_pages_fetched_total",
                "REST pages fetched by backend",
                &["backend"],
            ),
            page_fetch_seconds: histogram_vec(
                &registry,
                "rowstream_page_fetch_seconds",
                "REST page fetch latency by backend",
                &["backend"],
            ),
            rows_delivered: counter_vec(
                &registry,
                "rowstream_rows_delivered_total",
                "Rows made available to iterators by read mode",
                &["mode"],
            ),
            cache_lookups: counter_vec(
                &registry,
                "rowstream_cache_lookups_total",
                "First-page result cache lookups by outcome",
                &["outcome"],
            ),
            retries: counter_vec(
                &registry,
                "rowstream_retries_total",
                "Retried calls by operation",
                &["call"],
            ),
            stream_workers: counter_vec(
                &registry,
                "rowstream_stream_workers_total",
                "Storage stream worker lifecycle events",
                &["event"],
            ),
            registry,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<ReadMetrics> = OnceLock::new();

pub fn global_metrics() -> &'static ReadMetrics {
    GLOBAL_METRICS.get_or_init(ReadMetrics::new)
}
