//! Request metrics aggregation.
//!
//! # Responsibilities
//! - Count requests by (method, route, status)
//! - Track duration and size distributions in fixed buckets
//! - Keep a bounded window of recent durations for percentile queries
//! - Track requests in flight and a bounded set of named business counters
//! - Mirror every update into a per-server Prometheus recorder for exposition
//!
//! # Design Decisions
//! - One `DashMap` entry per label set; updates inside an entry are atomic,
//!   so unrelated label combinations never contend on a shared lock
//! - In-flight accounting is tied to a guard, released on every exit path
//! - The sample window is the only mutex and is held for O(1) per insert
//! - The recorder is owned by the aggregator, not installed globally, so
//!   several servers in one process keep separate series

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use serde::Serialize;

use crate::config::MetricsConfig;

/// Status recorded when a request guard is dropped before it was finished,
/// e.g. because the client went away and the handler future was cancelled.
pub const ABANDONED_STATUS: u16 = 499;

/// Labels identifying one request series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestLabels {
    pub method: String,
    pub route: String,
    pub status: u16,
}

/// Fixed-bucket histogram with atomic counters.
#[derive(Debug)]
pub struct AtomicHistogram {
    bounds: Arc<[f64]>,
    /// One slot per bound plus the trailing `+Inf` slot.
    buckets: Box<[AtomicU64]>,
    count: AtomicU64,
    sum_bits: AtomicU64,
}

impl AtomicHistogram {
    pub fn new(bounds: Arc<[f64]>) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn observe(&self, value: f64) {
        let idx = self.bounds.iter().position(|b| value <= *b).unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self.sum_bits.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            Some((f64::from_bits(bits) + value).to_bits())
        });
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = 0;
        let buckets = self
            .buckets
            .iter()
            .map(|b| {
                cumulative += b.load(Ordering::Relaxed);
                cumulative
            })
            .collect();
        HistogramSnapshot {
            bounds: self.bounds.to_vec(),
            cumulative: buckets,
            count: self.count.load(Ordering::Relaxed),
            sum: f64::from_bits(self.sum_bits.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of a histogram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    /// Upper bounds; the implicit last bucket is `+Inf`.
    pub bounds: Vec<f64>,
    /// Cumulative counts, one per bound plus `+Inf`.
    pub cumulative: Vec<u64>,
    pub count: u64,
    pub sum: f64,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Bounded window of the most recent samples.
#[derive(Debug)]
pub struct SampleWindow {
    samples: Mutex<VecDeque<f64>>,
    capacity: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    /// Append a sample, dropping the oldest ones beyond capacity.
    pub fn push(&self, value: f64) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.push_back(value);
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    pub fn to_vec(&self) -> Vec<f64> {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.iter().copied().collect()
    }
}

/// Nearest-rank percentile: sort ascending, take index `ceil(p/100 × n) − 1`.
pub fn percentile(samples: &[f64], p: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let rank = (p * n as f64 / 100.0).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    Some(sorted[idx])
}

#[derive(Debug)]
struct SeriesStats {
    count: AtomicU64,
    duration: AtomicHistogram,
    response_size: AtomicHistogram,
}

/// Business counter that absorbs names past the cap or with unusable names.
pub const OVERFLOW_EVENT: &str = "other";

/// Longest business event name kept as its own counter.
pub const MAX_EVENT_NAME_LEN: usize = 64;

/// Exposition names, all sharing the service prefix.
#[derive(Debug, Clone)]
struct MetricNames {
    requests_total: String,
    request_duration: String,
    request_size: String,
    response_size: String,
    active_requests: String,
    business_events: String,
}

impl MetricNames {
    fn new(prefix: &str) -> Self {
        Self {
            requests_total: format!("{prefix}_http_requests_total"),
            request_duration: format!("{prefix}_http_request_duration_seconds"),
            request_size: format!("{prefix}_http_request_size_bytes"),
            response_size: format!("{prefix}_http_response_size_bytes"),
            active_requests: format!("{prefix}_active_requests"),
            business_events: format!("{prefix}_business_events_total"),
        }
    }
}

/// Build a recorder that exports the duration and size distributions as
/// histograms with the configured buckets.
fn build_recorder(names: &MetricNames, config: &MetricsConfig) -> PrometheusRecorder {
    let layouts = [
        (&names.request_duration, &config.duration_buckets),
        (&names.request_size, &config.size_buckets),
        (&names.response_size, &config.size_buckets),
    ];
    let builder = layouts
        .into_iter()
        .filter(|(_, buckets)| !buckets.is_empty())
        .try_fold(PrometheusBuilder::new(), |builder, (name, buckets)| {
            builder.set_buckets_for_metric(Matcher::Full(name.clone()), buckets)
        });

    let recorder = match builder {
        Ok(builder) => builder.build_recorder(),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid histogram buckets, exporting summaries instead");
            PrometheusBuilder::new().build_recorder()
        }
    };

    metrics::with_local_recorder(&recorder, || {
        describe_counter!(names.requests_total.clone(), "Total HTTP requests");
        describe_histogram!(names.request_duration.clone(), Unit::Seconds, "HTTP request duration in seconds");
        describe_histogram!(names.request_size.clone(), Unit::Bytes, "HTTP request size in bytes");
        describe_histogram!(names.response_size.clone(), Unit::Bytes, "HTTP response size in bytes");
        describe_gauge!(names.active_requests.clone(), "Number of requests in flight");
        describe_counter!(names.business_events.clone(), "Named business counters");
    });
    recorder
}

/// Shared request metrics accumulator.
pub struct MetricsAggregator {
    series: DashMap<RequestLabels, Arc<SeriesStats>>,
    request_sizes: DashMap<(String, String), Arc<AtomicHistogram>>,
    business: DashMap<String, AtomicU64>,
    /// Distinct business names admitted, excluding [`OVERFLOW_EVENT`].
    business_names: AtomicUsize,
    max_business_events: usize,
    in_flight: AtomicI64,
    window: SampleWindow,
    duration_bounds: Arc<[f64]>,
    size_bounds: Arc<[f64]>,
    names: MetricNames,
    recorder: PrometheusRecorder,
    exporter: PrometheusHandle,
}

impl fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("series", &self.series.len())
            .field("business", &self.business.len())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl MetricsAggregator {
    /// Create an aggregator whose exposition names start with `prefix`.
    pub fn new(config: &MetricsConfig, prefix: &str) -> Self {
        let names = MetricNames::new(prefix);
        let recorder = build_recorder(&names, config);
        let exporter = recorder.handle();
        Self {
            series: DashMap::new(),
            request_sizes: DashMap::new(),
            business: DashMap::new(),
            business_names: AtomicUsize::new(0),
            max_business_events: config.max_business_events,
            in_flight: AtomicI64::new(0),
            window: SampleWindow::new(config.sample_window),
            duration_bounds: config.duration_buckets.clone().into(),
            size_bounds: config.size_buckets.clone().into(),
            names,
            recorder,
            exporter,
        }
    }

    /// Prometheus text exposition of every request series and business counter.
    pub fn render_prometheus(&self) -> String {
        self.exporter.render()
    }

    /// Begin tracking a request. The returned guard must be finished with the
    /// response status; dropping it unfinished records [`ABANDONED_STATUS`].
    pub fn start_request(self: &Arc<Self>, method: &str, route: &str, request_size: Option<u64>) -> RequestGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Some(size) = request_size {
            let histogram = self
                .request_sizes
                .entry((method.to_string(), route.to_string()))
                .or_insert_with(|| Arc::new(AtomicHistogram::new(self.size_bounds.clone())))
                .clone();
            histogram.observe(size as f64);
        }
        metrics::with_local_recorder(&self.recorder, || {
            gauge!(self.names.active_requests.clone()).increment(1.0);
            if let Some(size) = request_size {
                histogram!(
                    self.names.request_size.clone(),
                    "method" => method.to_string(),
                    "route" => route.to_string()
                )
                .record(size as f64);
            }
        });
        RequestGuard {
            aggregator: self.clone(),
            method: method.to_string(),
            route: route.to_string(),
            started: Instant::now(),
            finished: false,
        }
    }

    fn complete(&self, labels: RequestLabels, duration: Duration, response_size: Option<u64>) {
        let exported = [
            ("method", labels.method.clone()),
            ("route", labels.route.clone()),
            ("status_code", labels.status.to_string()),
        ];
        let stats = self
            .series
            .entry(labels)
            .or_insert_with(|| {
                Arc::new(SeriesStats {
                    count: AtomicU64::new(0),
                    duration: AtomicHistogram::new(self.duration_bounds.clone()),
                    response_size: AtomicHistogram::new(self.size_bounds.clone()),
                })
            })
            .clone();

        let secs = duration.as_secs_f64();
        stats.count.fetch_add(1, Ordering::Relaxed);
        stats.duration.observe(secs);
        if let Some(size) = response_size {
            stats.response_size.observe(size as f64);
        }
        self.window.push(secs);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        metrics::with_local_recorder(&self.recorder, || {
            counter!(self.names.requests_total.clone(), &exported).increment(1);
            histogram!(self.names.request_duration.clone(), &exported).record(secs);
            if let Some(size) = response_size {
                histogram!(self.names.response_size.clone(), &exported).record(size as f64);
            }
            gauge!(self.names.active_requests.clone()).decrement(1.0);
        });
    }

    /// Increment a named business counter.
    ///
    /// At most `max_business_events` distinct names are tracked. Later names,
    /// and names that are empty, longer than [`MAX_EVENT_NAME_LEN`] or carry
    /// control characters, are counted under [`OVERFLOW_EVENT`]. Returns the
    /// counter name that was incremented.
    pub fn increment_business<'a>(&self, name: &'a str, by: u64) -> &'a str {
        let key = if usable_event_name(name) && self.admit_business(name) {
            name
        } else {
            OVERFLOW_EVENT
        };

        match self.business.get(key) {
            Some(counter) => {
                counter.fetch_add(by, Ordering::Relaxed);
            }
            None => {
                self.business
                    .entry(key.to_string())
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(by, Ordering::Relaxed);
            }
        }
        metrics::with_local_recorder(&self.recorder, || {
            counter!(self.names.business_events.clone(), "event" => key.to_string()).increment(by);
        });
        key
    }

    /// Reserve a slot for `name` unless the cap is reached.
    fn admit_business(&self, name: &str) -> bool {
        if name == OVERFLOW_EVENT || self.business.contains_key(name) {
            return true;
        }
        match self.business.entry(name.to_string()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                let max = self.max_business_events;
                let reserved = self
                    .business_names
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
                    .is_ok();
                if reserved {
                    slot.insert(AtomicU64::new(0));
                }
                reserved
            }
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Copy every counter, histogram and gauge, plus derived statistics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut requests: Vec<SeriesSnapshot> = self
            .series
            .iter()
            .map(|entry| SeriesSnapshot {
                labels: entry.key().clone(),
                count: entry.value().count.load(Ordering::Relaxed),
                duration_seconds: entry.value().duration.snapshot(),
                response_size_bytes: entry.value().response_size.snapshot(),
            })
            .collect();
        requests.sort_by(|a, b| a.labels.cmp(&b.labels));

        let mut request_sizes: Vec<RequestSizeSnapshot> = self
            .request_sizes
            .iter()
            .map(|entry| RequestSizeSnapshot {
                method: entry.key().0.clone(),
                route: entry.key().1.clone(),
                size_bytes: entry.value().snapshot(),
            })
            .collect();
        request_sizes.sort_by(|a, b| (&a.method, &a.route).cmp(&(&b.method, &b.route)));

        let business: BTreeMap<String, u64> = self
            .business
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        let total_requests: u64 = requests.iter().map(|s| s.count).sum();
        let total_seconds: f64 = requests.iter().map(|s| s.duration_seconds.sum).sum();
        let window = self.window.to_vec();

        MetricsSnapshot {
            requests,
            request_sizes,
            in_flight: self.in_flight(),
            business,
            total_requests,
            average_duration_seconds: (total_requests > 0).then(|| total_seconds / total_requests as f64),
            p50_duration_seconds: percentile(&window, 50.0),
            p95_duration_seconds: percentile(&window, 95.0),
            p99_duration_seconds: percentile(&window, 99.0),
        }
    }
}

fn usable_event_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_EVENT_NAME_LEN && !name.chars().any(char::is_control)
}

/// Scoped in-flight accounting for one request.
#[derive(Debug)]
pub struct RequestGuard {
    aggregator: Arc<MetricsAggregator>,
    method: String,
    route: String,
    started: Instant,
    finished: bool,
}

impl RequestGuard {
    /// Record completion with the response status and size.
    pub fn finish(mut self, status: u16, response_size: Option<u64>) {
        self.record(status, response_size);
    }

    fn record(&mut self, status: u16, response_size: Option<u64>) {
        if self.finished {
            return;
        }
        self.finished = true;
        let labels = RequestLabels {
            method: std::mem::take(&mut self.method),
            route: std::mem::take(&mut self.route),
            status,
        };
        self.aggregator.complete(labels, self.started.elapsed(), response_size);
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.record(ABANDONED_STATUS, None);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    #[serde(flatten)]
    pub labels: RequestLabels,
    pub count: u64,
    pub duration_seconds: HistogramSnapshot,
    pub response_size_bytes: HistogramSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestSizeSnapshot {
    pub method: String,
    pub route: String,
    pub size_bytes: HistogramSnapshot,
}

/// Point-in-time view of all request metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: Vec<SeriesSnapshot>,
    pub request_sizes: Vec<RequestSizeSnapshot>,
    pub in_flight: i64,
    pub business: BTreeMap<String, u64>,
    pub total_requests: u64,
    pub average_duration_seconds: Option<f64>,
    pub p50_duration_seconds: Option<f64>,
    pub p95_duration_seconds: Option<f64>,
    pub p99_duration_seconds: Option<f64>,
}

impl MetricsSnapshot {
    /// Request count for one label set, 0 if never seen.
    pub fn request_count(&self, method: &str, route: &str, status: u16) -> u64 {
        self.requests
            .iter()
            .find(|s| s.labels.method == method && s.labels.route == route && s.labels.status == status)
            .map(|s| s.count)
            .unwrap_or(0)
    }
}
