//! Client telemetry collector.
//!
//! # Responsibilities
//! - Buffer metrics, errors, page views and interactions per session
//! - Flush buffers to the ingestion endpoint on a timer and on signals
//! - Keep buffers intact when delivery fails (bounded, oldest dropped first)
//!
//! # Design Decisions
//! - One flush at a time; a flush started while another is in flight is suppressed
//! - Buffers are only trimmed up to what the acknowledged flush contained, so
//!   entries recorded while a flush is awaiting the network are never lost
//! - Nothing here returns an error to the caller

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::event::{
    new_correlation_id, now_millis, ErrorRecord, MetricKind, PageView, Session, TelemetryBatch,
    TelemetryEvent, UserInteraction,
};
use crate::signals::{RuntimeSignal, SignalSource};
use crate::transport::Transport;

/// What to do with buffered entries when delivery fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Keep entries until the server acknowledges them.
    #[default]
    ClearOnSuccess,
    /// Drop entries after any delivery attempt, successful or not.
    ClearOnAttempt,
}

/// Collector settings.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Period of the background flush timer.
    pub flush_interval: Duration,
    /// Maximum entries retained per stream.
    pub max_backlog: usize,
    pub flush_policy: FlushPolicy,
    /// Reported as `userAgent` on every batch.
    pub user_agent: String,
    /// Initial page URL; updated by page views.
    pub page_url: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
            max_backlog: 500,
            flush_policy: FlushPolicy::ClearOnSuccess,
            user_agent: format!("telemetry-sdk/{}", env!("CARGO_PKG_VERSION")),
            page_url: "/".to_string(),
        }
    }
}

/// Result of one flush call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered.
    Empty,
    /// Another flush was already in flight.
    Suppressed,
    /// Entries were delivered and removed from the buffers.
    Sent { entries: usize },
    /// Delivery failed; entries are still buffered.
    Retained { entries: usize },
    /// Delivery failed and entries were dropped per [`FlushPolicy::ClearOnAttempt`].
    Discarded { entries: usize },
}

/// Number of entries currently buffered per stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCounts {
    pub metrics: usize,
    pub errors: usize,
    pub page_views: usize,
    pub user_interactions: usize,
}

/// Append-only queue with a hard capacity.
///
/// `front_seq` is the sequence number of the oldest retained entry, so a
/// flush can remember how far it read and later drop exactly that prefix.
#[derive(Debug)]
struct Backlog<T> {
    entries: VecDeque<T>,
    front_seq: u64,
    capacity: usize,
    dropped: u64,
}

impl<T: Clone> Backlog<T> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            front_seq: 0,
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    fn push(&mut self, item: T) {
        self.entries.push_back(item);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.front_seq += 1;
            self.dropped += 1;
        }
    }

    fn end_seq(&self) -> u64 {
        self.front_seq + self.entries.len() as u64
    }

    /// Drop every entry with a sequence number below `end`.
    fn acknowledge(&mut self, end: u64) {
        while self.front_seq < end && self.entries.pop_front().is_some() {
            self.front_seq += 1;
        }
    }

    fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

#[derive(Debug)]
struct Buffers {
    metrics: Backlog<TelemetryEvent>,
    errors: Backlog<ErrorRecord>,
    page_views: Backlog<PageView>,
    interactions: Backlog<UserInteraction>,
}

/// Read positions captured when a flush payload was built.
#[derive(Debug, Clone, Copy)]
struct FlushMarks {
    metrics: u64,
    errors: u64,
    page_views: u64,
    interactions: u64,
}

impl Buffers {
    fn new(capacity: usize) -> Self {
        Self {
            metrics: Backlog::new(capacity),
            errors: Backlog::new(capacity),
            page_views: Backlog::new(capacity),
            interactions: Backlog::new(capacity),
        }
    }

    fn is_empty(&self) -> bool {
        self.metrics.entries.is_empty()
            && self.errors.entries.is_empty()
            && self.page_views.entries.is_empty()
            && self.interactions.entries.is_empty()
    }

    fn marks(&self) -> FlushMarks {
        FlushMarks {
            metrics: self.metrics.end_seq(),
            errors: self.errors.end_seq(),
            page_views: self.page_views.end_seq(),
            interactions: self.interactions.end_seq(),
        }
    }

    fn acknowledge(&mut self, marks: FlushMarks) {
        self.metrics.acknowledge(marks.metrics);
        self.errors.acknowledge(marks.errors);
        self.page_views.acknowledge(marks.page_views);
        self.interactions.acknowledge(marks.interactions);
    }

    fn counts(&self) -> StreamCounts {
        StreamCounts {
            metrics: self.metrics.entries.len(),
            errors: self.errors.entries.len(),
            page_views: self.page_views.entries.len(),
            user_interactions: self.interactions.entries.len(),
        }
    }
}

struct Inner {
    session: Mutex<Session>,
    current_url: Mutex<String>,
    buffers: Mutex<Buffers>,
    flushing: AtomicBool,
    transport: Arc<dyn Transport>,
    config: CollectorConfig,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the in-flight flag when the flush finishes or is dropped.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-session telemetry collector.
///
/// Cheap to clone; all clones share the same session and buffers.
#[derive(Clone)]
pub struct TelemetryCollector {
    inner: Arc<Inner>,
}

impl TelemetryCollector {
    pub fn new(transport: Arc<dyn Transport>, config: CollectorConfig) -> Self {
        let current_url = config.page_url.clone();
        Self {
            inner: Arc::new(Inner {
                session: Mutex::new(Session::new()),
                current_url: Mutex::new(current_url),
                buffers: Mutex::new(Buffers::new(config.max_backlog)),
                flushing: AtomicBool::new(false),
                transport,
                config,
            }),
        }
    }

    pub fn session_id(&self) -> String {
        lock(&self.inner.session).session_id().to_string()
    }

    pub fn user_id(&self) -> Option<String> {
        lock(&self.inner.session).user_id().map(str::to_string)
    }

    /// Attach the authenticated user to this session.
    pub fn set_user_id(&self, user_id: impl Into<String>) {
        lock(&self.inner.session).set_user_id(user_id);
    }

    /// Record a metric under a fresh correlation id, which is returned.
    pub fn record_metric(&self, kind: MetricKind, data: serde_json::Value) -> String {
        let correlation_id = new_correlation_id();
        self.record_metric_correlated(kind, data, &correlation_id);
        correlation_id
    }

    /// Record a metric that belongs to an existing correlation chain.
    pub fn record_metric_correlated(&self, kind: MetricKind, data: serde_json::Value, correlation_id: &str) {
        let (session_id, user_id) = {
            let session = lock(&self.inner.session);
            (session.session_id().to_string(), session.user_id().map(str::to_string))
        };
        let event = TelemetryEvent {
            kind,
            data,
            timestamp: now_millis(),
            session_id,
            user_id,
            correlation_id: correlation_id.to_string(),
            url: lock(&self.inner.current_url).clone(),
        };
        lock(&self.inner.buffers).metrics.push(event);
    }

    pub fn record_error(&self, error: ErrorRecord) {
        lock(&self.inner.buffers).errors.push(error);
    }

    /// Record a navigation; later events report `path` as their URL.
    pub fn record_page_view(&self, path: &str) {
        *lock(&self.inner.current_url) = path.to_string();
        let view = PageView {
            path: path.to_string(),
            timestamp: now_millis(),
            correlation_id: new_correlation_id(),
        };
        lock(&self.inner.buffers).page_views.push(view);
    }

    pub fn record_interaction(&self, kind: &str, data: serde_json::Value) {
        let interaction = UserInteraction {
            kind: kind.to_string(),
            data,
            timestamp: now_millis(),
            correlation_id: new_correlation_id(),
        };
        lock(&self.inner.buffers).interactions.push(interaction);
    }

    /// Entries currently buffered.
    pub fn pending(&self) -> StreamCounts {
        lock(&self.inner.buffers).counts()
    }

    /// Entries dropped so far because a stream hit its backlog limit.
    pub fn dropped(&self) -> u64 {
        let buffers = lock(&self.inner.buffers);
        buffers.metrics.dropped + buffers.errors.dropped + buffers.page_views.dropped + buffers.interactions.dropped
    }

    /// Deliver buffered entries.
    ///
    /// With `is_unloading` the transport's fire-and-forget path is used and
    /// the buffers are cleared once the payload is handed off.
    pub async fn flush(&self, is_unloading: bool) -> FlushOutcome {
        let Some(_guard) = FlushGuard::acquire(&self.inner.flushing) else {
            tracing::debug!("Flush already in progress, skipping");
            return FlushOutcome::Suppressed;
        };

        let (batch, marks) = {
            let buffers = lock(&self.inner.buffers);
            if buffers.is_empty() {
                return FlushOutcome::Empty;
            }
            let session = lock(&self.inner.session);
            let batch = TelemetryBatch {
                session_id: session.session_id().to_string(),
                user_id: session.user_id().map(str::to_string),
                metrics: buffers.metrics.to_vec(),
                errors: buffers.errors.to_vec(),
                page_views: buffers.page_views.to_vec(),
                user_interactions: buffers.interactions.to_vec(),
                user_agent: self.inner.config.user_agent.clone(),
                url: lock(&self.inner.current_url).clone(),
            };
            (batch, buffers.marks())
        };
        let entries = batch.len();

        let result = if is_unloading {
            self.inner.transport.send_beacon(batch)
        } else {
            self.inner.transport.send(&batch).await
        };

        match result {
            Ok(()) => {
                lock(&self.inner.buffers).acknowledge(marks);
                tracing::debug!(entries, is_unloading, "Telemetry flushed");
                FlushOutcome::Sent { entries }
            }
            Err(e) => match self.inner.config.flush_policy {
                FlushPolicy::ClearOnSuccess => {
                    tracing::warn!(error = %e, entries, "Telemetry flush failed, retaining buffers");
                    FlushOutcome::Retained { entries }
                }
                FlushPolicy::ClearOnAttempt => {
                    lock(&self.inner.buffers).acknowledge(marks);
                    tracing::warn!(error = %e, entries, "Telemetry flush failed, discarding buffers");
                    FlushOutcome::Discarded { entries }
                }
            },
        }
    }

    /// React to one runtime signal.
    pub async fn handle_signal(&self, signal: RuntimeSignal) {
        match signal {
            RuntimeSignal::UncaughtError { message, stack, source } => {
                let mut record = ErrorRecord::new("uncaught_error", message)
                    .with_context(serde_json::json!({ "source": source }));
                record.stack = stack;
                self.record_error(record);
            }
            RuntimeSignal::UnhandledRejection { reason } => {
                self.record_error(ErrorRecord::new("unhandled_rejection", reason));
            }
            RuntimeSignal::Interaction { kind, data } => {
                self.record_interaction(&kind, data);
            }
            RuntimeSignal::Hidden => {
                self.flush(false).await;
            }
            RuntimeSignal::Unload => {
                self.flush(true).await;
            }
        }
    }

    /// Start the flush timer and subscribe to `signals`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, signals: &dyn SignalSource) -> CollectorHandle {
        let (shutdown_tx, _) = broadcast::channel(1);

        let timer = {
            let collector = self.clone();
            let mut shutdown = shutdown_tx.subscribe();
            let period = self.inner.config.flush_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => break,
                        _ = ticker.tick() => {
                            collector.flush(false).await;
                        }
                    }
                }
            })
        };

        let listener = {
            let collector = self.clone();
            let mut shutdown = shutdown_tx.subscribe();
            let mut rx = signals.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => break,
                        signal = rx.recv() => match signal {
                            Ok(signal) => collector.handle_signal(signal).await,
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                tracing::warn!(missed, "Runtime signal listener lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            })
        };

        tracing::debug!(session_id = %self.session_id(), "Telemetry collector started");

        CollectorHandle {
            collector: self.clone(),
            shutdown_tx,
            tasks: vec![timer, listener],
        }
    }
}

/// Running collector tasks.
pub struct CollectorHandle {
    collector: TelemetryCollector,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl CollectorHandle {
    pub fn collector(&self) -> &TelemetryCollector {
        &self.collector
    }

    /// Stop background tasks and hand off whatever is still buffered.
    pub async fn stop(self) -> FlushOutcome {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
        self.collector.flush(true).await
    }
}
