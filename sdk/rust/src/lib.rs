//! Client SDK for the telemetry pipeline.
//!
//! # Data Flow
//! ```text
//! host runtime signals ─┐
//! instrumented calls ───┼─▶ TelemetryCollector buffers ──flush──▶ Transport ──▶ POST /api/frontend-metrics
//! application records ──┘
//! ```

pub mod collector;
pub mod event;
pub mod instrument;
pub mod signals;
pub mod transport;

pub use collector::{CollectorConfig, CollectorHandle, FlushOutcome, FlushPolicy, StreamCounts, TelemetryCollector};
pub use event::{
    ErrorRecord, MetricKind, PageView, Session, TelemetryBatch, TelemetryEvent, UserInteraction, CORRELATION_HEADER,
};
pub use instrument::{InstrumentedClient, ReauthHandler};
pub use signals::{install_panic_hook, ChannelSignalSource, RuntimeSignal, SignalSource};
pub use transport::{HttpTransport, Transport, TransportError};
