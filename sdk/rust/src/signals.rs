//! Runtime signal source.
//!
//! The collector does not hook any host globals itself. The host feeds it
//! uncaught errors, rejected tasks, user interactions and visibility changes
//! through a [`SignalSource`].

use tokio::sync::broadcast;

/// A signal raised by the host runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeSignal {
    /// An error escaped application code.
    UncaughtError {
        message: String,
        stack: Option<String>,
        source: Option<String>,
    },
    /// An async task failed and nobody observed the failure.
    UnhandledRejection { reason: String },
    /// A click, submit or similar user action.
    Interaction {
        kind: String,
        data: serde_json::Value,
    },
    /// The host went to the background.
    Hidden,
    /// The host is about to terminate.
    Unload,
}

/// Something the collector can subscribe to for runtime signals.
pub trait SignalSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<RuntimeSignal>;
}

/// Broadcast-backed signal source the host pushes into.
#[derive(Clone)]
pub struct ChannelSignalSource {
    tx: broadcast::Sender<RuntimeSignal>,
}

impl ChannelSignalSource {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a signal. Signals with no subscriber are dropped.
    pub fn emit(&self, signal: RuntimeSignal) {
        let _ = self.tx.send(signal);
    }
}

impl Default for ChannelSignalSource {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SignalSource for ChannelSignalSource {
    fn subscribe(&self) -> broadcast::Receiver<RuntimeSignal> {
        self.tx.subscribe()
    }
}

/// Route panics into `source` as uncaught errors, then run the previous hook.
pub fn install_panic_hook(source: ChannelSignalSource) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "panic".to_string()
        };
        let location = info.location().map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
        let stack = std::backtrace::Backtrace::capture().to_string();

        source.emit(RuntimeSignal::UncaughtError {
            message,
            stack: Some(stack),
            source: location,
        });
        previous(info);
    }));
}
