//! Event logging facade.
//!
//! The runtime emits events at six levels with a monotonically increasing
//! sequence number. The sink is pluggable: the default forwards to the
//! `tracing` subscriber the binary installs, test code captures events in
//! memory. The facade is a service owned by the process root and passed
//! down by handle; there is no global logger state beyond the `tracing`
//! dispatcher itself.
//!
//! The [`RateLimiter`] implements the flood-guard contract: per error-kind
//! tag, the first event in a window is logged and subsequent ones are
//! suppressed until the window elapses. Suppression counts are reported
//! when the window reopens.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Event severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

/// One emitted event, as handed to the sink.
#[derive(Debug, Clone)]
pub struct Event {
    /// Monotonic sequence number, unique per facade instance.
    pub seq: u64,
    /// Severity.
    pub level: Level,
    /// Subsystem tag (stable, lowercase).
    pub subsystem: &'static str,
    /// Message text.
    pub message: String,
}

/// Pluggable event destination.
pub trait LogSink: Send + Sync {
    /// Deliver one event. Must not block.
    fn emit(&self, event: &Event);
}

/// Default sink: forward to the installed `tracing` subscriber.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, event: &Event) {
        match event.level {
            Level::Trace => {
                tracing::trace!(seq = event.seq, subsystem = event.subsystem, "{}", event.message);
            }
            Level::Debug => {
                tracing::debug!(seq = event.seq, subsystem = event.subsystem, "{}", event.message);
            }
            Level::Info => {
                tracing::info!(seq = event.seq, subsystem = event.subsystem, "{}", event.message);
            }
            Level::Warning => {
                tracing::warn!(seq = event.seq, subsystem = event.subsystem, "{}", event.message);
            }
            Level::Error | Level::Fatal => {
                tracing::error!(seq = event.seq, subsystem = event.subsystem, "{}", event.message);
            }
        }
    }
}

/// Event facade with a monotonically increasing sequence number.
pub struct EventLog {
    seq: AtomicU64,
    sink: Box<dyn LogSink>,
}

impl EventLog {
    /// Create a facade over the given sink.
    pub fn new(sink: Box<dyn LogSink>) -> Self {
        Self {
            seq: AtomicU64::new(0),
            sink,
        }
    }

    /// Facade over the default tracing sink.
    pub fn to_tracing() -> Self {
        Self::new(Box::new(TracingSink))
    }

    /// Emit one event; returns its sequence number.
    pub fn emit(&self, level: Level, subsystem: &'static str, message: impl Into<String>) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.sink.emit(&Event {
            seq,
            level,
            subsystem,
            message: message.into(),
        });
        seq
    }

    /// Next sequence number that would be assigned.
    pub fn next_seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }
}

// ─── Rate limiter ───────────────────────────────────────────────────

/// Per-tag suppression record.
#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    suppressed: u64,
}

/// Decision returned by [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Log this event. Carries the number of events suppressed since the
    /// tag was last logged.
    Log { suppressed: u64 },
    /// Drop this event silently.
    Suppress,
}

/// Shared, structured flood guard addressable by error-kind tag.
///
/// The first event for a tag is always logged; further events for the
/// same tag are suppressed until the window elapses.
pub struct RateLimiter {
    window: Duration,
    tags: Mutex<HashMap<&'static str, Window>>,
}

impl RateLimiter {
    /// Create a limiter with the given suppression window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            tags: Mutex::new(HashMap::new()),
        }
    }

    /// Gate one event for `tag` at `now`.
    pub fn check_at(&self, tag: &'static str, now: Instant) -> Gate {
        let mut tags = self.tags.lock().expect("rate limiter lock poisoned");
        match tags.get_mut(tag) {
            None => {
                tags.insert(
                    tag,
                    Window {
                        opened: now,
                        suppressed: 0,
                    },
                );
                Gate::Log { suppressed: 0 }
            }
            Some(w) if now.duration_since(w.opened) >= self.window => {
                let suppressed = w.suppressed;
                w.opened = now;
                w.suppressed = 0;
                Gate::Log { suppressed }
            }
            Some(w) => {
                w.suppressed += 1;
                Gate::Suppress
            }
        }
    }

    /// Gate one event for `tag` now.
    pub fn check(&self, tag: &'static str) -> Gate {
        self.check_at(tag, Instant::now())
    }
}
