//! Observability and Metrics
//!
//! Process-wide counters for connections, handshakes, frames and transactions,
//! grouped the way they are reported. Everything is a relaxed atomic; a snapshot is
//! a consistent-enough view for logging, not a transaction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// A monotonically updated `u64`.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Decrement, stopping at zero.
    pub fn decr(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct SessionCounters {
    pub opened: Counter,
    pub active: Counter,
    pub handshakes: Counter,
    pub handshakes_failed: Counter,
    /// Socket-level failures
    pub errors: Counter,
}

#[derive(Debug, Default)]
pub struct FrameCounters {
    pub sent: Counter,
    pub received: Counter,
    pub bytes_sent: Counter,
    pub bytes_received: Counter,
    pub compressed: Counter,
    pub encrypted: Counter,
    /// Decode, checksum or sequencing failures
    pub rejected: Counter,
}

#[derive(Debug, Default)]
pub struct TransactionCounters {
    pub started: Counter,
    pub completed: Counter,
    pub failed: Counter,
    pub timed_out: Counter,
}

/// Global metrics collector for protocol operations
#[derive(Debug)]
pub struct Metrics {
    pub sessions: SessionCounters,
    pub frames: FrameCounters,
    pub transactions: TransactionCounters,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sessions: SessionCounters::default(),
            frames: FrameCounters::default(),
            transactions: TransactionCounters::default(),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.sessions.opened.incr();
        self.sessions.active.incr();
    }

    pub fn connection_closed(&self) {
        self.sessions.active.decr();
    }

    pub fn connection_error(&self) {
        self.sessions.errors.incr();
    }

    pub fn handshake_attempt(&self) {
        self.sessions.handshakes.incr();
    }

    /// A completed handshake is counted by [`Metrics::connection_established`].
    pub fn handshake_success(&self) {
        debug!(handshakes = self.sessions.handshakes.get(), "Handshake completed");
    }

    pub fn handshake_failed(&self) {
        self.sessions.handshakes_failed.incr();
    }

    pub fn message_sent(&self, byte_count: u64) {
        self.frames.sent.incr();
        self.frames.bytes_sent.add(byte_count);
    }

    pub fn message_received(&self, byte_count: u64) {
        self.frames.received.incr();
        self.frames.bytes_received.add(byte_count);
    }

    pub fn frame_compressed(&self) {
        self.frames.compressed.incr();
    }

    pub fn frame_encrypted(&self) {
        self.frames.encrypted.incr();
    }

    pub fn protocol_error(&self) {
        self.frames.rejected.incr();
    }

    pub fn transaction_started(&self) {
        self.transactions.started.incr();
    }

    pub fn transaction_completed(&self) {
        self.transactions.completed.incr();
    }

    pub fn transaction_failed(&self) {
        self.transactions.failed.incr();
    }

    pub fn transaction_timed_out(&self) {
        self.transactions.timed_out.incr();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let s = &self.sessions;
        let f = &self.frames;
        let t = &self.transactions;
        MetricsSnapshot {
            sessions: SessionSnapshot {
                opened: s.opened.get(),
                active: s.active.get(),
                handshakes: s.handshakes.get(),
                handshakes_failed: s.handshakes_failed.get(),
                errors: s.errors.get(),
            },
            frames: FrameSnapshot {
                sent: f.sent.get(),
                received: f.received.get(),
                bytes_sent: f.bytes_sent.get(),
                bytes_received: f.bytes_received.get(),
                compressed: f.compressed.get(),
                encrypted: f.encrypted.get(),
                rejected: f.rejected.get(),
            },
            transactions: TransactionSnapshot {
                started: t.started.get(),
                completed: t.completed.get(),
                failed: t.failed.get(),
                timed_out: t.timed_out.get(),
            },
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Emit one `info!` line with the current counters.
    pub fn log_metrics(&self) {
        let MetricsSnapshot {
            sessions,
            frames,
            transactions,
            uptime_seconds,
        } = self.snapshot();
        info!(
            sessions_active = sessions.active,
            sessions_opened = sessions.opened,
            handshakes_failed = sessions.handshakes_failed,
            frames_sent = frames.sent,
            frames_received = frames.received,
            bytes_sent = frames.bytes_sent,
            bytes_received = frames.bytes_received,
            frames_rejected = frames.rejected,
            transactions_open = transactions.open(),
            transactions_failed = transactions.failed,
            transactions_timed_out = transactions.timed_out,
            uptime_seconds,
            "P7 metrics"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub opened: u64,
    pub active: u64,
    pub handshakes: u64,
    pub handshakes_failed: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub sent: u64,
    pub received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub compressed: u64,
    pub encrypted: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionSnapshot {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

impl TransactionSnapshot {
    /// Transactions neither completed nor failed. Cancelled ones stay counted here.
    pub fn open(&self) -> u64 {
        self.started
            .saturating_sub(self.completed + self.failed + self.timed_out)
    }
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions: SessionSnapshot,
    pub frames: FrameSnapshot,
    pub transactions: TransactionSnapshot,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Logs the elapsed time of an operation when dropped.
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            elapsed_ms = self.start.elapsed().as_millis(),
            "Timed operation finished"
        );
    }
}
