//! Progress reporting for archive operations.
//!
//! Each worker owns a handle of atomic counters so recording progress never
//! contends with other workers. Any worker may ask the tracker to emit a
//! status line; emission is gated by the configured interval, so lines
//! appear at a steady rate regardless of how many workers are running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-worker counters, aggregated on demand.
pub struct WorkerCounters {
    bytes: AtomicU64,
    items: AtomicU64,
}

impl WorkerCounters {
    fn new() -> Self {
        Self { bytes: AtomicU64::new(0), items: AtomicU64::new(0) }
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_item(&self) {
        self.items.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of overall progress.
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub total_items: u64,
    pub processed_items: u64,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub elapsed: Duration,
    pub rate_mbps: f64,
    pub percent: f64,
}

pub struct ProgressTracker {
    verb: &'static str,
    interval: Option<Duration>,
    counters: Vec<Arc<WorkerCounters>>,
    total_items: u64,
    total_bytes: u64,
    started: Instant,
    last_emit: Mutex<Instant>,
}

impl ProgressTracker {
    /// `verb` leads each status line, e.g. "Tarred" or "Extracted".
    /// `interval = None` disables output entirely.
    pub fn new(verb: &'static str, workers: usize, interval: Option<Duration>) -> Self {
        Self {
            verb,
            interval,
            counters: (0..workers).map(|_| Arc::new(WorkerCounters::new())).collect(),
            total_items: 0,
            total_bytes: 0,
            started: Instant::now(),
            last_emit: Mutex::new(Instant::now()),
        }
    }

    pub fn set_totals(&mut self, items: u64, bytes: u64) {
        self.total_items = items;
        self.total_bytes = bytes;
    }

    pub fn counters(&self, rank: usize) -> Arc<WorkerCounters> {
        Arc::clone(&self.counters[rank])
    }

    pub fn state(&self) -> ProgressState {
        let (bytes, items) = self.counters.iter().fold((0u64, 0u64), |(b, i), c| {
            (b + c.bytes.load(Ordering::Relaxed), i + c.items.load(Ordering::Relaxed))
        });
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        let rate_mbps = if secs > 0.0 { bytes as f64 / (1024.0 * 1024.0) / secs } else { 0.0 };
        let percent = if self.total_bytes > 0 {
            bytes as f64 * 100.0 / self.total_bytes as f64
        } else {
            0.0
        };
        ProgressState {
            total_items: self.total_items,
            processed_items: items,
            total_bytes: self.total_bytes,
            processed_bytes: bytes,
            elapsed,
            rate_mbps,
            percent,
        }
    }

    /// Emit a status line if the configured interval has passed.
    pub fn maybe_emit(&self) {
        let Some(interval) = self.interval else { return };
        let now = Instant::now();
        {
            let mut last = self.last_emit.lock().unwrap();
            if now.duration_since(*last) < interval {
                return;
            }
            *last = now;
        }
        let st = self.state();
        let secs_left = if st.rate_mbps > 0.0 && st.total_bytes >= st.processed_bytes {
            (st.total_bytes - st.processed_bytes) as f64
                / (st.rate_mbps * 1024.0 * 1024.0)
        } else {
            0.0
        };
        println!(
            "[partar] {} {:.1} MiB ({:.0}%) in {:.3} secs ({:.1} MiB/s) {:.0} secs left ...",
            self.verb,
            st.processed_bytes as f64 / (1024.0 * 1024.0),
            st.percent,
            st.elapsed.as_secs_f64(),
            st.rate_mbps,
            secs_left,
        );
    }

    /// Print the final summary line.
    pub fn finish(&self) {
        if self.interval.is_none() {
            return;
        }
        let st = self.state();
        println!(
            "[partar] {} {} items, {:.1} MiB in {:.3} secs ({:.1} MiB/s) done",
            self.verb,
            st.processed_items,
            st.processed_bytes as f64 / (1024.0 * 1024.0),
            st.elapsed.as_secs_f64(),
            st.rate_mbps,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_aggregate_across_workers() {
        let mut tracker = ProgressTracker::new("Tarred", 2, None);
        tracker.set_totals(4, 4096);
        tracker.counters(0).add_bytes(1024);
        tracker.counters(0).add_item();
        tracker.counters(1).add_bytes(3072);
        tracker.counters(1).add_item();
        let st = tracker.state();
        assert_eq!(st.processed_bytes, 4096);
        assert_eq!(st.processed_items, 2);
        assert!((st.percent - 100.0).abs() < f64::EPSILON);
    }
}
