use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Cumulative send counters shared by every worker of one run.
///
/// Every field only grows. Updates are single atomic operations so the
/// send loops never take a lock.
#[derive(Debug, Default)]
pub struct ProducerStats {
    send_request_success: AtomicU64,
    send_request_failed: AtomicU64,
    receive_response_success: AtomicU64,
    receive_response_failed: AtomicU64,
    send_success_rt_total_ms: AtomicU64,
    send_max_rt_ms: AtomicU64,
}

impl ProducerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acknowledged send that took `rt_ms` milliseconds.
    pub fn record_success(&self, rt_ms: u64) {
        self.receive_response_success.fetch_add(1, Ordering::Relaxed);
        self.send_request_success.fetch_add(1, Ordering::Relaxed);
        self.send_success_rt_total_ms
            .fetch_add(rt_ms, Ordering::Relaxed);
        self.update_max_rt(rt_ms);
    }

    pub fn record_send_failed(&self) {
        self.send_request_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_failed(&self) {
        self.receive_response_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Raise the stored maximum to `rt_ms` unless a larger value is already there.
    pub fn update_max_rt(&self, rt_ms: u64) {
        let mut prev = self.send_max_rt_ms.load(Ordering::Relaxed);
        while rt_ms > prev {
            match self.send_max_rt_ms.compare_exchange_weak(
                prev,
                rt_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => prev = current,
            }
        }
    }

    pub fn send_request_success(&self) -> u64 {
        self.send_request_success.load(Ordering::Relaxed)
    }

    pub fn send_request_failed(&self) -> u64 {
        self.send_request_failed.load(Ordering::Relaxed)
    }

    pub fn receive_response_success(&self) -> u64 {
        self.receive_response_success.load(Ordering::Relaxed)
    }

    pub fn receive_response_failed(&self) -> u64 {
        self.receive_response_failed.load(Ordering::Relaxed)
    }

    pub fn send_success_rt_total_ms(&self) -> u64 {
        self.send_success_rt_total_ms.load(Ordering::Relaxed)
    }

    pub fn send_max_rt_ms(&self) -> u64 {
        self.send_max_rt_ms.load(Ordering::Relaxed)
    }

    /// Copy every counter, stamped with `taken_at`.
    ///
    /// Each field is read atomically; the fields are not read as one
    /// transaction.
    pub fn snapshot(&self, taken_at: Instant) -> Snapshot {
        Snapshot {
            counters: Counters {
                send_request_success: self.send_request_success(),
                send_request_failed: self.send_request_failed(),
                receive_response_success: self.receive_response_success(),
                receive_response_failed: self.receive_response_failed(),
                send_success_rt_total_ms: self.send_success_rt_total_ms(),
                send_max_rt_ms: self.send_max_rt_ms(),
            },
            taken_at,
        }
    }
}

/// Plain copy of the counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub send_request_success: u64,
    pub send_request_failed: u64,
    pub receive_response_success: u64,
    pub receive_response_failed: u64,
    pub send_success_rt_total_ms: u64,
    pub send_max_rt_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub counters: Counters,
    pub taken_at: Instant,
}

impl Snapshot {
    pub fn new(counters: Counters, taken_at: Instant) -> Self {
        Self { counters, taken_at }
    }
}

/// Bounded FIFO of snapshots taken from one [`ProducerStats`].
pub struct SnapshotHistory {
    current: Arc<ProducerStats>,
    snapshots: RwLock<VecDeque<Snapshot>>,
    capacity: usize,
}

impl SnapshotHistory {
    pub fn new(current: Arc<ProducerStats>) -> Self {
        Self::with_capacity(current, DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(current: Arc<ProducerStats>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            current,
            snapshots: RwLock::new(VecDeque::with_capacity(capacity + 1)),
            capacity,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.read().len()
    }

    /// Snapshot the live counters now and append the copy.
    pub fn take_snapshot(&self) -> Snapshot {
        let snapshot = self.current.snapshot(Instant::now());
        self.push(snapshot);
        snapshot
    }

    /// Append `snapshot`, evicting the oldest entry once over capacity.
    pub fn push(&self, snapshot: Snapshot) {
        let mut snapshots = self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        snapshots.push_back(snapshot);
        if snapshots.len() > self.capacity {
            snapshots.pop_front();
        }
    }

    /// Report over the full trailing window, or `None` until the history is full.
    pub fn report(&self) -> Option<StatsReport> {
        self.report_over(self.capacity)
    }

    /// Report over whatever window is retained, as long as it spans two snapshots.
    pub fn report_partial(&self) -> Option<StatsReport> {
        self.report_over(2)
    }

    fn report_over(&self, min_len: usize) -> Option<StatsReport> {
        let (oldest, newest) = self.window(min_len)?;
        Some(StatsReport::from_window(
            &oldest,
            &newest,
            self.current.send_max_rt_ms(),
        ))
    }

    /// Oldest and newest snapshot, read under one lock, once at least
    /// `min_len` are retained.
    fn window(&self, min_len: usize) -> Option<(Snapshot, Snapshot)> {
        let snapshots = self.read();
        if snapshots.len() < min_len {
            return None;
        }
        Some((*snapshots.front()?, *snapshots.back()?))
    }

    /// Print the full-window report line, if there is one.
    pub fn print_stati(&self) -> Option<StatsReport> {
        let report = self.report()?;
        println!("{report}");
        Some(report)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, VecDeque<Snapshot>> {
        self.snapshots.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rates derived from the oldest and newest snapshot of a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub send_tps: f64,
    pub max_rt_ms: u64,
    pub average_rt_ms: f64,
    pub send_failed: u64,
    pub response_failed: u64,
    pub total: u64,
    pub window_secs: f64,
}

impl StatsReport {
    /// Throughput and average latency are windowed. The failure counts and
    /// total are cumulative from `newest`; `max_rt_ms` is the live all-time
    /// maximum.
    ///
    /// A window with no successes reports an average of zero, and a window of
    /// zero length reports zero throughput.
    pub fn from_window(oldest: &Snapshot, newest: &Snapshot, max_rt_ms: u64) -> Self {
        let first = &oldest.counters;
        let last = &newest.counters;

        let success_delta = last
            .receive_response_success
            .saturating_sub(first.receive_response_success);
        let rt_delta = last
            .send_success_rt_total_ms
            .saturating_sub(first.send_success_rt_total_ms);
        let window_secs = newest
            .taken_at
            .saturating_duration_since(oldest.taken_at)
            .as_secs_f64();

        let send_tps = if window_secs > 0.0 {
            success_delta as f64 / window_secs
        } else {
            0.0
        };
        let average_rt_ms = if success_delta > 0 {
            rt_delta as f64 / success_delta as f64
        } else {
            0.0
        };

        Self {
            send_tps,
            max_rt_ms,
            average_rt_ms,
            send_failed: last.send_request_failed,
            response_failed: last.receive_response_failed,
            total: last.receive_response_success,
            window_secs,
        }
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Send TPS: {} Max RT: {} Average RT: {:7.3} Send Failed: {} Response Failed: {} Total:{}",
            self.send_tps as u64,
            self.max_rt_ms,
            self.average_rt_ms,
            self.send_failed,
            self.response_failed,
            self.total
        )
    }
}
