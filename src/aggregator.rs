//! Live statistics for a running test.
//!
//! All pipelines feed one bounded queue; a single aggregator task folds the
//! records into [`LiveStats`] and republishes them on the event bus. Live
//! progress uses cheap streaming estimates (an EWMA for throughput, a P²
//! marker estimator for p95); the terminal summary recomputes percentiles
//! exactly from a uniform reservoir of samples.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::event::{EngineEvent, EventBus};
use crate::report::{ProgressSnapshot, RequestRecord, TestSummary, TimeBucket};
use crate::{EWMA_HORIZON_SECS, PROGRESS_INTERVAL, RESERVOIR_CAPACITY};

// ---------------------------------------------------------------------------
// P² streaming quantile
// ---------------------------------------------------------------------------

/// The P² algorithm (Jain & Chlamtac): tracks one quantile with five markers
/// and no sample retention.
#[derive(Debug)]
struct P2Quantile {
    p: f64,
    count: u64,
    /// Marker heights.
    q: [f64; 5],
    /// Actual marker positions (1-based).
    n: [f64; 5],
    /// Desired marker positions.
    np: [f64; 5],
    /// Desired position increments per observation.
    dnp: [f64; 5],
    /// Holds the first five observations until the markers initialise.
    initial: Vec<f64>,
}

impl P2Quantile {
    fn new(p: f64) -> Self {
        Self {
            p,
            count: 0,
            q: [0.0; 5],
            n: [0.0; 5],
            np: [0.0; 5],
            dnp: [0.0, p / 2.0, p, (1.0 + p) / 2.0, 1.0],
            initial: Vec::with_capacity(5),
        }
    }

    fn observe(&mut self, x: f64) {
        self.count += 1;
        if self.count <= 5 {
            self.initial.push(x);
            if self.count == 5 {
                self.initial.sort_by(f64::total_cmp);
                for (i, v) in self.initial.iter().enumerate() {
                    self.q[i] = *v;
                    self.n[i] = (i + 1) as f64;
                }
                let p = self.p;
                self.np = [1.0, 1.0 + 2.0 * p, 1.0 + 4.0 * p, 3.0 + 2.0 * p, 5.0];
            }
            return;
        }

        // Locate the cell and stretch the extreme markers.
        let k = if x < self.q[0] {
            self.q[0] = x;
            0
        } else if x >= self.q[4] {
            self.q[4] = x.max(self.q[4]);
            3
        } else {
            let mut k = 0;
            for i in 0..4 {
                if self.q[i] <= x && x < self.q[i + 1] {
                    k = i;
                    break;
                }
            }
            k
        };

        for i in (k + 1)..5 {
            self.n[i] += 1.0;
        }
        for i in 0..5 {
            self.np[i] += self.dnp[i];
        }

        // Nudge interior markers toward their desired positions.
        for i in 1..4 {
            let d = self.np[i] - self.n[i];
            if (d >= 1.0 && self.n[i + 1] - self.n[i] > 1.0)
                || (d <= -1.0 && self.n[i - 1] - self.n[i] < -1.0)
            {
                let d = d.signum();
                let candidate = self.parabolic(i, d);
                self.q[i] = if self.q[i - 1] < candidate && candidate < self.q[i + 1] {
                    candidate
                } else {
                    self.linear(i, d)
                };
                self.n[i] += d;
            }
        }
    }

    fn parabolic(&self, i: usize, d: f64) -> f64 {
        let q = &self.q;
        let n = &self.n;
        q[i] + d / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + d) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - d) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    fn linear(&self, i: usize, d: f64) -> f64 {
        let j = if d > 0.0 { i + 1 } else { i - 1 };
        self.q[i] + d * (self.q[j] - self.q[i]) / (self.n[j] - self.n[i])
    }

    fn value(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        if self.count < 5 {
            let mut sorted = self.initial.clone();
            sorted.sort_by(f64::total_cmp);
            let idx = ((self.p * sorted.len() as f64).ceil() as usize)
                .saturating_sub(1)
                .min(sorted.len() - 1);
            return sorted[idx];
        }
        self.q[2]
    }
}

// ---------------------------------------------------------------------------
// EWMA throughput
// ---------------------------------------------------------------------------

/// Requests-per-second smoothed over a fixed time horizon. Updated once per
/// progress tick from the delta of completed requests.
#[derive(Debug)]
struct EwmaRate {
    horizon_secs: f64,
    value: f64,
    primed: bool,
}

impl EwmaRate {
    fn new(horizon_secs: f64) -> Self {
        Self {
            horizon_secs,
            value: 0.0,
            primed: false,
        }
    }

    fn update(&mut self, delta: u64, dt_secs: f64) {
        if dt_secs <= 1e-6 {
            return;
        }
        let instantaneous = delta as f64 / dt_secs;
        if self.primed {
            let alpha = 1.0 - (-dt_secs / self.horizon_secs).exp();
            self.value += alpha * (instantaneous - self.value);
        } else {
            self.value = instantaneous;
            self.primed = true;
        }
    }
}

// ---------------------------------------------------------------------------
// Uniform reservoir
// ---------------------------------------------------------------------------

/// Keeps an unbiased sample of response times. Below capacity it holds every
/// observation, so small runs get exact percentiles.
#[derive(Debug)]
struct Reservoir {
    capacity: usize,
    seen: u64,
    samples: Vec<u64>,
    rng: StdRng,
}

impl Reservoir {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: 0,
            samples: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    fn push(&mut self, value: u64) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(value);
        } else {
            let j = self.rng.gen_range(0..self.seen);
            if (j as usize) < self.capacity {
                self.samples[j as usize] = value;
            }
        }
    }

    /// Exact percentile over the retained samples. `p` in (0, 100].
    fn percentile(&self, p: f64) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = ((p / 100.0 * sorted.len() as f64).ceil() as usize)
            .saturating_sub(1)
            .min(sorted.len() - 1);
        sorted[idx]
    }
}

// ---------------------------------------------------------------------------
// LiveStats
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct BucketAccum {
    requests: u64,
    errors: u64,
    sum_ms: u64,
    min_ms: u64,
    max_ms: u64,
}

/// The single-writer fold state for one run.
#[derive(Debug)]
pub struct LiveStats {
    total_requests: u64,
    total_errors: u64,
    sum_ms: u64,
    min_ms: u64,
    max_ms: u64,
    total_bytes: u64,
    p95: P2Quantile,
    reservoir: Reservoir,
    rps: EwmaRate,
    rate_marker: (u64, Instant),
    start: Instant,
    started_at: DateTime<Utc>,
    /// Set once the run is over so elapsed time stops advancing.
    finished: Option<Instant>,
    buckets: BTreeMap<u64, BucketAccum>,
}

impl LiveStats {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            total_requests: 0,
            total_errors: 0,
            sum_ms: 0,
            min_ms: u64::MAX,
            max_ms: 0,
            total_bytes: 0,
            p95: P2Quantile::new(0.95),
            reservoir: Reservoir::new(RESERVOIR_CAPACITY),
            rps: EwmaRate::new(EWMA_HORIZON_SECS),
            rate_marker: (0, now),
            start: now,
            started_at: Utc::now(),
            finished: None,
            buckets: BTreeMap::new(),
        }
    }

    /// Freeze the elapsed clock. Called once when the run winds down.
    pub fn finish(&mut self) {
        self.finished.get_or_insert_with(Instant::now);
    }

    fn elapsed_ms(&self) -> u64 {
        let end = self.finished.unwrap_or_else(Instant::now);
        end.duration_since(self.start).as_millis() as u64
    }

    /// Fold in one finished request.
    pub fn record(&mut self, elapsed_ms: u64, success: bool, size_bytes: u64) {
        self.total_requests += 1;
        if !success {
            self.total_errors += 1;
        }
        self.sum_ms += elapsed_ms;
        self.min_ms = self.min_ms.min(elapsed_ms);
        self.max_ms = self.max_ms.max(elapsed_ms);
        self.total_bytes += size_bytes;
        self.p95.observe(elapsed_ms as f64);
        self.reservoir.push(elapsed_ms);

        let bucket = self
            .buckets
            .entry(self.start.elapsed().as_secs())
            .or_insert(BucketAccum {
                min_ms: u64::MAX,
                ..Default::default()
            });
        bucket.requests += 1;
        if !success {
            bucket.errors += 1;
        }
        bucket.sum_ms += elapsed_ms;
        bucket.min_ms = bucket.min_ms.min(elapsed_ms);
        bucket.max_ms = bucket.max_ms.max(elapsed_ms);
    }

    /// Advance the throughput EWMA. Called once per progress tick.
    pub fn tick_rate(&mut self) {
        let now = Instant::now();
        let (last_count, last_at) = self.rate_marker;
        let dt = now.duration_since(last_at).as_secs_f64();
        if dt <= 1e-6 {
            return;
        }
        self.rps.update(self.total_requests - last_count, dt);
        self.rate_marker = (self.total_requests, now);
    }

    pub fn snapshot(&self, active_vus: u32) -> ProgressSnapshot {
        let mean_ms = if self.total_requests > 0 {
            self.sum_ms as f64 / self.total_requests as f64
        } else {
            0.0
        };
        ProgressSnapshot {
            completed_requests: self.total_requests,
            total_errors: self.total_errors,
            active_vus,
            elapsed_ms: self.elapsed_ms(),
            current_rps: self.rps.value,
            mean_ms,
            p95_ms: self.p95.value().round() as u64,
            min_ms: if self.min_ms == u64::MAX { 0 } else { self.min_ms },
            max_ms: self.max_ms,
        }
    }

    pub fn summary(&self, plan_id: Uuid, plan_name: String) -> TestSummary {
        let finished_at = Utc::now();
        let total = self.total_requests;
        let failed = self.total_errors;
        let mean = if total > 0 {
            self.sum_ms as f64 / total as f64
        } else {
            0.0
        };
        let elapsed_secs = (finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        let rps = if elapsed_secs > 0.0 {
            total as f64 / elapsed_secs
        } else {
            0.0
        };

        TestSummary {
            plan_id,
            plan_name,
            started_at: self.started_at,
            finished_at,
            total_requests: total,
            successful_requests: total.saturating_sub(failed),
            failed_requests: failed,
            min_response_ms: if self.min_ms == u64::MAX { 0 } else { self.min_ms },
            max_response_ms: self.max_ms,
            mean_response_ms: mean,
            p50_response_ms: self.reservoir.percentile(50.0),
            p95_response_ms: self.reservoir.percentile(95.0),
            p99_response_ms: self.reservoir.percentile(99.0),
            requests_per_second: rps,
            total_bytes_received: self.total_bytes,
        }
    }

    pub fn time_series(&self) -> Vec<TimeBucket> {
        self.buckets
            .iter()
            .map(|(&second, b)| TimeBucket {
                second,
                requests: b.requests,
                errors: b.errors,
                avg_ms: if b.requests > 0 {
                    b.sum_ms as f64 / b.requests as f64
                } else {
                    0.0
                },
                min_ms: if b.min_ms == u64::MAX { 0 } else { b.min_ms },
                max_ms: b.max_ms,
            })
            .collect()
    }
}

impl Default for LiveStats {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Aggregator task
// ---------------------------------------------------------------------------

/// Drain the result queue into `stats`, forwarding each record to the bus
/// and publishing a progress snapshot on every tick. Runs until every
/// sender is gone and the queue is empty.
pub(crate) async fn run(
    mut results: mpsc::Receiver<RequestRecord>,
    stats: Arc<Mutex<LiveStats>>,
    active_vus: Arc<AtomicU32>,
    bus: EventBus,
) {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = results.recv() => match maybe {
                Some(record) => {
                    {
                        let mut stats = stats.lock().expect("stats lock poisoned");
                        stats.record(record.elapsed_ms, record.is_success(), record.size_bytes);
                    }
                    bus.publish(EngineEvent::Result(Box::new(record)));
                }
                None => break,
            },
            _ = ticker.tick() => {
                let snapshot = {
                    let mut stats = stats.lock().expect("stats lock poisoned");
                    stats.tick_rate();
                    stats.snapshot(active_vus.load(Ordering::Relaxed))
                };
                bus.publish(EngineEvent::Progress(snapshot));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2_small_counts_are_exact() {
        let mut q = P2Quantile::new(0.95);
        assert_eq!(q.value(), 0.0);
        q.observe(30.0);
        assert_eq!(q.value(), 30.0);
        q.observe(10.0);
        q.observe(20.0);
        // Three samples, p95 -> highest.
        assert_eq!(q.value(), 30.0);
    }

    #[test]
    fn p2_tracks_uniform_p95() {
        let mut q = P2Quantile::new(0.95);
        // A permutation of 1..=1000 so arrival order is scrambled.
        for i in 0..1000u64 {
            let x = (i * 613) % 1000 + 1;
            q.observe(x as f64);
        }
        let estimate = q.value();
        assert!(
            (estimate - 950.0).abs() < 50.0,
            "p95 estimate {estimate} too far from 950"
        );
    }

    #[test]
    fn p2_stays_within_observed_range() {
        let mut q = P2Quantile::new(0.95);
        for i in 0..500u64 {
            q.observe(((i * 37) % 100) as f64);
        }
        let estimate = q.value();
        assert!(estimate >= 0.0);
        assert!(estimate <= 99.0);
    }

    #[test]
    fn ewma_prime_and_decay() {
        let mut rate = EwmaRate::new(2.0);
        rate.update(100, 0.5);
        assert!((rate.value - 200.0).abs() < 1e-9);
        // Load stops; the estimate decays toward zero without jumping.
        rate.update(0, 0.5);
        assert!(rate.value < 200.0);
        assert!(rate.value > 100.0);
    }

    #[test]
    fn ewma_ignores_zero_dt() {
        let mut rate = EwmaRate::new(2.0);
        rate.update(50, 0.0);
        assert_eq!(rate.value, 0.0);
    }

    #[test]
    fn reservoir_is_exact_below_capacity() {
        let mut r = Reservoir::new(1000);
        for v in 1..=100u64 {
            r.push(v);
        }
        assert_eq!(r.percentile(50.0), 50);
        assert_eq!(r.percentile(95.0), 95);
        assert_eq!(r.percentile(100.0), 100);
    }

    #[test]
    fn reservoir_caps_memory_and_keeps_range() {
        let mut r = Reservoir::new(100);
        for v in 0..10_000u64 {
            r.push(v % 500);
        }
        assert_eq!(r.samples.len(), 100);
        assert!(r.percentile(50.0) < 500);
    }

    #[test]
    fn empty_reservoir_percentile_is_zero() {
        let r = Reservoir::new(10);
        assert_eq!(r.percentile(95.0), 0);
    }

    #[test]
    fn stats_counts_and_extremes() {
        let mut stats = LiveStats::new();
        stats.record(100, true, 512);
        stats.record(200, false, 1024);
        stats.record(50, true, 256);

        let snap = stats.snapshot(3);
        assert_eq!(snap.completed_requests, 3);
        assert_eq!(snap.total_errors, 1);
        assert_eq!(snap.active_vus, 3);
        assert_eq!(snap.min_ms, 50);
        assert_eq!(snap.max_ms, 200);
        assert!((snap.mean_ms - 350.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_stats_snapshot_is_all_zero() {
        let stats = LiveStats::new();
        let snap = stats.snapshot(0);
        assert_eq!(snap.completed_requests, 0);
        assert_eq!(snap.min_ms, 0);
        assert_eq!(snap.p95_ms, 0);
        assert_eq!(snap.mean_ms, 0.0);
    }

    #[test]
    fn summary_totals_add_up() {
        let mut stats = LiveStats::new();
        for i in 0..20u64 {
            stats.record(10 + i, i % 5 != 0, 100);
        }
        let summary = stats.summary(Uuid::new_v4(), "plan".into());
        assert_eq!(summary.total_requests, 20);
        assert_eq!(
            summary.successful_requests + summary.failed_requests,
            summary.total_requests
        );
        assert_eq!(summary.failed_requests, 4);
        assert_eq!(summary.total_bytes_received, 2000);
    }

    #[test]
    fn summary_percentiles_are_monotone() {
        let mut stats = LiveStats::new();
        for i in 1..=500u64 {
            stats.record(i, true, 0);
        }
        let s = stats.summary(Uuid::new_v4(), "p".into());
        assert!(s.min_response_ms <= s.p50_response_ms);
        assert!(s.p50_response_ms as f64 <= s.mean_response_ms);
        assert!(s.mean_response_ms <= s.p95_response_ms as f64);
        assert!(s.p95_response_ms <= s.p99_response_ms);
        assert!(s.p99_response_ms <= s.max_response_ms);
    }

    #[test]
    fn time_series_buckets_accumulate() {
        let mut stats = LiveStats::new();
        stats.record(10, true, 0);
        stats.record(30, false, 0);
        let series = stats.time_series();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].requests, 2);
        assert_eq!(series[0].errors, 1);
        assert!((series[0].avg_ms - 20.0).abs() < 1e-9);
        assert_eq!(series[0].min_ms, 10);
        assert_eq!(series[0].max_ms, 30);
    }
}
