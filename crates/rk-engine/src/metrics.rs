//! Instrumentation shared by every component.
//!
//! Every update goes to the `metrics` facade, so an installed recorder (the
//! Prometheus exporter in the binary) sees it. A local copy of each value is
//! kept as well, for [`Metrics::snapshot`] and the `stats` command.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Operations whose latency is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    CacheGet,
    CacheSet,
    ProviderCall,
    AssetDownload,
    JobRun,
    Commit,
    PageLoad,
}

const OPS: usize = 7;

impl Op {
    const ALL: [Op; OPS] = [
        Op::CacheGet,
        Op::CacheSet,
        Op::ProviderCall,
        Op::AssetDownload,
        Op::JobRun,
        Op::Commit,
        Op::PageLoad,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Op::CacheGet => "cache_get",
            Op::CacheSet => "cache_set",
            Op::ProviderCall => "provider_call",
            Op::AssetDownload => "asset_download",
            Op::JobRun => "job_run",
            Op::Commit => "commit",
            Op::PageLoad => "page_load",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Default)]
struct Latency {
    count: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

/// Counter identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    CacheHits,
    CacheMisses,
    CacheErrors,
    CacheWrites,
    ProviderCalls,
    ProviderFailures,
    JobsSubmitted,
    JobsCoalesced,
    JobsRetried,
    JobsSucceeded,
    JobsFailed,
    JobsCancelled,
    PagesPrefetched,
    PageHits,
}

const COUNTERS: usize = 14;

impl Counter {
    /// Name under which the counter is exported.
    pub fn name(self) -> &'static str {
        match self {
            Counter::CacheHits => "reelkeep_cache_hits_total",
            Counter::CacheMisses => "reelkeep_cache_misses_total",
            Counter::CacheErrors => "reelkeep_cache_errors_total",
            Counter::CacheWrites => "reelkeep_cache_writes_total",
            Counter::ProviderCalls => "reelkeep_provider_calls_total",
            Counter::ProviderFailures => "reelkeep_provider_failures_total",
            Counter::JobsSubmitted => "reelkeep_jobs_submitted_total",
            Counter::JobsCoalesced => "reelkeep_jobs_coalesced_total",
            Counter::JobsRetried => "reelkeep_jobs_retried_total",
            Counter::JobsSucceeded => "reelkeep_jobs_succeeded_total",
            Counter::JobsFailed => "reelkeep_jobs_failed_total",
            Counter::JobsCancelled => "reelkeep_jobs_cancelled_total",
            Counter::PagesPrefetched => "reelkeep_pages_prefetched_total",
            Counter::PageHits => "reelkeep_page_hits_total",
        }
    }
}

const OP_DURATION: &str = "reelkeep_op_duration_seconds";
const JOBS_RUNNING: &str = "reelkeep_jobs_running";

#[derive(Default)]
pub struct Metrics {
    counters: [AtomicU64; COUNTERS],
    latency: [Latency; OPS],
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter as usize].fetch_add(n, Ordering::Relaxed);
        metrics::counter!(counter.name()).increment(n);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn observe(&self, op: Op, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let slot = &self.latency[op.index()];
        slot.count.fetch_add(1, Ordering::Relaxed);
        slot.total_us.fetch_add(us, Ordering::Relaxed);
        slot.max_us.fetch_max(us, Ordering::Relaxed);
        metrics::histogram!(OP_DURATION, "op" => op.as_str()).record(elapsed.as_secs_f64());
    }

    /// Start timing `op`; the elapsed time is recorded when the guard drops.
    pub fn timer(&self, op: Op) -> Timer<'_> {
        Timer {
            metrics: self,
            op,
            started: Instant::now(),
        }
    }

    /// A job entered `Running`.
    pub fn job_started(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
        metrics::gauge!(JOBS_RUNNING).increment(1.0);
    }

    /// A job left `Running`.
    pub fn job_stopped(&self) {
        // Never wraps below zero even if calls are unbalanced.
        if self
            .running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            metrics::gauge!(JOBS_RUNNING).decrement(1.0);
        }
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running jobs observed.
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = |counter| self.get(counter);
        MetricsSnapshot {
            cache_hits: c(Counter::CacheHits),
            cache_misses: c(Counter::CacheMisses),
            cache_errors: c(Counter::CacheErrors),
            cache_writes: c(Counter::CacheWrites),
            provider_calls: c(Counter::ProviderCalls),
            provider_failures: c(Counter::ProviderFailures),
            jobs_submitted: c(Counter::JobsSubmitted),
            jobs_coalesced: c(Counter::JobsCoalesced),
            jobs_retried: c(Counter::JobsRetried),
            jobs_succeeded: c(Counter::JobsSucceeded),
            jobs_failed: c(Counter::JobsFailed),
            jobs_cancelled: c(Counter::JobsCancelled),
            pages_prefetched: c(Counter::PagesPrefetched),
            page_hits: c(Counter::PageHits),
            running: self.running(),
            peak_running: self.peak_running(),
            latency: Op::ALL
                .iter()
                .filter_map(|&op| {
                    let slot = &self.latency[op.index()];
                    let count = slot.count.load(Ordering::Relaxed);
                    (count > 0).then(|| LatencySnapshot {
                        op: op.as_str(),
                        count,
                        total_us: slot.total_us.load(Ordering::Relaxed),
                        max_us: slot.max_us.load(Ordering::Relaxed),
                    })
                })
                .collect(),
        }
    }
}

/// Records the elapsed time of an operation on drop.
pub struct Timer<'a> {
    metrics: &'a Metrics,
    op: Op,
    started: Instant,
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.metrics.observe(self.op, self.started.elapsed());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub op: &'static str,
    pub count: u64,
    pub total_us: u64,
    pub max_us: u64,
}

impl LatencySnapshot {
    pub fn mean(&self) -> Duration {
        Duration::from_micros(self.total_us / self.count.max(1))
    }
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
    pub cache_writes: u64,
    pub provider_calls: u64,
    pub provider_failures: u64,
    pub jobs_submitted: u64,
    pub jobs_coalesced: u64,
    pub jobs_retried: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub pages_prefetched: u64,
    pub page_hits: u64,
    pub running: usize,
    pub peak_running: usize,
    pub latency: Vec<LatencySnapshot>,
}

impl MetricsSnapshot {
    /// Fraction of cache lookups that hit, if any were made.
    pub fn cache_hit_ratio(&self) -> Option<f64> {
        let total = self.cache_hits + self.cache_misses;
        (total > 0).then(|| self.cache_hits as f64 / total as f64)
    }

    pub fn latency_of(&self, op: Op) -> Option<&LatencySnapshot> {
        self.latency.iter().find(|l| l.op == op.as_str())
    }
}
