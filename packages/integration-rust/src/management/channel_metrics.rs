//! Per-channel send/receive statistics.
//!
//! Counts are plain atomics and always maintained. When full statistics are
//! enabled, send durations and the instantaneous send and error rates (the
//! inverse of the gap since the previous event) feed lock-free accumulators
//! (count, sum, sum of squares, min, max) from which mean and standard
//! deviation are derived at read time. Every event is also reported to the
//! `metrics` facade, labelled with the channel name.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

const SENDS_TOTAL: &str = "weft_channel_sends_total";
const SEND_DURATION: &str = "weft_channel_send_duration_seconds";
const RECEIVES_TOTAL: &str = "weft_channel_receives_total";

/// Opaque token linking [`ChannelMetrics::before_send`] to
/// [`ChannelMetrics::after_send`].
///
/// Callers must pass back the context returned by the matching
/// `before_send`; this is not checked at runtime.
#[derive(Debug)]
#[must_use]
pub struct MetricsContext {
    started: Option<Instant>,
}

/// Distribution summary of a series of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Statistics {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub standard_deviation: f64,
}

/// Read-only snapshot of a channel's metrics, for polling collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatistics {
    pub name: String,
    pub full_stats_enabled: bool,
    pub send_count: u64,
    pub send_error_count: u64,
    pub receive_count: u64,
    pub receive_error_count: u64,
    pub send_duration_ms: Statistics,
    pub send_rate: Statistics,
    pub error_rate: Statistics,
    pub mean_send_rate: f64,
    pub mean_error_rate: f64,
    pub mean_error_ratio: f64,
    pub time_since_last_send_ms: Option<f64>,
}

/// `f64` stored as bits in an `AtomicU64`.
#[derive(Debug)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        // fetch_update only fails when the closure returns None.
        let _ = self.0.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            Some((f64::from_bits(bits) + delta).to_bits())
        });
    }

    // For non-negative floats, bit order equals numeric order.
    fn min(&self, value: f64) {
        self.0.fetch_min(value.to_bits(), Ordering::Relaxed);
    }

    fn max(&self, value: f64) {
        self.0.fetch_max(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct SampleAccumulator {
    count: AtomicU64,
    sum: AtomicF64,
    sum_of_squares: AtomicF64,
    min: AtomicF64,
    max: AtomicF64,
}

impl SampleAccumulator {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicF64::new(0.0),
            sum_of_squares: AtomicF64::new(0.0),
            min: AtomicF64::new(f64::INFINITY),
            max: AtomicF64::new(0.0),
        }
    }

    fn record(&self, sample: f64) {
        let sample = sample.max(0.0);
        self.sum.add(sample);
        self.sum_of_squares.add(sample * sample);
        self.min.min(sample);
        self.max.max(sample);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0.0);
        self.sum_of_squares.store(0.0);
        self.min.store(f64::INFINITY);
        self.max.store(0.0);
    }

    #[allow(clippy::cast_precision_loss)]
    fn statistics(&self) -> Statistics {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return Statistics::default();
        }
        let n = count as f64;
        let mean = self.sum.load() / n;
        let variance = (self.sum_of_squares.load() / n - mean * mean).max(0.0);
        let min = self.min.load();
        Statistics {
            count,
            min: if min.is_finite() { min } else { 0.0 },
            max: self.max.load(),
            mean,
            standard_deviation: variance.sqrt(),
        }
    }
}

/// Metrics for one channel.
#[derive(Debug)]
pub struct ChannelMetrics {
    name: String,
    full_stats_enabled: AtomicBool,
    origin: Instant,
    send_count: AtomicU64,
    send_error_count: AtomicU64,
    receive_count: AtomicU64,
    receive_error_count: AtomicU64,
    /// Nanoseconds after `origin` at which the current window started.
    window_start_nanos: AtomicU64,
    /// Nanoseconds after `origin` of the last send, plus one; 0 = none yet.
    last_send_nanos: AtomicU64,
    /// Same encoding as `last_send_nanos`, for failed sends.
    last_error_nanos: AtomicU64,
    durations: SampleAccumulator,
    send_rates: SampleAccumulator,
    error_rates: SampleAccumulator,
}

impl ChannelMetrics {
    /// Creates metrics for the channel `name`, with full statistics disabled.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            full_stats_enabled: AtomicBool::new(false),
            origin: Instant::now(),
            send_count: AtomicU64::new(0),
            send_error_count: AtomicU64::new(0),
            receive_count: AtomicU64::new(0),
            receive_error_count: AtomicU64::new(0),
            window_start_nanos: AtomicU64::new(0),
            last_send_nanos: AtomicU64::new(0),
            last_error_nanos: AtomicU64::new(0),
            durations: SampleAccumulator::new(),
            send_rates: SampleAccumulator::new(),
            error_rates: SampleAccumulator::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When `false`, only counts are maintained; when `true`, durations and
    /// rates are tracked as well.
    pub fn set_full_stats_enabled(&self, enabled: bool) {
        self.full_stats_enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_full_stats_enabled(&self) -> bool {
        self.full_stats_enabled.load(Ordering::Relaxed)
    }

    fn elapsed_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Begins a send event.
    pub fn before_send(&self) -> MetricsContext {
        MetricsContext {
            started: self.is_full_stats_enabled().then(Instant::now),
        }
    }

    /// Ends the send event started by `context`.
    ///
    /// Every call counts one send; `success == false` also counts an error.
    pub fn after_send(&self, context: MetricsContext, success: bool) {
        self.send_count.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.send_error_count.fetch_add(1, Ordering::Relaxed);
        }
        let result = if success { "success" } else { "failure" };
        metrics::counter!(SENDS_TOTAL, "channel" => self.name.clone(), "result" => result)
            .increment(1);

        if let Some(started) = context.started {
            let elapsed = started.elapsed();
            self.durations.record(elapsed.as_secs_f64() * 1_000.0);
            let now = self.elapsed_nanos();
            record_rate(&self.send_rates, &self.last_send_nanos, now);
            if !success {
                record_rate(&self.error_rates, &self.last_error_nanos, now);
            }
            metrics::histogram!(SEND_DURATION, "channel" => self.name.clone())
                .record(elapsed.as_secs_f64());
        }
    }

    /// Counts a successful receive.
    pub fn after_receive(&self) {
        self.receive_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(RECEIVES_TOTAL, "channel" => self.name.clone(), "result" => "success")
            .increment(1);
    }

    /// Counts a failed receive.
    pub fn after_error(&self) {
        self.receive_error_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(RECEIVES_TOTAL, "channel" => self.name.clone(), "result" => "failure")
            .increment(1);
    }

    /// Zeroes all counts and statistics. The full-stats flag is unchanged.
    pub fn reset(&self) {
        self.send_count.store(0, Ordering::Relaxed);
        self.send_error_count.store(0, Ordering::Relaxed);
        self.receive_count.store(0, Ordering::Relaxed);
        self.receive_error_count.store(0, Ordering::Relaxed);
        self.last_send_nanos.store(0, Ordering::Relaxed);
        self.last_error_nanos.store(0, Ordering::Relaxed);
        self.window_start_nanos
            .store(self.elapsed_nanos(), Ordering::Relaxed);
        self.durations.reset();
        self.send_rates.reset();
        self.error_rates.reset();
    }

    /// Total sends, successful or not.
    #[must_use]
    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn send_error_count(&self) -> u64 {
        self.send_error_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn send_success_count(&self) -> u64 {
        self.send_count().saturating_sub(self.send_error_count())
    }

    #[must_use]
    pub fn receive_count(&self) -> u64 {
        self.receive_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn receive_error_count(&self) -> u64 {
        self.receive_error_count.load(Ordering::Relaxed)
    }

    /// Send duration distribution in milliseconds.
    #[must_use]
    pub fn send_duration(&self) -> Statistics {
        self.durations.statistics()
    }

    /// Distribution of instantaneous send rates, in sends per second.
    #[must_use]
    pub fn send_rate(&self) -> Statistics {
        self.send_rates.statistics()
    }

    /// Distribution of instantaneous send error rates, in errors per second.
    #[must_use]
    pub fn error_rate(&self) -> Statistics {
        self.error_rates.statistics()
    }

    #[must_use]
    pub fn mean_send_duration(&self) -> f64 {
        self.send_duration().mean
    }

    #[must_use]
    pub fn min_send_duration(&self) -> f64 {
        self.send_duration().min
    }

    #[must_use]
    pub fn max_send_duration(&self) -> f64 {
        self.send_duration().max
    }

    #[must_use]
    pub fn standard_deviation_send_duration(&self) -> f64 {
        self.send_duration().standard_deviation
    }

    #[allow(clippy::cast_precision_loss)]
    fn window_seconds(&self) -> f64 {
        let start = self.window_start_nanos.load(Ordering::Relaxed);
        self.elapsed_nanos().saturating_sub(start) as f64 / 1e9
    }

    #[allow(clippy::cast_precision_loss)]
    fn per_second(&self, count: u64) -> f64 {
        if !self.is_full_stats_enabled() {
            return 0.0;
        }
        let seconds = self.window_seconds();
        if seconds <= 0.0 {
            0.0
        } else {
            count as f64 / seconds
        }
    }

    /// Sends per second since creation or the last reset (full stats only).
    #[must_use]
    pub fn mean_send_rate(&self) -> f64 {
        self.per_second(self.send_count())
    }

    /// Send errors per second since creation or the last reset (full stats only).
    #[must_use]
    pub fn mean_error_rate(&self) -> f64 {
        self.per_second(self.send_error_count())
    }

    /// Fraction of sends that failed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_error_ratio(&self) -> f64 {
        let sends = self.send_count();
        if sends == 0 {
            0.0
        } else {
            self.send_error_count() as f64 / sends as f64
        }
    }

    /// Milliseconds since the last timed send, if any (full stats only).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn time_since_last_send(&self) -> Option<f64> {
        match self.last_send_nanos.load(Ordering::Relaxed) {
            0 => None,
            at => Some(self.elapsed_nanos().saturating_sub(at - 1) as f64 / 1e6),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ChannelStatistics {
        ChannelStatistics {
            name: self.name.clone(),
            full_stats_enabled: self.is_full_stats_enabled(),
            send_count: self.send_count(),
            send_error_count: self.send_error_count(),
            receive_count: self.receive_count(),
            receive_error_count: self.receive_error_count(),
            send_duration_ms: self.send_duration(),
            send_rate: self.send_rate(),
            error_rate: self.error_rate(),
            mean_send_rate: self.mean_send_rate(),
            mean_error_rate: self.mean_error_rate(),
            mean_error_ratio: self.mean_error_ratio(),
            time_since_last_send_ms: self.time_since_last_send(),
        }
    }
}

/// Stamps `last` with `now` and records the rate implied by the gap since
/// the previous stamp. The first event only stamps.
#[allow(clippy::cast_precision_loss)]
fn record_rate(rates: &SampleAccumulator, last: &AtomicU64, now: u64) {
    let previous = last.swap(now.saturating_add(1), Ordering::Relaxed);
    if previous == 0 {
        return;
    }
    let gap = now.saturating_sub(previous - 1);
    if gap > 0 {
        rates.record(1e9 / gap as f64);
    }
}
