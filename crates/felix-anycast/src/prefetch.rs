// Adaptive prefetch window for remote consumer keys.
use std::time::{Duration, Instant};

use felix_common::DispatchConfig;

// Weight of the newest sample in both moving averages.
const SMOOTHING: f64 = 0.5;

/// Sizes the number of speculative infinite get requests a remote key keeps
/// in flight, from the observed round trip and consumption interval.
///
/// The consumption interval is the time a consumer spends between finishing
/// with one message (going not-ready) and asking for the next (going ready).
/// Until the first such sample exists the window stays at one request.
///
/// ```
/// use felix_anycast::PrefetchController;
/// use std::time::{Duration, Instant};
///
/// let mut prefetch = PrefetchController::with_limits(10, Duration::from_secs(5), 0.25);
/// assert_eq!(prefetch.window(), 1);
///
/// let t0 = Instant::now();
/// prefetch.record_rtt(Duration::from_millis(40));
/// prefetch.not_ready(t0);
/// prefetch.ready(t0 + Duration::from_millis(10));
/// assert_eq!(prefetch.window(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct PrefetchController {
    max_window: u32,
    ceiling: Duration,
    min_fraction: f64,
    consumption_interval: Option<Duration>,
    rtt: Option<Duration>,
    window: u32,
    outstanding: u32,
    unlocked: u32,
    last_not_ready: Option<Instant>,
}

impl PrefetchController {
    pub fn new(config: &DispatchConfig) -> Self {
        Self::with_limits(
            config.prefetch_max_window,
            config.prefetch_interval_ceiling(),
            config.prefetch_min_fraction,
        )
    }

    pub fn with_limits(max_window: u32, ceiling: Duration, min_fraction: f64) -> Self {
        Self {
            max_window: max_window.max(1),
            ceiling,
            min_fraction: min_fraction.clamp(0.0, 1.0),
            consumption_interval: None,
            rtt: None,
            window: 1,
            outstanding: 0,
            unlocked: 0,
            last_not_ready: None,
        }
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// Messages received but not yet locked by the consumer.
    pub fn unlocked(&self) -> u32 {
        self.unlocked
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn consumption_interval(&self) -> Option<Duration> {
        self.consumption_interval
    }

    pub fn not_ready(&mut self, now: Instant) {
        self.last_not_ready = Some(now);
    }

    /// Takes a consumption sample if the consumer had gone not-ready before.
    pub fn ready(&mut self, now: Instant) {
        let Some(since) = self.last_not_ready.take() else {
            return;
        };
        let sample = now.saturating_duration_since(since);
        self.consumption_interval = Some(smooth(self.consumption_interval, sample));
        self.recompute();
    }

    pub fn record_rtt(&mut self, sample: Duration) {
        self.rtt = Some(smooth(self.rtt, sample));
    }

    /// Number of new infinite requests to issue now. Zero while the
    /// shortfall is under the minimum fraction of the window.
    pub fn requests_to_issue(&self) -> u32 {
        let in_use = self.outstanding + self.unlocked;
        if in_use >= self.window {
            return 0;
        }
        let shortfall = self.window - in_use;
        if f64::from(shortfall) < self.min_fraction * f64::from(self.window) {
            return 0;
        }
        shortfall
    }

    pub fn request_issued(&mut self) {
        self.outstanding += 1;
        metrics::counter!("felix_prefetch_requests_total").increment(1);
    }

    /// An issued request completed without a message or was cancelled.
    pub fn request_resolved(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// An issued request was satisfied.
    pub fn message_received(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.unlocked += 1;
    }

    /// The consumer locked a received message.
    pub fn message_locked(&mut self) {
        self.unlocked = self.unlocked.saturating_sub(1);
    }

    pub fn reset(&mut self) {
        self.outstanding = 0;
        self.unlocked = 0;
    }

    fn recompute(&mut self) {
        self.window = match self.consumption_interval {
            None => 1,
            Some(interval) if interval > self.ceiling => 0,
            Some(interval) if interval.is_zero() => self.max_window,
            Some(interval) => match self.rtt {
                Some(rtt) if interval < rtt => {
                    let needed = rtt.as_nanos().div_ceil(interval.as_nanos());
                    u32::try_from(needed)
                        .unwrap_or(u32::MAX)
                        .clamp(1, self.max_window)
                }
                _ => 1,
            },
        };
        metrics::gauge!("felix_prefetch_window").set(f64::from(self.window));
    }
}

fn smooth(previous: Option<Duration>, sample: Duration) -> Duration {
    match previous {
        None => sample,
        Some(previous) => previous.mul_f64(1.0 - SMOOTHING) + sample.mul_f64(SMOOTHING),
    }
}
