//! Throughput estimation: EWMA rate and ETA.

use std::time::Instant;

const ALPHA: f64 = 0.3;

/// Exponentially-weighted moving average of a byte counter's rate.
/// Sampled by the progress ticker; not meant for per-chunk granularity.
#[derive(Debug)]
pub struct RateEstimator {
    inner: std::sync::Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    last_at: Instant,
    last_bytes: u64,
    ewma: f64,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(Inner {
                last_at: Instant::now(),
                last_bytes: 0,
                ewma: 0.0,
            }),
        }
    }

    /// Feed the current cumulative byte count; returns the smoothed rate in
    /// bytes/s. Samples closer than 50 ms apart return the previous estimate.
    pub fn sample(&self, bytes_now: u64) -> f64 {
        let mut s = self.inner.lock().unwrap();
        let dt = s.last_at.elapsed().as_secs_f64();
        if dt < 0.05 {
            return s.ewma;
        }
        let delta = bytes_now.saturating_sub(s.last_bytes) as f64;
        let instant_rate = delta / dt;
        s.ewma = if s.ewma == 0.0 {
            instant_rate
        } else {
            ALPHA * instant_rate + (1.0 - ALPHA) * s.ewma
        };
        s.last_at = Instant::now();
        s.last_bytes = bytes_now;
        s.ewma
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().unwrap().ewma
    }

    /// Reset after pause/resume so stale history doesn't skew the ramp-up.
    pub fn reset(&self, bytes_now: u64) {
        let mut s = self.inner.lock().unwrap();
        s.last_at = Instant::now();
        s.last_bytes = bytes_now;
        s.ewma = 0.0;
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Seconds remaining at `rate` bytes/s, or None when unknowable.
pub fn eta_seconds(downloaded: u64, total: Option<u64>, rate: f64) -> Option<f64> {
    let total = total?;
    let remaining = total.saturating_sub(downloaded);
    if remaining == 0 {
        return Some(0.0);
    }
    if rate <= 0.0 {
        return None;
    }
    Some(remaining as f64 / rate)
}
