//! Token-bucket rate limiting: one global bucket plus optional per-job buckets.
//!
//! Workers call `acquire` after reading a chunk from the socket and before
//! writing it to the sink, in chunks of at most 64 KiB. Throughput overshoot
//! is therefore bounded by the chunk size. Waiters are served first-come-
//! first-served per bucket; a waiting worker re-checks its cancel token at
//! least every 200 ms.

use crate::transport::CancelToken;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Bucket capacity as a fraction of the refill rate (burst window, seconds).
const BURST_WINDOW: f64 = 0.25;
/// Upper bound on one condvar wait so cancellation stays responsive.
const WAIT_SLICE: Duration = Duration::from_millis(200);

struct BucketState {
    /// Refill rate in bytes/s. 0 = unlimited.
    rate: u64,
    tokens: f64,
    last_refill: Instant,
    /// FIFO ticketing: `serving` is the ticket allowed to take tokens.
    next_ticket: u64,
    serving: u64,
    /// Tickets whose owners gave up while queued.
    abandoned: BTreeSet<u64>,
}

impl BucketState {
    fn capacity(&self) -> f64 {
        (self.rate as f64 * BURST_WINDOW).ceil().max(1.0)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity());
            self.last_refill = now;
        }
    }

    fn advance_serving(&mut self) {
        self.serving += 1;
        while self.abandoned.remove(&self.serving) {
            self.serving += 1;
        }
    }
}

/// A single token bucket with blocking FIFO acquire.
pub struct Bucket {
    inner: Mutex<BucketState>,
    cv: Condvar,
}

impl Bucket {
    pub fn new(rate: u64) -> Self {
        Self {
            inner: Mutex::new(BucketState {
                rate,
                tokens: (rate as f64 * BURST_WINDOW).ceil().max(1.0),
                last_refill: Instant::now(),
                next_ticket: 0,
                serving: 0,
                abandoned: BTreeSet::new(),
            }),
            cv: Condvar::new(),
        }
    }

    pub fn set_rate(&self, rate: u64) {
        let mut st = self.inner.lock().unwrap();
        st.refill();
        st.rate = rate;
        st.tokens = st.tokens.min(st.capacity());
        self.cv.notify_all();
    }

    pub fn rate(&self) -> u64 {
        self.inner.lock().unwrap().rate
    }

    /// Takes `n` tokens, waiting for refill when short. Returns false if the
    /// cancel token fired while waiting. Unlimited buckets return at once.
    ///
    /// The deduction may push the balance negative by up to one chunk; that
    /// debt is paid off by subsequent refills, keeping the long-run rate at
    /// the configured limit.
    pub fn acquire(&self, n: u64, cancel: &CancelToken) -> bool {
        let mut st = self.inner.lock().unwrap();
        if st.rate == 0 {
            return true;
        }
        let ticket = st.next_ticket;
        st.next_ticket += 1;
        loop {
            if cancel.is_cancelled() {
                if ticket == st.serving {
                    st.advance_serving();
                    self.cv.notify_all();
                } else {
                    st.abandoned.insert(ticket);
                }
                return false;
            }
            st.refill();
            if st.rate == 0 {
                // Limit lifted while we queued.
                if ticket == st.serving {
                    st.advance_serving();
                } else {
                    st.abandoned.insert(ticket);
                }
                self.cv.notify_all();
                return true;
            }
            let need = (n as f64).min(st.capacity());
            if ticket == st.serving && st.tokens >= need {
                st.tokens -= n as f64;
                st.advance_serving();
                self.cv.notify_all();
                return true;
            }
            let wait = if ticket == st.serving {
                let deficit = (need - st.tokens).max(0.0);
                Duration::from_secs_f64(deficit / st.rate as f64).min(WAIT_SLICE)
            } else {
                WAIT_SLICE
            };
            let (guard, _) = self.cv.wait_timeout(st, wait.max(Duration::from_millis(1))).unwrap();
            st = guard;
        }
    }
}

/// Shared limiter: the global bucket plus per-job ceilings.
pub struct RateLimiter {
    global: Bucket,
    per_job: Mutex<HashMap<String, Arc<Bucket>>>,
}

impl RateLimiter {
    pub fn new(global_rate: u64) -> Self {
        Self {
            global: Bucket::new(global_rate),
            per_job: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_global_rate(&self, rate: u64) {
        self.global.set_rate(rate);
    }

    /// Install or clear a per-job ceiling.
    pub fn set_job_rate(&self, job_id: &str, rate: Option<u64>) {
        let mut map = self.per_job.lock().unwrap();
        match rate {
            Some(r) if r > 0 => match map.get(job_id) {
                Some(b) => b.set_rate(r),
                None => {
                    map.insert(job_id.to_string(), Arc::new(Bucket::new(r)));
                }
            },
            _ => {
                map.remove(job_id);
            }
        }
    }

    pub fn remove_job(&self, job_id: &str) {
        self.per_job.lock().unwrap().remove(job_id);
    }

    /// Deducts `n` bytes from the global bucket and the job's bucket (when it
    /// has one). Returns false if cancelled while waiting.
    pub fn acquire(&self, n: u64, job_id: &str, cancel: &CancelToken) -> bool {
        if !self.global.acquire(n, cancel) {
            return false;
        }
        let bucket = self.per_job.lock().unwrap().get(job_id).cloned();
        match bucket {
            Some(b) => b.acquire(n, cancel),
            None => true,
        }
    }
}
