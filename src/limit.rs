//! Transfer admission control.
//!
//! Each transfer direction of a torrent composes a chain of limiters; an
//! amount of bytes is admitted iff every member of the chain admits it. The
//! members are a process-global token bucket (shared by all torrents), the
//! torrent's bandwidth limiter (checked against the session's running average
//! rate) and the disk-side queue cap (writes for downloads, reads for
//! uploads).

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

/// A member of a limiter chain.
///
/// Admission is two-phase so that a chain never consumes capacity from one
/// member when a later member refuses: all members are asked first, and only
/// if all admit is the amount committed to each.
pub(crate) trait Limiter: Send {
    /// Returns whether the limiter would admit `amount` bytes now.
    fn admits(&mut self, amount: u64) -> bool;
    /// Records `amount` admitted bytes.
    fn commit(&mut self, amount: u64);
}

/// A group of limiters that admits an amount iff every member admits it.
pub(crate) struct LimiterChain {
    members: Vec<Box<dyn Limiter>>,
}

impl LimiterChain {
    pub fn new(members: Vec<Box<dyn Limiter>>) -> Self {
        Self { members }
    }

    /// Admits and commits `amount` bytes iff every member admits it.
    pub fn try_process(&mut self, amount: u64) -> bool {
        if !self.members.iter_mut().all(|member| member.admits(amount)) {
            return false;
        }
        for member in &mut self.members {
            member.commit(amount);
        }
        true
    }
}

/// A token bucket: tokens refill continuously at the configured rate up to
/// one second's worth of burst. A rate of 0 turns the bucket off (it admits
/// everything).
pub(crate) struct TokenBucket {
    /// Refill rate in bytes per second. 0 means no limit.
    rate: u64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            // start with a full burst
            tokens: rate as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.add_tokens(elapsed);
        self.last_refill = now;
    }

    fn add_tokens(&mut self, elapsed_secs: f64) {
        let burst = self.rate as f64;
        self.tokens = (self.tokens + elapsed_secs * self.rate as f64).min(burst);
    }
}

impl Limiter for TokenBucket {
    fn admits(&mut self, amount: u64) -> bool {
        if self.rate == 0 {
            return true;
        }
        self.refill();
        self.tokens >= amount as f64
    }

    fn commit(&mut self, amount: u64) {
        if self.rate > 0 {
            self.tokens -= amount as f64;
        }
    }
}

/// A process-global token bucket shared by every torrent's chain for one
/// transfer direction.
#[derive(Clone)]
pub(crate) struct SharedTokenBucket(Arc<Mutex<TokenBucket>>);

impl SharedTokenBucket {
    pub fn new(rate: u64) -> Self {
        Self(Arc::new(Mutex::new(TokenBucket::new(rate))))
    }
}

impl Limiter for SharedTokenBucket {
    fn admits(&mut self, amount: u64) -> bool {
        self.0.lock().expect("token bucket lock poisoned").admits(amount)
    }

    fn commit(&mut self, amount: u64) {
        self.0.lock().expect("token bucket lock poisoned").commit(amount)
    }
}

/// Admits an amount iff the session's average rate plus the amount stays
/// under the configured limit. A limit of 0 turns the check off.
pub(crate) struct BandwidthLimiter {
    limit: u64,
    /// The running average rate published by the session's [`RateMeasurer`].
    avg_rate: Arc<AtomicU64>,
}

impl BandwidthLimiter {
    pub fn new(limit: u64, avg_rate: Arc<AtomicU64>) -> Self {
        Self { limit, avg_rate }
    }
}

impl Limiter for BandwidthLimiter {
    fn admits(&mut self, amount: u64) -> bool {
        if self.limit == 0 {
            return true;
        }
        self.avg_rate.load(Ordering::Relaxed) + amount <= self.limit
    }

    // the measurer does the accounting; nothing to commit here
    fn commit(&mut self, _: u64) {}
}

/// Caps the number of disk operations queued towards the disk task. A pure
/// gate: the torrent increments the counter when it actually queues an
/// operation and the disk task decrements it on completion, so an admitted
/// transfer that never reaches the disk doesn't leak queue depth.
pub(crate) struct DiskQueueLimiter {
    queued: Arc<AtomicUsize>,
    cap: usize,
}

impl DiskQueueLimiter {
    pub fn new(queued: Arc<AtomicUsize>, cap: usize) -> Self {
        Self { queued, cap }
    }
}

impl Limiter for DiskQueueLimiter {
    fn admits(&mut self, _: u64) -> bool {
        self.queued.load(Ordering::Acquire) < self.cap
    }

    fn commit(&mut self, _: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_depletes_and_refills() {
        let mut bucket = TokenBucket::new(1000);
        assert!(bucket.admits(600));
        bucket.commit(600);
        // 400 tokens left
        assert!(!bucket.admits(600));
        assert!(bucket.admits(400));
        bucket.commit(400);

        // half a second refills half the rate
        bucket.add_tokens(0.5);
        assert!(bucket.tokens >= 500.0);
        assert!(bucket.tokens <= 500.1);
    }

    #[test]
    fn test_token_bucket_burst_is_capped() {
        let mut bucket = TokenBucket::new(1000);
        bucket.add_tokens(100.0);
        assert!(bucket.tokens <= 1000.0);
    }

    #[test]
    fn test_zero_rate_bucket_is_off() {
        let mut bucket = TokenBucket::new(0);
        assert!(bucket.admits(u64::MAX));
        bucket.commit(u64::MAX);
        assert!(bucket.admits(u64::MAX));
    }

    #[test]
    fn test_bandwidth_limiter() {
        let avg = Arc::new(AtomicU64::new(900));
        let mut limiter = BandwidthLimiter::new(1000, Arc::clone(&avg));
        assert!(limiter.admits(100));
        assert!(!limiter.admits(101));

        // 0 disables the limit
        let mut unlimited = BandwidthLimiter::new(0, avg);
        assert!(unlimited.admits(u64::MAX));
    }

    #[test]
    fn test_disk_queue_limiter_gates_on_depth() {
        let queued = Arc::new(AtomicUsize::new(0));
        let mut limiter = DiskQueueLimiter::new(Arc::clone(&queued), 2);
        assert!(limiter.admits(1));

        // the queue owner records the enqueued operations
        queued.store(2, Ordering::Release);
        assert!(!limiter.admits(1));

        // completion frees a slot
        queued.fetch_sub(1, Ordering::AcqRel);
        assert!(limiter.admits(1));
    }

    #[test]
    fn test_chain_admits_when_all_members_admit() {
        let queued = Arc::new(AtomicUsize::new(0));
        let avg = Arc::new(AtomicU64::new(0));
        let mut chain = LimiterChain::new(vec![
            Box::new(TokenBucket::new(1000)),
            Box::new(BandwidthLimiter::new(500, avg)),
            Box::new(DiskQueueLimiter::new(queued, 8)),
        ]);
        assert!(chain.try_process(400));
    }

    #[test]
    fn test_refused_chain_consumes_nothing() {
        // the saturated disk queue refuses, so the bucket must not lose
        // tokens
        let queued = Arc::new(AtomicUsize::new(8));
        let mut chain = LimiterChain::new(vec![
            Box::new(TokenBucket::new(1000)),
            Box::new(DiskQueueLimiter::new(Arc::clone(&queued), 8)),
        ]);
        assert!(!chain.try_process(600));

        // once the queue drains, a full second's burst is still available
        queued.store(0, Ordering::Release);
        assert!(chain.try_process(1000));
    }
}
