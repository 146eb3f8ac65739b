//! Token-bucket refill arithmetic.

/// State of one bucket: either the request budget or the token budget of
/// an upstream API.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub capacity: f64,
    pub remaining: f64,
    pub refill_rate_per_sec: f64,
    /// Last refill time, unix millis.
    pub updated_at_ms: i64,
}

impl BucketState {
    /// A full bucket with a per-minute safe capacity.
    pub fn per_minute(safe_capacity: u64, now_ms: i64) -> Self {
        let capacity = safe_capacity as f64;
        Self {
            capacity,
            remaining: capacity,
            refill_rate_per_sec: capacity / 60.0,
            updated_at_ms: now_ms,
        }
    }

    /// Replenish by `rate × elapsed`, capped at capacity. A clock that
    /// jumps backwards refills nothing and leaves `updated_at_ms` alone.
    pub fn refill(&mut self, now_ms: i64) {
        let elapsed_ms = now_ms - self.updated_at_ms;
        if elapsed_ms <= 0 {
            return;
        }
        let refill = self.refill_rate_per_sec * (elapsed_ms as f64 / 1000.0);
        self.remaining = (self.remaining + refill).min(self.capacity);
        self.updated_at_ms = now_ms;
    }

    /// Whether the bucket currently has room for `cost`.
    pub fn has(&self, cost: f64) -> bool {
        self.remaining >= cost
    }

    /// Spend `cost`. Callers must check `has` first; remaining never goes
    /// below zero.
    pub fn spend(&mut self, cost: f64) {
        self.remaining = (self.remaining - cost).max(0.0);
    }

    /// Milliseconds until the bucket would have room for `cost`, assuming
    /// no other spends. Zero when it already does. A cost above capacity
    /// can never be satisfied; report one full window so callers back off
    /// rather than spin.
    pub fn time_until_ms(&self, cost: f64) -> u64 {
        if self.has(cost) {
            return 0;
        }
        if cost > self.capacity {
            return 60_000;
        }
        let deficit = cost - self.remaining;
        ((deficit / self.refill_rate_per_sec) * 1000.0).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_full() {
        let bucket = BucketState::per_minute(48, 0);
        assert_eq!(bucket.remaining, 48.0);
        assert_eq!(bucket.capacity, 48.0);
        assert!((bucket.refill_rate_per_sec - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let mut bucket = BucketState::per_minute(48, 0);
        bucket.spend(10.0);
        bucket.refill(3_600_000);
        assert_eq!(bucket.remaining, 48.0);
    }

    #[test]
    fn test_refill_proportional_to_elapsed() {
        let mut bucket = BucketState::per_minute(60, 0);
        bucket.spend(60.0);
        assert_eq!(bucket.remaining, 0.0);
        // 60/min refills one token per second.
        bucket.refill(5_000);
        assert!((bucket.remaining - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_clock_backwards_refills_nothing() {
        let mut bucket = BucketState::per_minute(48, 10_000);
        bucket.spend(20.0);
        let before = bucket.remaining;
        bucket.refill(5_000);
        assert_eq!(bucket.remaining, before);
        assert_eq!(bucket.updated_at_ms, 10_000);
    }

    #[test]
    fn test_spend_never_negative() {
        let mut bucket = BucketState::per_minute(10, 0);
        bucket.spend(25.0);
        assert_eq!(bucket.remaining, 0.0);
    }

    #[test]
    fn test_time_until_ms() {
        let mut bucket = BucketState::per_minute(60, 0);
        assert_eq!(bucket.time_until_ms(1.0), 0);
        bucket.spend(60.0);
        // One token per second: 3 tokens in 3000ms.
        assert_eq!(bucket.time_until_ms(3.0), 3000);
    }

    #[test]
    fn test_time_until_for_oversized_cost() {
        let bucket = BucketState::per_minute(10, 0);
        assert_eq!(bucket.time_until_ms(100.0), 60_000);
    }
}
