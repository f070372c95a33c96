use std::sync::atomic::{AtomicUsize, Ordering};

/// Token bucket that is a no-op until it has been configured with a non-zero capacity.
pub struct TokenBucket {
    capacity: AtomicUsize,
    tokens: tokio::sync::Semaphore,
}

impl TokenBucket {
    pub fn new() -> Self {
        Self {
            capacity: AtomicUsize::new(0),
            tokens: tokio::sync::Semaphore::const_new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity.load(Ordering::Acquire) > 0
    }

    /// Sets the bucket capacity; zero disables the bucket.
    pub fn setup(&self, capacity: usize) {
        self.tokens.forget_permits(self.tokens.available_permits());
        if capacity > 0 {
            self.tokens.add_permits(capacity);
        }
        self.capacity.store(capacity, Ordering::Release);
    }

    /// Takes `count` tokens, waiting for refills as needed. Requests larger than the bucket
    /// capacity are clamped to the capacity so they cannot wait forever.
    pub async fn take(&self, count: u32) {
        let capacity = self.capacity.load(Ordering::Acquire);
        if capacity == 0 || count == 0 {
            return;
        }
        let count = u32::try_from(capacity).map_or(count, |capacity| count.min(capacity));
        // the semaphore is never closed, so acquisition only waits
        if let Ok(permits) = self.tokens.acquire_many(count).await {
            permits.forget();
        }
    }

    /// Tops the bucket back up to `capacity` every `interval`. Returns immediately when disabled.
    pub async fn run_refill_loop(&self, capacity: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let available = self.tokens.available_permits();
            if available < capacity {
                self.tokens.add_permits(capacity - available);
            }
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new()
    }
}
