//! Rate limiting for block I/O submissions
//!
//! `ringcp` hands every read and write of a block to the I/O substrate as an independent
//! submission. This crate lets the substrate slow those submissions down before they touch the
//! disk, which is useful when copying onto a device shared with other workloads.
//!
//! Two throttles are available, both disabled by default:
//!
//! 1. **Operations throttle** - one token per submitted read or write
//! 2. **I/O operations throttle** - tokens proportional to the submitted length, measured in
//!    chunks of a configured size
//!
//! Both are token buckets refilled to their capacity once per interval by a background task.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! # async fn example() {
//! // 1000 submissions per second
//! throttle::init_ops_tokens(100);
//! tokio::spawn(throttle::run_ops_replenish_thread(100, Duration::from_millis(100)));
//!
//! // before every submission
//! throttle::get_ops_token().await;
//! throttle::get_transfer_iops_tokens(64 * 1024, 1024 * 1024).await;
//! # }
//! ```
//!
//! # Token Calculation
//!
//! ```text
//! tokens = ⌈len / chunk_size⌉
//! ```
//!
//! A request for more tokens than the bucket holds is clamped to the bucket capacity.

mod semaphore;

static OPS_THROTTLE: std::sync::LazyLock<semaphore::TokenBucket> =
    std::sync::LazyLock::new(semaphore::TokenBucket::new);
static IOPS_THROTTLE: std::sync::LazyLock<semaphore::TokenBucket> =
    std::sync::LazyLock::new(semaphore::TokenBucket::new);

pub fn init_ops_tokens(ops_tokens: usize) {
    OPS_THROTTLE.setup(ops_tokens);
}

pub fn init_iops_tokens(iops_tokens: usize) {
    IOPS_THROTTLE.setup(iops_tokens);
}

pub async fn get_ops_token() {
    OPS_THROTTLE.take(1).await;
}

/// Number of chunk-sized I/O operations needed to move `len` bytes.
#[must_use]
pub fn iops_for_len(chunk_size: u64, len: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    1 + (std::cmp::max(1, len) - 1) / chunk_size
}

pub async fn get_transfer_iops_tokens(chunk_size: u64, len: u64) {
    let tokens = iops_for_len(chunk_size, len);
    if tokens == 0 {
        return;
    }
    let tokens = u32::try_from(tokens).unwrap_or_else(|_| {
        tracing::warn!(
            "chunk size: {} is too small to throttle a transfer of {} bytes accurately",
            chunk_size,
            len,
        );
        u32::MAX
    });
    IOPS_THROTTLE.take(tokens).await;
}

pub async fn run_ops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    OPS_THROTTLE.run_refill_loop(replenish, interval).await;
}

pub async fn run_iops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    IOPS_THROTTLE.run_refill_loop(replenish, interval).await;
}
