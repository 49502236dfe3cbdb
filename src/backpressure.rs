//! Byte-counting backpressure shared between async writers and a sink task.
//!
//! Producers reserve the size of every chunk before handing it to the sink
//! task; the task releases it once the chunk was written (or discarded).
//! While the buffered byte count is at or above the limit, reservations
//! wait on a [`tokio::sync::Notify`] until enough bytes were released, up
//! to a timeout.
//!
//! # Usage
//!
//! ```ignore
//! let bp = Backpressure::new(64 * 1024);
//! let reservation = bp.reserve(chunk.len()).await?;
//! tx.send(chunk).await?;
//! reservation.disarm(); // released by the sink task from now on
//! ```
//!
//! Like a `Writable`, a reservation is granted while the count is below the
//! limit even if the new chunk makes it overshoot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::DEFAULT_HIGH_WATER_MARK;
use crate::error::{Result, StreamError};

/// Default backpressure timeout (how long to wait for space to become available).
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Shared {
    buffered: AtomicUsize,
    limit: usize,
    timeout: Duration,
    released: Notify,
}

/// Shared buffered-bytes counter with async waiting.
///
/// Clones share the same counter.
#[derive(Debug, Clone)]
pub struct Backpressure {
    shared: Arc<Shared>,
}

impl Backpressure {
    /// Create a new controller with the default timeout.
    pub fn new(limit: usize) -> Self {
        Self::with_timeout(limit, DEFAULT_BACKPRESSURE_TIMEOUT)
    }

    /// Create a controller with custom timeout.
    pub fn with_timeout(limit: usize, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffered: AtomicUsize::new(0),
                limit,
                timeout,
                released: Notify::new(),
            }),
        }
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.shared.limit
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Bytes reserved and not yet released.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.buffered() >= self.shared.limit
    }

    #[inline]
    pub fn available_capacity(&self) -> usize {
        self.shared.limit.saturating_sub(self.buffered())
    }

    /// Try to reserve `bytes` without waiting.
    ///
    /// Returns `Err(BackpressureTimeout)` if at capacity.
    pub fn try_reserve(&self, bytes: usize) -> Result<Reservation> {
        let limit = self.shared.limit;
        self.shared
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then(|| current + bytes)
            })
            .map_err(|_| StreamError::BackpressureTimeout)?;
        Ok(Reservation {
            backpressure: self.clone(),
            bytes,
            armed: true,
        })
    }

    /// Reserve `bytes`, waiting for capacity if necessary.
    ///
    /// Returns `Err(BackpressureTimeout)` if the timeout is reached.
    pub async fn reserve(&self, bytes: usize) -> Result<Reservation> {
        let deadline = Instant::now() + self.shared.timeout;
        loop {
            if let Ok(reservation) = self.try_reserve(bytes) {
                return Ok(reservation);
            }
            self.wait_until(deadline).await?;
        }
    }

    /// Wait until the buffered count drops below the limit.
    pub async fn wait_for_capacity(&self) -> Result<()> {
        self.wait_until(Instant::now() + self.shared.timeout).await
    }

    async fn wait_until(&self, deadline: Instant) -> Result<()> {
        loop {
            let released = self.shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if !self.is_active() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                tracing::warn!(
                    buffered = self.buffered(),
                    limit = self.shared.limit,
                    "backpressure timeout"
                );
                return Err(StreamError::BackpressureTimeout);
            }
        }
    }

    /// Release `bytes` (called once a chunk was written or discarded).
    pub fn release(&self, bytes: usize) {
        // Saturating: releasing more than was reserved must not wrap.
        let _ = self
            .shared
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
        self.shared.released.notify_waiters();
    }
}

impl Default for Backpressure {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATER_MARK)
    }
}

/// Reserved bytes, released on drop unless disarmed.
#[derive(Debug)]
pub struct Reservation {
    backpressure: Backpressure,
    bytes: usize,
    armed: bool,
}

impl Reservation {
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Keep the bytes reserved; another party releases them later.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.backpressure.release(self.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_creation() {
        let bp = Backpressure::new(100);
        assert_eq!(bp.limit(), 100);
        assert_eq!(bp.buffered(), 0);
        assert_eq!(bp.timeout(), DEFAULT_BACKPRESSURE_TIMEOUT);
        assert!(!bp.is_active());
        assert_eq!(Backpressure::default().limit(), DEFAULT_HIGH_WATER_MARK);
    }

    #[test]
    fn test_try_reserve_overshoots_once() {
        let bp = Backpressure::new(10);

        bp.try_reserve(6).unwrap().disarm();
        bp.try_reserve(6).unwrap().disarm();
        assert_eq!(bp.buffered(), 12);
        assert!(bp.is_active());

        let result = bp.try_reserve(1);
        assert!(matches!(result, Err(StreamError::BackpressureTimeout)));
        assert_eq!(bp.buffered(), 12);
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let bp = Backpressure::new(10);
        {
            let reservation = bp.try_reserve(4).unwrap();
            assert_eq!(reservation.bytes(), 4);
            assert_eq!(bp.buffered(), 4);
        }
        assert_eq!(bp.buffered(), 0);
    }

    #[test]
    fn test_release_saturates() {
        let bp = Backpressure::new(10);
        bp.try_reserve(3).unwrap().disarm();
        bp.release(5);
        assert_eq!(bp.buffered(), 0);
        assert_eq!(bp.available_capacity(), 10);
    }

    #[test]
    fn test_clone_shares_state() {
        let a = Backpressure::new(10);
        let b = a.clone();

        a.try_reserve(2).unwrap().disarm();
        assert_eq!(b.buffered(), 2);
        b.release(2);
        assert_eq!(a.buffered(), 0);
    }

    #[tokio::test]
    async fn test_reserve_immediate() {
        let bp = Backpressure::new(10);
        bp.reserve(3).await.unwrap().disarm();
        assert_eq!(bp.buffered(), 3);
    }

    #[tokio::test]
    async fn test_reserve_timeout() {
        let bp = Backpressure::with_timeout(1, Duration::from_millis(10));
        bp.try_reserve(1).unwrap().disarm();

        let start = std::time::Instant::now();
        let result = bp.reserve(1).await;

        assert!(matches!(result, Err(StreamError::BackpressureTimeout)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_reserve_wakes_on_release() {
        let bp = Backpressure::with_timeout(1, Duration::from_secs(1));
        bp.try_reserve(1).unwrap().disarm();

        let releaser = bp.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            releaser.release(1);
        });

        bp.reserve(1).await.unwrap().disarm();
        assert_eq!(bp.buffered(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_capacity() {
        let bp = Backpressure::with_timeout(4, Duration::from_secs(1));
        bp.wait_for_capacity().await.unwrap();

        bp.try_reserve(4).unwrap().disarm();
        let releaser = bp.clone();
        let waiter = tokio::spawn(async move { releaser.wait_for_capacity().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        bp.release(4);
        waiter.await.unwrap().unwrap();
    }
}
