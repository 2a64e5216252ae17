//! Bounded single-producer/single-consumer queue for one input port.
//!
//! A full reservoir pushes back on its producer: [`Reservoir::add`] waits one
//! spin interval and retries until space frees up. Waiting is cancellable
//! through [`Reservoir::cancel`], and [`Reservoir::add_timeout`] additionally
//! gives up at a deadline.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use super::{ReservoirError, TryAddError};
use crate::config::ReservoirConfig;

/// Bounded FIFO with spin-wait backpressure.
pub struct Reservoir<T> {
    name: RwLock<String>,
    config: ReservoirConfig,
    queue: Mutex<VecDeque<T>>,
    cancelled: AtomicBool,
}

impl<T> Reservoir<T> {
    /// Creates an empty reservoir.
    #[must_use]
    pub fn new(name: impl Into<String>, config: ReservoirConfig) -> Self {
        Self {
            name: RwLock::new(name.into()),
            queue: Mutex::new(VecDeque::with_capacity(config.buffer_capacity.min(1024))),
            config,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Current name (the input port, or `port.N` once disconnected).
    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Renames the reservoir.
    pub fn rename(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// Maximum number of queued items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.buffer_capacity
    }

    /// Time a blocked producer waits before retrying.
    #[must_use]
    pub fn spin_interval(&self) -> Duration {
        self.config.spin_interval
    }

    /// Enqueues without waiting.
    ///
    /// # Errors
    ///
    /// Returns the item with [`ReservoirError::Full`] or
    /// [`ReservoirError::Cancelled`].
    pub fn try_add(&self, item: T) -> Result<(), TryAddError<T>> {
        if self.is_cancelled() {
            return Err(TryAddError {
                value: item,
                error: ReservoirError::Cancelled,
            });
        }
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.buffer_capacity {
            return Err(TryAddError {
                value: item,
                error: ReservoirError::Full,
            });
        }
        queue.push_back(item);
        Ok(())
    }

    /// Enqueues, blocking the calling thread while the reservoir is full.
    ///
    /// # Errors
    ///
    /// Returns [`ReservoirError::Cancelled`] if the reservoir is cancelled
    /// before the item fits.
    pub fn add(&self, item: T) -> Result<(), ReservoirError> {
        let mut item = item;
        loop {
            match self.try_add(item) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_full() => item = e.into_inner(),
                Err(e) => return Err(e.error),
            }
            thread::sleep(self.config.spin_interval);
        }
    }

    /// Like [`add`](Self::add) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ReservoirError::Timeout`] at the deadline or
    /// [`ReservoirError::Cancelled`] on cancellation.
    pub fn add_timeout(&self, item: T, timeout: Duration) -> Result<(), ReservoirError> {
        let deadline = Instant::now() + timeout;
        let mut item = item;
        loop {
            match self.try_add(item) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_full() => item = e.into_inner(),
                Err(e) => return Err(e.error),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ReservoirError::Timeout);
            }
            thread::sleep(self.config.spin_interval.min(deadline - now));
        }
    }

    /// Enqueues from async code, yielding to the runtime while full.
    ///
    /// # Errors
    ///
    /// Returns [`ReservoirError::Cancelled`] on cancellation.
    pub async fn add_async(&self, item: T) -> Result<(), ReservoirError> {
        let mut item = item;
        loop {
            match self.try_add(item) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_full() => item = e.into_inner(),
                Err(e) => return Err(e.error),
            }
            tokio::time::sleep(self.config.spin_interval).await;
        }
    }

    /// Dequeues the oldest item.
    #[must_use]
    pub fn poll(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    /// Dequeues the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// # Errors
    ///
    /// Returns [`ReservoirError::Timeout`] if nothing arrived in time, or
    /// [`ReservoirError::Cancelled`] if the reservoir is cancelled and empty.
    pub fn poll_timeout(&self, timeout: Duration) -> Result<T, ReservoirError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.poll() {
                return Ok(item);
            }
            if self.is_cancelled() {
                return Err(ReservoirError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ReservoirError::Timeout);
            }
            thread::sleep(self.config.spin_interval.min(deadline - now));
        }
    }

    /// Applies `f` to the oldest item without dequeuing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.queue.lock().front().map(f)
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Returns true if the reservoir is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.config.buffer_capacity
    }

    /// Wakes every waiting producer with [`ReservoirError::Cancelled`].
    ///
    /// Items already queued can still be polled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<T: Clone> Reservoir<T> {
    /// Returns a copy of the oldest item without dequeuing it.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        self.peek_with(T::clone)
    }
}

impl<T> fmt::Debug for Reservoir<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservoir")
            .field("name", &*self.name.read())
            .field("len", &self.len())
            .field("capacity", &self.config.buffer_capacity)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn small(capacity: usize) -> ReservoirConfig {
        ReservoirConfig::builder()
            .buffer_capacity(capacity)
            .spin_millis(1)
            .build()
    }

    #[test]
    fn test_fifo() {
        let reservoir = Reservoir::new("in", small(4));
        reservoir.add(1).unwrap();
        reservoir.add(2).unwrap();
        assert_eq!(reservoir.peek(), Some(1));
        assert_eq!(reservoir.len(), 2);
        assert_eq!(reservoir.poll(), Some(1));
        assert_eq!(reservoir.poll(), Some(2));
        assert_eq!(reservoir.poll(), None);
        assert!(reservoir.is_empty());
    }

    #[test]
    fn test_try_add_when_full() {
        let reservoir = Reservoir::new("in", small(2));
        reservoir.try_add(1).unwrap();
        reservoir.try_add(2).unwrap();
        assert!(reservoir.is_full());

        let err = reservoir.try_add(3).unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 3);
    }

    #[test]
    fn test_add_blocks_until_space() {
        let reservoir = Arc::new(Reservoir::new("in", small(1)));
        reservoir.add(1).unwrap();

        let producer = {
            let reservoir = Arc::clone(&reservoir);
            thread::spawn(move || reservoir.add(2))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(reservoir.len(), 1);

        assert_eq!(reservoir.poll(), Some(1));
        producer.join().unwrap().unwrap();
        assert_eq!(reservoir.poll(), Some(2));
    }

    #[test]
    fn test_add_cancelled() {
        let reservoir = Arc::new(Reservoir::new("in", small(1)));
        reservoir.add(1).unwrap();

        let producer = {
            let reservoir = Arc::clone(&reservoir);
            thread::spawn(move || reservoir.add(2))
        };
        thread::sleep(Duration::from_millis(10));
        reservoir.cancel();

        assert_eq!(producer.join().unwrap(), Err(ReservoirError::Cancelled));
        // Queued items stay readable.
        assert_eq!(reservoir.poll(), Some(1));
    }

    #[test]
    fn test_add_timeout() {
        let reservoir = Reservoir::new("in", small(1));
        reservoir.add(1).unwrap();
        assert_eq!(
            reservoir.add_timeout(2, Duration::from_millis(10)),
            Err(ReservoirError::Timeout)
        );
        reservoir.poll();
        assert_eq!(reservoir.add_timeout(2, Duration::from_millis(10)), Ok(()));
    }

    #[test]
    fn test_poll_timeout() {
        let reservoir: Reservoir<u32> = Reservoir::new("in", small(1));
        assert_eq!(
            reservoir.poll_timeout(Duration::from_millis(5)),
            Err(ReservoirError::Timeout)
        );
        reservoir.add(9).unwrap();
        assert_eq!(reservoir.poll_timeout(Duration::from_millis(5)), Ok(9));
        reservoir.cancel();
        assert_eq!(
            reservoir.poll_timeout(Duration::from_millis(5)),
            Err(ReservoirError::Cancelled)
        );
    }

    #[test]
    fn test_rename() {
        let reservoir: Reservoir<u8> = Reservoir::new("port", small(1));
        reservoir.rename("port.0");
        assert_eq!(reservoir.name(), "port.0");
    }

    #[tokio::test]
    async fn test_add_async_waits_for_space() {
        let reservoir = Arc::new(Reservoir::new("in", small(1)));
        reservoir.add_async(1).await.unwrap();

        let producer = {
            let reservoir = Arc::clone(&reservoir);
            tokio::spawn(async move { reservoir.add_async(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(reservoir.poll(), Some(1));

        producer.await.unwrap().unwrap();
        assert_eq!(reservoir.poll(), Some(2));
    }
}
