//! Binary semaphore over an atomic byte in shared memory
//!
//! Wait and signal are built from compare-and-swap alone, with no OS blocking
//! primitive behind them. This keeps the semaphore a plain byte that works
//! identically from both sides of the shared memory boundary, regardless of
//! which process created the region. The cost is that `wait` busy-spins while
//! the slot is unavailable; the trade-off buys the low hand-off latency a
//! tight simulation loop wants, at the price of burning CPU while idle.

use crate::ShmSafe;
use static_assertions::assert_eq_size;
use std::sync::atomic::{AtomicU8, Ordering};

/// Spins before `wait` starts yielding the CPU between retries.
const SPIN_LIMIT: u32 = 1 << 14;

/// A saturating 8-bit counter manipulated only through atomic CAS.
///
/// Under the channel protocol the counter only ever holds 0 or 1: the slot it
/// guards is either available or it is not.
#[repr(transparent)]
pub struct BinarySemaphore(AtomicU8);

assert_eq_size!(BinarySemaphore, u8);

unsafe impl ShmSafe for BinarySemaphore {}

impl BinarySemaphore {
    pub fn new(count: u8) -> Self {
        Self(AtomicU8::new(count))
    }

    /// Atomically decrement the counter, unless it is exhausted.
    ///
    /// Returns whether the decrement happened. A successful decrement is an
    /// acquire operation: everything the signalling side wrote before its
    /// `signal` is visible once `try_wait` returns true.
    pub fn try_wait(&self) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                // Lost the race (or spurious failure): retry against the
                // most recently observed value.
                Err(observed) => current = observed,
            }
        }
    }

    /// Spin until `try_wait` succeeds.
    ///
    /// This is a busy-wait, not a blocking sleep. After a bounded number of
    /// spins it starts yielding the CPU between retries, which keeps idle
    /// overhead tolerable without changing the contract: the decrement
    /// happens-before this function returns.
    pub fn wait(&self) {
        let mut spins: u32 = 0;
        while !self.try_wait() {
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Atomically increment the counter.
    ///
    /// A release operation: everything written before `signal` is visible to
    /// the side whose `wait` consumes this increment. Signalling never blocks.
    pub fn signal(&self) {
        let previous = self.0.fetch_add(1, Ordering::Release);
        debug_assert!(previous < u8::MAX, "semaphore overflow");
    }

    /// Current counter value, for diagnostics and tests.
    pub fn value(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_try_wait_on_exhausted() {
        let sem = BinarySemaphore::new(0);
        assert!(!sem.try_wait());
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn test_try_wait_decrements() {
        let sem = BinarySemaphore::new(1);
        assert!(sem.try_wait());
        assert_eq!(sem.value(), 0);
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_signal_then_wait() {
        let sem = BinarySemaphore::new(0);
        sem.signal();
        assert_eq!(sem.value(), 1);
        sem.wait();
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn test_wait_blocks_until_signalled() {
        let sem = Arc::new(BinarySemaphore::new(0));
        let signaller = Arc::clone(&sem);

        let start = Instant::now();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            signaller.signal();
        });

        sem.wait();
        assert!(start.elapsed() >= Duration::from_millis(50));
        handle.join().unwrap();
    }

    #[test]
    fn test_two_thread_ping_pong() {
        let ping = Arc::new(BinarySemaphore::new(1));
        let pong = Arc::new(BinarySemaphore::new(0));
        const ROUNDS: u32 = 10_000;

        let peer = {
            let ping = Arc::clone(&ping);
            let pong = Arc::clone(&pong);
            std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    pong.wait();
                    ping.signal();
                }
            })
        };

        for _ in 0..ROUNDS {
            ping.wait();
            pong.signal();
        }
        peer.join().unwrap();

        // Strict alternation leaves exactly one token in the pair.
        assert_eq!(ping.value() + pong.value(), 1);
    }
}
