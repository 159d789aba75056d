//! # fedlink Runtime
//!
//! Time and cancellation primitives shared by the fedlink crates.
//!
//! This crate provides:
//! - **Clock**: monotonic millisecond clock injected into timing code
//! - **Deadline**: cooperative, advisory cancellation checked between work units
//!
//! ## Feature Flags
//!
//! - `tokio` (default): timer-backed deadline expiry

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic clock measured in milliseconds
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds elapsed since an arbitrary fixed origin
    fn now(&self) -> u64;

    /// Milliseconds elapsed since `earlier` (saturating)
    fn elapsed_since(&self, earlier: u64) -> u64 {
        self.now().saturating_sub(earlier)
    }
}

/// Wall-clock implementation backed by [`Instant`]
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Mock clock for testing, advanced by hand
#[derive(Debug, Default)]
pub struct MockClock {
    current_time_ms: AtomicU64,
}

impl MockClock {
    /// Create a new mock clock starting at zero
    pub fn new() -> Self {
        Self {
            current_time_ms: AtomicU64::new(0),
        }
    }

    /// Advance the mock clock
    pub fn advance(&self, duration: Duration) {
        self.current_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> u64 {
        self.current_time_ms.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> u64 {
        (**self).now()
    }
}

/// Advisory cancellation signal.
///
/// Long-running work checks [`Deadline::is_expired`] between units of work
/// and stops early once it returns `true`. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    expired: Arc<AtomicBool>,
}

impl Deadline {
    /// Create a deadline that never expires unless cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the deadline as expired
    pub fn cancel(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }

    /// Whether work should stop
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// Create a deadline that expires after `budget` on the Tokio timer
    #[cfg(feature = "tokio")]
    pub fn expire_after(budget: Duration) -> Self {
        let deadline = Self::new();
        let flag = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            flag.cancel();
        });
        deadline
    }
}

/// Get the default clock
pub fn default_clock() -> SystemClock {
    SystemClock::new()
}
