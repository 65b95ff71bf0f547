//! Portable concurrency primitives for the relay handoff demo.
//!
//! This crate wraps native thread lifecycle and a counting semaphore behind
//! one interface so the handoff protocol and the verification driver are
//! written once, regardless of the host platform. Key pieces:
//!
//! - **Worker threads** - Spawn, join-exactly-once, release-on-drop
//! - **Counting semaphore** - Atomic post/wait with an explicit initial count
//! - **Timed waits** - Timeout is a first-class, distinguishable outcome
//!
//! # Error signaling
//!
//! Every fallible operation returns [`SyncError`]. A timed-out wait is
//! reported as [`SyncError::Timeout`], never folded into a generic failure:
//! callers react differently to the two (a timeout is a liveness diagnostic,
//! anything else is fatal), so the distinction is part of the contract and
//! checkable via [`SyncError::is_timeout`].
//!
//! # Lifecycle contracts
//!
//! The original, platform-specific renditions of these primitives carried
//! preconditions that could only be documented: join a handle exactly once,
//! never destroy a running handle, never destroy a semaphore somebody is
//! still waiting on. Here the same contracts are enforced by ownership:
//! [`WorkerHandle::join`] consumes the handle, OS resources are released on
//! drop, and a [`Semaphore`] cannot be dropped while a waiter still borrows
//! it.

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Result type for primitive operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors produced by the primitive layer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A timed wait elapsed without a permit becoming available.
    ///
    /// Kept distinct from every other variant: callers treat a timeout as a
    /// stalled-peer diagnostic rather than a hard failure.
    #[error("timed out after {timeout:?} waiting for a permit")]
    Timeout {
        /// The wait window that elapsed.
        timeout: Duration,
    },

    /// The OS could not allocate scheduling resources for a new thread.
    #[error("failed to spawn worker thread `{name}`")]
    ResourceExhausted {
        /// Name the thread would have carried.
        name: String,
        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// A primitive was constructed with an out-of-contract argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A release would push the permit count past [`Semaphore::MAX_PERMITS`].
    #[error("semaphore permit count would exceed the maximum representable count")]
    PermitOverflow,

    /// A worker thread terminated by panicking instead of returning.
    #[error("worker thread `{0}` panicked")]
    WorkerPanicked(String),
}

impl SyncError {
    /// Whether this error is a wait timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

// ============================================================================
// Counting Semaphore
// ============================================================================

/// A counting semaphore: a non-negative permit count with atomic
/// release/acquire operations.
///
/// The count itself is hidden; the only observations are "a permit became
/// available to me" (acquire returned) and "no permit appeared within the
/// window" (timed acquire failed). The primitive supports any number of
/// releasing and acquiring parties, though the handoff demo uses exactly one
/// of each.
///
/// # Example
///
/// ```
/// use relay_sync::Semaphore;
/// use std::time::Duration;
///
/// let sem = Semaphore::new(1).unwrap();
/// sem.acquire_timeout(Duration::from_millis(10)).unwrap();
/// assert!(sem
///     .acquire_timeout(Duration::from_millis(10))
///     .unwrap_err()
///     .is_timeout());
/// ```
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Maximum representable permit count.
    pub const MAX_PERMITS: usize = isize::MAX as usize;

    /// Create a semaphore holding `initial` permits.
    ///
    /// Negative counts are unrepresentable by type; counts above
    /// [`Self::MAX_PERMITS`] are rejected with
    /// [`SyncError::InvalidArgument`].
    pub fn new(initial: usize) -> SyncResult<Self> {
        if initial > Self::MAX_PERMITS {
            return Err(SyncError::InvalidArgument(format!(
                "initial permit count {initial} exceeds maximum"
            )));
        }
        Ok(Self {
            permits: Mutex::new(initial),
            available: Condvar::new(),
        })
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Block up to `timeout` for a permit.
    ///
    /// Returns [`SyncError::Timeout`] if no permit became available within
    /// the window. Spurious condvar wakeups are absorbed by re-checking the
    /// count against a fixed deadline.
    pub fn acquire_timeout(&self, timeout: Duration) -> SyncResult<()> {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SyncError::Timeout { timeout });
            }
            if self.available.wait_for(&mut permits, remaining).timed_out() && *permits == 0 {
                return Err(SyncError::Timeout { timeout });
            }
        }
        *permits -= 1;
        Ok(())
    }

    /// Take a permit if one is immediately available.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Add exactly one permit, waking at most one blocked waiter.
    ///
    /// Fails with [`SyncError::PermitOverflow`] if the count is already at
    /// [`Self::MAX_PERMITS`].
    pub fn release(&self) -> SyncResult<()> {
        {
            let mut permits = self.permits.lock();
            if *permits == Self::MAX_PERMITS {
                return Err(SyncError::PermitOverflow);
            }
            *permits += 1;
        }
        self.available.notify_one();
        Ok(())
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &*self.permits.lock())
            .finish()
    }
}

// ============================================================================
// Worker Threads
// ============================================================================

/// Handle to a spawned worker thread.
///
/// The handle exclusively owns the thread's join side. [`join`] consumes the
/// handle, so a thread can be joined at most once; dropping an unjoined
/// handle detaches the thread and lets the OS reclaim it on exit.
///
/// [`join`]: WorkerHandle::join
pub struct WorkerHandle<T> {
    name: String,
    inner: JoinHandle<T>,
}

impl<T> WorkerHandle<T> {
    /// Name the worker was spawned with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker has terminated.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Block until the worker terminates and return its result.
    ///
    /// A panicking worker surfaces as [`SyncError::WorkerPanicked`]; the
    /// panic payload is dropped.
    pub fn join(self) -> SyncResult<T> {
        self.inner
            .join()
            .map_err(|_| SyncError::WorkerPanicked(self.name))
    }
}

impl<T> fmt::Debug for WorkerHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Spawn a named worker thread running `f`.
///
/// Fails with [`SyncError::ResourceExhausted`] if the OS cannot allocate
/// scheduling resources.
pub fn spawn_worker<F, T>(name: &str, f: F) -> SyncResult<WorkerHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let inner = thread::Builder::new()
        .name(name.to_owned())
        .spawn(f)
        .map_err(|source| SyncError::ResourceExhausted {
            name: name.to_owned(),
            source,
        })?;

    Ok(WorkerHandle {
        name: name.to_owned(),
        inner,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn initial_permits_are_acquirable_without_release() {
        let sem = Semaphore::new(3).unwrap();
        for _ in 0..3 {
            sem.acquire_timeout(Duration::from_millis(10)).unwrap();
        }
        assert!(!sem.try_acquire());
    }

    #[test]
    fn initial_count_over_maximum_is_rejected() {
        let err = Semaphore::new(Semaphore::MAX_PERMITS + 1).unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
    }

    #[test]
    fn timed_wait_reports_timeout_distinctly() {
        let sem = Semaphore::new(0).unwrap();
        let start = Instant::now();
        let err = sem.acquire_timeout(Duration::from_millis(50)).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn release_wakes_a_blocked_waiter() {
        let sem = Arc::new(Semaphore::new(0).unwrap());
        let waiter = {
            let sem = Arc::clone(&sem);
            spawn_worker("waiter", move || {
                sem.acquire_timeout(Duration::from_secs(5)).is_ok()
            })
            .unwrap()
        };

        thread::sleep(Duration::from_millis(20));
        sem.release().unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn each_release_admits_exactly_one_acquire() {
        let sem = Arc::new(Semaphore::new(0).unwrap());
        let mut waiters = Vec::new();
        for i in 0..4 {
            let sem = Arc::clone(&sem);
            waiters.push(
                spawn_worker(&format!("waiter-{i}"), move || {
                    sem.acquire_timeout(Duration::from_secs(5)).is_ok()
                })
                .unwrap(),
            );
        }

        for _ in 0..4 {
            sem.release().unwrap();
        }
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
        // All four permits were consumed.
        assert!(!sem.try_acquire());
    }

    #[test]
    fn release_at_maximum_overflows() {
        let sem = Semaphore::new(Semaphore::MAX_PERMITS).unwrap();
        let err = sem.release().unwrap_err();
        assert!(matches!(err, SyncError::PermitOverflow));
        assert!(!err.is_timeout());
    }

    #[test]
    fn worker_join_returns_the_result() {
        let handle = spawn_worker("unit", || 42_u32).unwrap();
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn worker_panic_surfaces_as_join_error() {
        let handle = spawn_worker("panicker", || -> u32 { panic!("boom") }).unwrap();
        let err = handle.join().unwrap_err();
        assert!(matches!(err, SyncError::WorkerPanicked(name) if name == "panicker"));
    }

    #[test]
    fn try_acquire_does_not_block() {
        let sem = Semaphore::new(1).unwrap();
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release().unwrap();
        assert!(sem.try_acquire());
    }
}
