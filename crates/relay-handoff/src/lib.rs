//! Bounded producer/consumer handoff over a counting semaphore.
//!
//! One producer fills a source buffer in fixed-size packet strides and
//! releases one permit per completed stride; one consumer acquires a permit
//! per packet and copies that packet into its own destination buffer. The
//! semaphore is the only coordination: because permits never exceed packets
//! actually fully written, an acquired permit proves the corresponding span
//! is complete, and the acquire/release pair provides the happens-before
//! edge that makes the producer's writes visible. No lock, no shared
//! counter, no extra fence.
//!
//! # Consumer state machine
//!
//! ```text
//!                 +----------------+  permit   +---------------+
//!            +--> | AwaitingPermit | --------> | CopyingPacket | --+
//!            |    +----------------+           +---------------+   |
//!            |      |          |                                   |
//!            |      | timeout  | wait error        offset < total  |
//!            |      v          v                                   |
//!            |  +----------+  +--------+                           |
//!            |  | TimedOut |  | Failed |                           |
//!            |  +----------+  +--------+                           |
//!            |                                  offset == total    |
//!            +------------------+    +------------------------------+
//!                               |    v
//!                          +-----------+
//!                          | Completed |
//!                          +-----------+
//! ```
//!
//! Terminal states carry the exit codes of the original demo: 100 for
//! completion, 123 for a permit timeout, 321 for any other wait failure.
//! The per-wait timeout is a liveness failsafe, not business logic: it
//! exists to detect a stalled producer, and it is the consumer's only
//! bounded-wait mechanism.

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod driver;

use relay_sync::Semaphore;
use relay_vmem::{VirtualRegion, VmemResult};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Size in bytes of one pattern element.
pub const ELEM_SIZE: usize = std::mem::size_of::<u32>();

// ============================================================================
// Errors
// ============================================================================

/// Result type for handoff operations.
pub type HandoffResult<T> = Result<T, HandoffError>;

/// Errors from plan construction and driver orchestration.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The transfer plan violates a size constraint.
    #[error("invalid transfer plan: {0}")]
    InvalidPlan(String),

    /// The destination buffer could not be allocated from the heap.
    #[error("destination buffer allocation of {requested} bytes failed")]
    AllocationFailed {
        /// Requested buffer size in bytes.
        requested: usize,
    },

    /// The source region could not be reserved from the OS.
    #[error("source region reservation failed")]
    Vmem(#[from] relay_vmem::VmemError),

    /// A primitive operation failed during setup or join.
    #[error("primitive failure")]
    Sync(#[from] relay_sync::SyncError),
}

/// First point where the copied data diverges from the expected pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("destination mismatch at element {index}: found {found}, expected {expected}")]
pub struct PatternMismatch {
    /// Element index of the first mismatch.
    pub index: usize,
    /// Value found at that index.
    pub found: u32,
    /// Value the pattern requires there.
    pub expected: u32,
}

// ============================================================================
// Transfer Plan
// ============================================================================

/// Immutable description of one handoff run.
///
/// Validated on construction so every downstream consumer can rely on the
/// invariants: sizes are nonzero, `total_size % packet_size == 0`, and
/// packets tile exactly into [`ELEM_SIZE`] elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    packet_size: usize,
    total_size: usize,
    timeout: Duration,
}

impl TransferPlan {
    /// Default bytes per permit (1 MiB).
    pub const DEFAULT_PACKET_SIZE: usize = 1024 * 1024;
    /// Default total transfer size (64 MiB).
    pub const DEFAULT_TOTAL_SIZE: usize = 64 * 1024 * 1024;
    /// Default per-wait timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Build a plan, validating the size contract.
    pub fn new(packet_size: usize, total_size: usize, timeout: Duration) -> HandoffResult<Self> {
        if packet_size == 0 || total_size == 0 {
            return Err(HandoffError::InvalidPlan(
                "packet size and total size must be nonzero".to_owned(),
            ));
        }
        if packet_size % ELEM_SIZE != 0 {
            return Err(HandoffError::InvalidPlan(format!(
                "packet size {packet_size} is not a multiple of the {ELEM_SIZE}-byte element"
            )));
        }
        if total_size % packet_size != 0 {
            return Err(HandoffError::InvalidPlan(format!(
                "total size {total_size} is not a multiple of packet size {packet_size}"
            )));
        }
        if timeout.is_zero() {
            return Err(HandoffError::InvalidPlan(
                "per-wait timeout must be nonzero".to_owned(),
            ));
        }
        Ok(Self {
            packet_size,
            total_size,
            timeout,
        })
    }

    /// Bytes transferred per permit.
    #[inline]
    #[must_use]
    pub const fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Total bytes transferred over the run.
    #[inline]
    #[must_use]
    pub const fn total_size(&self) -> usize {
        self.total_size
    }

    /// Per-wait timeout applied to each permit acquisition.
    #[inline]
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of packets in the run (`total_size / packet_size`).
    #[inline]
    #[must_use]
    pub const fn packet_count(&self) -> usize {
        self.total_size / self.packet_size
    }

    /// Number of pattern elements in the run.
    #[inline]
    #[must_use]
    pub const fn elem_count(&self) -> usize {
        self.total_size / ELEM_SIZE
    }
}

impl Default for TransferPlan {
    fn default() -> Self {
        Self {
            packet_size: Self::DEFAULT_PACKET_SIZE,
            total_size: Self::DEFAULT_TOTAL_SIZE,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

// ============================================================================
// Consumer Exit
// ============================================================================

/// Terminal state of the consumer thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    /// Every packet was copied; offset reached the total size.
    Completed,
    /// A permit acquisition timed out before the transfer finished.
    TimedOut,
    /// A permit acquisition failed for a reason other than timeout.
    WaitFailed,
}

impl ConsumerExit {
    /// Numeric exit code reported for this terminal state.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Completed => 100,
            Self::TimedOut => 123,
            Self::WaitFailed => 321,
        }
    }
}

impl fmt::Display for ConsumerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::TimedOut => write!(f, "timed out"),
            Self::WaitFailed => write!(f, "wait failed"),
        }
    }
}

// ============================================================================
// Source Buffer
// ============================================================================

/// Producer-owned source buffer backed by a [`VirtualRegion`].
///
/// The buffer hands out packet-granular raw views from a shared reference,
/// because the producer writes spans while the consumer concurrently reads
/// spans it has already been granted. Rust's reference rules cannot express
/// that protocol directly; the semaphore does. A span is written exclusively
/// by the producer before the matching permit release, and read-only to the
/// consumer after the matching acquire - the acquire/release pair is the
/// happens-before edge.
#[derive(Debug)]
pub struct SourceBuffer {
    region: VirtualRegion,
}

// Safety: concurrent span access is governed by the semaphore protocol
// described above; every span is either exclusively written (pre-release)
// or shared read-only (post-acquire), never both.
unsafe impl Sync for SourceBuffer {}

impl SourceBuffer {
    /// Reserve a zeroed source buffer of `len` bytes.
    pub fn reserve(len: usize) -> VmemResult<Self> {
        Ok(Self {
            region: VirtualRegion::reserve(len)?,
        })
    }

    /// Length of the buffer in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// Whether the buffer is empty. Always false for a live buffer.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Read-only view of `len` bytes starting at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must have acquired the permit covering this span, and the
    /// span must lie within the buffer.
    #[inline]
    pub unsafe fn span(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.region.len());
        // Safety: in-bounds per the caller contract; the permit acquisition
        // ordered the producer's writes before this read.
        unsafe { std::slice::from_raw_parts(self.region.as_ptr().add(offset), len) }
    }

    /// Writable view of `len` bytes starting at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must be the producer, must not yet have released the
    /// permit covering this span, and the span must lie within the buffer.
    #[inline]
    pub unsafe fn span_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.region.len());
        // Safety: exclusive access per the caller contract; nobody can read
        // this span before the permit it is published under is released.
        unsafe { std::slice::from_raw_parts_mut(self.region.as_ptr().add(offset), len) }
    }
}

// ============================================================================
// Pattern Fill and Verification
// ============================================================================

/// Fill `bytes` with the sequential element pattern starting at `first`.
///
/// Element `i` of the overall dataset holds the value `i` as a native-endian
/// `u32`; `first` is the dataset index of the first element in `bytes`.
pub fn write_pattern(bytes: &mut [u8], first: usize) {
    debug_assert_eq!(bytes.len() % ELEM_SIZE, 0);
    for (k, chunk) in bytes.chunks_exact_mut(ELEM_SIZE).enumerate() {
        chunk.copy_from_slice(&((first + k) as u32).to_ne_bytes());
    }
}

/// Check `bytes` against the sequential element pattern.
///
/// Returns the first offending element index and value on mismatch.
pub fn verify_pattern(bytes: &[u8]) -> Result<(), PatternMismatch> {
    debug_assert_eq!(bytes.len() % ELEM_SIZE, 0);
    for (index, chunk) in bytes.chunks_exact(ELEM_SIZE).enumerate() {
        let found = u32::from_ne_bytes(chunk.try_into().expect("chunk is ELEM_SIZE bytes"));
        let expected = index as u32;
        if found != expected {
            return Err(PatternMismatch {
                index,
                found,
                expected,
            });
        }
    }
    Ok(())
}

// ============================================================================
// Producer
// ============================================================================

/// Fill the source buffer packet by packet, releasing one permit per
/// completed stride. Returns the number of permits actually posted.
///
/// A failed release is logged and production continues: the producer must
/// never deadlock on a semaphore anomaly, and the consumer's timed wait is
/// the backstop for the resulting permit shortfall. The permit count can
/// therefore fall behind the packets ready, but never run ahead of them.
pub fn fill_sequential(source: &SourceBuffer, plan: &TransferPlan, permits: &Semaphore) -> usize {
    debug_assert_eq!(source.len(), plan.total_size());
    let elems_per_packet = plan.packet_size() / ELEM_SIZE;

    let mut posted = 0;
    for packet in 0..plan.packet_count() {
        let offset = packet * plan.packet_size();
        // Safety: the permit for this span has not been released yet, so the
        // producer still owns it exclusively.
        let span = unsafe { source.span_mut(offset, plan.packet_size()) };
        write_pattern(span, packet * elems_per_packet);

        match permits.release() {
            Ok(()) => posted += 1,
            Err(err) => warn!(packet, error = %err, "permit release failed, continuing"),
        }
    }

    debug!(posted, packets = plan.packet_count(), "producer finished");
    posted
}

/// Fill the whole source buffer with the pattern without posting permits.
///
/// Setup half of the pre-satisfied scenario: the semaphore is created with
/// every permit already available and the consumer should never block.
pub fn fill_sequential_without_posting(source: &SourceBuffer, plan: &TransferPlan) {
    debug_assert_eq!(source.len(), plan.total_size());
    // Safety: no permits are in flight, so the producer owns the buffer.
    let all = unsafe { source.span_mut(0, plan.total_size()) };
    write_pattern(all, 0);
}

// ============================================================================
// Consumer
// ============================================================================

/// What the consumer thread hands back at termination.
#[derive(Debug)]
pub struct ConsumerOutcome {
    /// Terminal state of the state machine.
    pub exit: ConsumerExit,
    /// Bytes copied before termination; equals the total size on completion.
    pub bytes_copied: usize,
    /// The destination buffer, returned so the verifier reads it strictly
    /// after the consumer has terminated.
    pub dest: Vec<u8>,
}

/// Run the consumer state machine to a terminal state.
///
/// Takes ownership of the destination buffer and returns it in the
/// [`ConsumerOutcome`]; while the consumer runs, nothing else can touch it.
/// The copy offset advances monotonically by exactly one packet per
/// acquired permit and never passes the total size.
///
/// # Panics
///
/// Panics if `dest` or `source` is not exactly `plan.total_size()` bytes.
pub fn consume(
    source: &SourceBuffer,
    mut dest: Vec<u8>,
    plan: &TransferPlan,
    permits: &Semaphore,
) -> ConsumerOutcome {
    assert_eq!(
        dest.len(),
        plan.total_size(),
        "destination buffer must match the plan's total size"
    );
    assert_eq!(
        source.len(),
        plan.total_size(),
        "source buffer must match the plan's total size"
    );

    let mut offset = 0;
    let exit = loop {
        if offset == plan.total_size() {
            break ConsumerExit::Completed;
        }

        // AwaitingPermit
        match permits.acquire_timeout(plan.timeout()) {
            Ok(()) => {
                // CopyingPacket. Safety: the acquired permit covers this
                // span and orders the producer's writes before our read.
                let src = unsafe { source.span(offset, plan.packet_size()) };
                dest[offset..offset + plan.packet_size()].copy_from_slice(src);
                offset += plan.packet_size();
            }
            Err(err) if err.is_timeout() => {
                error!(offset, error = %err, "semaphore wait timeout");
                break ConsumerExit::TimedOut;
            }
            Err(err) => {
                error!(offset, error = %err, "semaphore wait failed");
                break ConsumerExit::WaitFailed;
            }
        }
    };

    debug!(%exit, bytes_copied = offset, "consumer terminated");
    ConsumerOutcome {
        exit,
        bytes_copied: offset,
        dest,
    }
}

// ============================================================================
// Tests
// ============================================================================
