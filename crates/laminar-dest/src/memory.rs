//! Process-wide memory budget for queued records.
//!
//! [`MemoryBudget`] is a counting gate with a hard byte ceiling fixed at
//! construction. [`acquire`](MemoryBudget::acquire) suspends the caller until
//! the reservation fits, which is how backpressure reaches the publisher:
//! a slow destination keeps bytes reserved in its queue, and new records wait
//! for the spill task to release them.
//!
//! Reservations are scoped: [`MemoryReservation`] releases its bytes exactly
//! once, either through [`MemoryReservation::release`] or on drop, so error
//! paths cannot leak or double-release budget.
//!
//! Blocked acquirers are visible through [`MemoryBudget::has_waiters`] and
//! [`MemoryBudget::pressure_notified`]. Queue consumers holding a partially
//! filled chunk use this to cut it early; otherwise a chunk waiting to fill
//! and a publisher waiting for memory would wait on each other forever.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::error::DestError;

#[derive(Debug, Default)]
struct BudgetState {
    used: u64,
    peak: u64,
}

#[derive(Debug)]
struct BudgetInner {
    max_bytes: u64,
    state: Mutex<BudgetState>,
    released: Notify,
    waiters: AtomicUsize,
    pressure: Notify,
}

/// Counts a blocked acquirer for as long as it is alive, so cancelled
/// acquires stop reporting pressure.
struct WaitGuard<'a> {
    waiters: &'a AtomicUsize,
}

impl<'a> WaitGuard<'a> {
    fn new(waiters: &'a AtomicUsize) -> Self {
        waiters.fetch_add(1, Ordering::AcqRel);
        Self { waiters }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared byte budget with blocking admission.
///
/// Cheap to clone; all clones share the same counter.
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    inner: Arc<BudgetInner>,
}

impl MemoryBudget {
    /// Budget with an explicit ceiling.
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                max_bytes,
                state: Mutex::new(BudgetState::default()),
                released: Notify::new(),
                waiters: AtomicUsize::new(0),
                pressure: Notify::new(),
            }),
        }
    }

    /// Fixes the ceiling at `ratio` of `total_bytes`.
    ///
    /// # Errors
    ///
    /// Returns `DestError::Config` if `ratio` is not in `(0, 1]`.
    pub fn reserve(total_bytes: u64, ratio: f64) -> Result<Self, DestError> {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(DestError::Config(format!(
                "memory ratio must be in (0, 1], got {ratio}"
            )));
        }
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let max_bytes = (total_bytes as f64 * ratio).floor() as u64;
        tracing::info!(total_bytes, ratio, max_bytes, "Reserved queue memory budget");
        Ok(Self::new(max_bytes))
    }

    /// The fixed ceiling.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.inner.max_bytes
    }

    /// Bytes currently reserved.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.inner.state.lock().used
    }

    /// Highest value `used_bytes` has reached.
    #[must_use]
    pub fn peak_bytes(&self) -> u64 {
        self.inner.state.lock().peak
    }

    /// Waits until `bytes` fit under the ceiling, then reserves them.
    ///
    /// # Errors
    ///
    /// Returns `DestError::ReservationTooLarge` if `bytes` exceeds the
    /// ceiling on its own; such a request could never be granted.
    pub async fn acquire(&self, bytes: u64) -> Result<MemoryReservation, DestError> {
        if bytes > self.inner.max_bytes {
            return Err(DestError::ReservationTooLarge {
                requested: bytes,
                max: self.inner.max_bytes,
            });
        }
        let mut waiting: Option<WaitGuard<'_>> = None;
        loop {
            // Register interest before checking so a release between the
            // check and the await is not missed.
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(reservation) = self.try_acquire(bytes) {
                return Ok(reservation);
            }
            if waiting.is_none() {
                waiting = Some(WaitGuard::new(&self.inner.waiters));
                tracing::trace!(
                    bytes,
                    used = self.used_bytes(),
                    max = self.inner.max_bytes,
                    "Memory budget exhausted, waiting"
                );
            }
            self.inner.pressure.notify_waiters();
            notified.await;
        }
    }

    /// Whether any caller is currently blocked in [`acquire`](Self::acquire).
    #[must_use]
    pub fn has_waiters(&self) -> bool {
        self.inner.waiters.load(Ordering::Acquire) > 0
    }

    /// Resolves the next time an acquirer starts waiting or re-checks.
    ///
    /// Call `enable()` on the pinned future before checking
    /// [`has_waiters`](Self::has_waiters) to avoid missing a wakeup.
    pub fn pressure_notified(&self) -> Notified<'_> {
        self.inner.pressure.notified()
    }

    /// Reserves `bytes` if they fit right now.
    #[must_use]
    pub fn try_acquire(&self, bytes: u64) -> Option<MemoryReservation> {
        let mut state = self.inner.state.lock();
        if state.used.saturating_add(bytes) > self.inner.max_bytes {
            return None;
        }
        state.used += bytes;
        state.peak = state.peak.max(state.used);
        Some(MemoryReservation {
            budget: self.clone(),
            bytes,
        })
    }

    /// Returns `bytes` to the budget and wakes blocked acquirers.
    ///
    /// Prefer dropping a [`MemoryReservation`]; this is the raw primitive it
    /// uses.
    ///
    /// # Errors
    ///
    /// Returns `DestError::ReleaseUnderflow` if more bytes are released than
    /// are currently held.
    pub fn release(&self, bytes: u64) -> Result<(), DestError> {
        {
            let mut state = self.inner.state.lock();
            if bytes > state.used {
                return Err(DestError::ReleaseUnderflow {
                    released: bytes,
                    held: state.used,
                });
            }
            state.used -= bytes;
        }
        self.inner.released.notify_waiters();
        Ok(())
    }
}

/// Bytes held against a [`MemoryBudget`], released exactly once.
#[derive(Debug)]
#[must_use = "dropping a reservation releases its bytes immediately"]
pub struct MemoryReservation {
    budget: MemoryBudget,
    bytes: u64,
}

impl MemoryReservation {
    /// Bytes held.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Releases the bytes now.
    pub fn release(self) {
        drop(self);
    }

    /// Folds `other` into this reservation so both are released together.
    pub fn merge(&mut self, mut other: MemoryReservation) {
        self.bytes += other.bytes;
        other.bytes = 0;
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if self.bytes == 0 {
            return;
        }
        if let Err(e) = self.budget.release(self.bytes) {
            debug_assert!(false, "reservation release failed: {e}");
            tracing::error!(error = %e, "Memory reservation release failed");
        }
        self.bytes = 0;
    }
}
