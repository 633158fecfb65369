//! Process-wide admission control for gitserver RPCs.
//!
//! Every connection handed out by the router shares one
//! [`AdmissionController`], so the bound applies to the fleet as a whole
//! rather than to each shard. Acquisition waits for a free slot and does
//! not observe the caller's deadline.

mod layer;

pub use layer::{AdmissionLayer, Admitted, AdmittedBody, BoxError};

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Acquisition failures. The semaphore is never closed while the process
/// is serving, so this only surfaces during shutdown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("admission controller is closed")]
    Closed,
}

/// Fixed-capacity counting semaphore plus an in-flight gauge.
#[derive(Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicI64,
}

impl AdmissionController {
    /// Creates a controller admitting at most `capacity` calls at once.
    /// A capacity of zero would admit nothing and is raised to one; values
    /// above [`Semaphore::MAX_PERMITS`] are lowered to it.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: AtomicI64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Calls currently holding a slot.
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a slot. The slot is returned when the guard is dropped.
    pub async fn acquire(self: &Arc<Self>) -> Result<Admission, AdmissionError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)?;
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(in_flight, "gitserver call admitted");
        Ok(Admission {
            _permit: permit,
            controller: Arc::clone(self),
        })
    }

    /// Runs a unary call while holding a slot. The slot is released when
    /// the call completes, whatever its outcome.
    pub async fn unary<F>(self: &Arc<Self>, call: F) -> Result<F::Output, AdmissionError>
    where
        F: Future,
    {
        let _admission = self.acquire().await?;
        Ok(call.await)
    }

    /// Acquires a slot for a stream. The slot is held until
    /// [`StreamSlot::release`] is first called or every clone is dropped.
    pub async fn stream_slot(self: &Arc<Self>) -> Result<StreamSlot, AdmissionError> {
        let admission = self.acquire().await?;
        Ok(StreamSlot {
            inner: Arc::new(SlotInner {
                released: AtomicBool::new(false),
                admission: Mutex::new(Some(admission)),
            }),
        })
    }

    /// Refuses all future acquisitions. Calls already admitted keep their slots.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

/// A held slot. Dropping it releases the slot and lowers the gauge.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    controller: Arc<AdmissionController>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        let in_flight = self.controller.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        trace!(in_flight, "gitserver call released");
    }
}

/// Slot held for the lifetime of a stream.
///
/// A stream can end on the send side and on the receive side, and both
/// paths release. Only the first release returns the slot; the rest are
/// no-ops, so one stream can never hand back two slots.
#[derive(Debug, Clone)]
pub struct StreamSlot {
    inner: Arc<SlotInner>,
}

#[derive(Debug)]
struct SlotInner {
    released: AtomicBool,
    admission: Mutex<Option<Admission>>,
}

impl StreamSlot {
    /// Returns the slot. Returns `true` only for the call that actually released it.
    pub fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        drop(self.inner.admission.lock().take());
        true
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}
