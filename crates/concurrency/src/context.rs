//! The MVCC context: global epoch, pin slots, RAII guards.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use xylem_core::{Error, Result};

/// Default cap on registered threads.
pub const DEFAULT_MAX_THREADS: usize = 8192;

/// Sentinel stored in an unpinned slot.
const NOT_PINNED: u64 = u64::MAX;

thread_local! {
    // Per-thread cache of this thread's slot in each context, keyed by the
    // context's id. Makes register_thread idempotent per thread.
    static THREAD_SLOTS: RefCell<HashMap<u64, Arc<PinSlot>>> = RefCell::new(HashMap::new());
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One thread's pin slot, padded to its own cache line so concurrent
/// pin/unpin traffic from different threads never false-shares.
#[repr(align(64))]
#[derive(Debug)]
pub struct PinSlot {
    epoch: AtomicU64,
}

impl PinSlot {
    fn new() -> Self {
        PinSlot {
            epoch: AtomicU64::new(NOT_PINNED),
        }
    }

    /// Pin this slot at `epoch` (release store).
    #[inline]
    pub fn pin(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Release);
    }

    /// Clear the pin (release store of the sentinel).
    #[inline]
    pub fn unpin(&self) {
        self.epoch.store(NOT_PINNED, Ordering::Release);
    }

    /// The pinned epoch, or `None` if unpinned.
    #[inline]
    pub fn pinned_epoch(&self) -> Option<u64> {
        match self.epoch.load(Ordering::Acquire) {
            NOT_PINNED => None,
            e => Some(e),
        }
    }
}

/// Process-wide epoch counter plus the registry of per-thread pin slots.
#[derive(Debug)]
pub struct MvccContext {
    context_id: u64,
    registry: Mutex<Vec<Arc<PinSlot>>>,
    global_epoch: AtomicU64,
    max_threads: usize,
}

impl Default for MvccContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MvccContext {
    /// Create a context with the default thread cap.
    pub fn new() -> Self {
        Self::with_max_threads(DEFAULT_MAX_THREADS)
    }

    /// Create a context with an explicit thread cap.
    pub fn with_max_threads(max_threads: usize) -> Self {
        MvccContext {
            context_id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            registry: Mutex::new(Vec::new()),
            global_epoch: AtomicU64::new(0),
            max_threads,
        }
    }

    /// Register the calling thread, returning its stable pin slot.
    ///
    /// Idempotent per thread: repeated calls return the same slot. Fails
    /// with `InvalidState` once the thread cap is reached.
    pub fn register_thread(&self) -> Result<Arc<PinSlot>> {
        THREAD_SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(slot) = slots.get(&self.context_id) {
                return Ok(Arc::clone(slot));
            }
            let mut registry = self.registry.lock();
            if registry.len() >= self.max_threads {
                return Err(Error::InvalidState(format!(
                    "thread registration cap reached ({})",
                    self.max_threads
                )));
            }
            let slot = Arc::new(PinSlot::new());
            registry.push(Arc::clone(&slot));
            slots.insert(self.context_id, Arc::clone(&slot));
            Ok(slot)
        })
    }

    /// Drop the calling thread's slot association.
    ///
    /// The slot itself stays in the registry (unpinned); a later
    /// `register_thread` on this thread allocates a fresh slot. Useful for
    /// thread pools and tests.
    pub fn deregister_thread(&self) {
        THREAD_SLOTS.with(|slots| {
            if let Some(slot) = slots.borrow_mut().remove(&self.context_id) {
                slot.unpin();
            }
        });
    }

    /// Pin the calling thread at `epoch`, returning a guard that unpins on
    /// drop. The guard is move-only; it cannot be cloned.
    pub fn pin(&self, epoch: u64) -> Result<EpochGuard> {
        let slot = self.register_thread()?;
        slot.pin(epoch);
        Ok(EpochGuard { slot: Some(slot) })
    }

    /// Pin the calling thread at the current global epoch.
    pub fn pin_current(&self) -> Result<EpochGuard> {
        self.pin(self.current_epoch())
    }

    /// Minimum epoch any registered thread is pinned at, or the current
    /// global epoch if nothing is pinned.
    ///
    /// Called by the reclaimer, not on the read hot path.
    pub fn min_active_epoch(&self) -> u64 {
        let registry = self.registry.lock();
        let mut min_epoch = NOT_PINNED;
        for slot in registry.iter() {
            if let Some(e) = slot.pinned_epoch() {
                min_epoch = min_epoch.min(e);
            }
        }
        if min_epoch == NOT_PINNED {
            self.global_epoch.load(Ordering::Acquire)
        } else {
            min_epoch
        }
    }

    /// Current global epoch.
    #[inline]
    pub fn current_epoch(&self) -> u64 {
        self.global_epoch.load(Ordering::Acquire)
    }

    /// Advance the global epoch; returns the new value.
    #[inline]
    pub fn advance_epoch(&self) -> u64 {
        self.global_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// O(1) epoch restore used only during recovery, before any reader or
    /// writer thread starts. Never regresses the epoch.
    pub fn recover_set_epoch(&self, target: u64) {
        let cur = self.global_epoch.load(Ordering::Relaxed);
        if target <= cur {
            return;
        }
        self.global_epoch.store(target, Ordering::Release);
    }

    /// Number of registered pin slots.
    pub fn registered_threads(&self) -> usize {
        self.registry.lock().len()
    }
}

/// RAII pin: unpins the owning slot when dropped.
///
/// Deliberately not `Clone` — a copied guard would unpin twice and could
/// release a reader's protection while it is still traversing.
#[derive(Debug)]
pub struct EpochGuard {
    slot: Option<Arc<PinSlot>>,
}

impl EpochGuard {
    /// Re-pin at a different epoch without releasing the slot in between.
    pub fn repin(&self, epoch: u64) {
        if let Some(slot) = &self.slot {
            slot.pin(epoch);
        }
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.unpin();
        }
    }
}
