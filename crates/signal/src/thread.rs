//! Component C: Per-Thread Signal State (spec §4.3).
//!
//! Owns everything spec §3's "Thread signal state" lists and services the
//! pre-/post-syscall interception points for `sigaction`, `sigprocmask`,
//! `sigaltstack`, and `sigsuspend`. The master signal handler ([`crate::handler`])
//! reads and mutates this through `&mut ThreadSignalState` since both run on
//! the same thread and never concurrently with each other.

use crate::action::{ActionTable, Handler, SharedActionTable, SigAction, SigActionFlags};
use crate::altstack::AltStack;
use crate::pending::{PendingFrame, PendingPool, PendingQueue};
use crate::restorer::{self, RestorerCache};
use crate::sigtable::{self, SIG_MAX};
use codecage_core::{Config, FragmentId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) fn mask_bit(sig: usize) -> u64 {
    if sig == 0 || sig > 64 {
        0
    } else {
        1u64 << (sig - 1)
    }
}

fn is_realtime_signal(sig: usize) -> bool {
    sig >= libc::SIGRTMIN() as usize && sig < SIG_MAX
}

/// Which `sigprocmask` operation was requested (spec §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskHow {
    Block,
    Unblock,
    SetMask,
}

/// What [`ThreadSignalState::handle_sigaction`] decides the kernel-visible
/// action should become.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigactionDecision {
    /// Install `SIG_IGN`/`SIG_DFL` (or leave unchanged) directly; we have no
    /// reason of our own to intercept this signal (spec §4.3: "If
    /// installing `SIG_IGN`/`SIG_DFL` for a signal we do not intercept for
    /// our own purposes, pass through").
    PassThrough,
    /// Install this translator-rewritten action instead of the app's.
    Rewritten(KernelSigAction),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelSigAction {
    pub handler: u64,
    pub mask: u64,
    pub flags: SigActionFlags,
    pub restorer: u64,
}

/// The result of [`ThreadSignalState::handle_sigprocmask`]: the app-visible
/// old mask, plus the bits (if any) that must still be forwarded to the
/// real kernel `sigprocmask` syscall (spec §4.3: "the remaining bits pass
/// through to the kernel").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigprocmaskResult {
    pub old_app_mask: u64,
    pub kernel_set: Option<u64>,
}

/// A registered try/except recovery slot (design note, spec §9: "model as
/// an explicit recovery-frame stack per thread... resumes via an `unwind`
/// primitive"). `guarded_start..guarded_end` is the PC range a fault inside
/// translator-proper code recovers from by jumping straight to
/// `recovery_target` with `saved_mask` reinstated, bypassing any app frame
/// entirely: there is no `sigreturn` involved, so nothing else needs
/// restoring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryFrame {
    pub guarded_start: u64,
    pub guarded_end: u64,
    pub recovery_target: u64,
    pub saved_mask: u64,
}

/// Everything carried from a `clone()`-ing parent to its child before the
/// child has finished constructing its own [`ThreadSignalState`] (spec
/// §4.3 "Clone coordination").
pub struct CloneRecord {
    shared_handler: bool,
    action: CloneActionSource,
    app_mask: u64,
    app_altstack: AltStack,
    parent_unstarted_children: Arc<AtomicUsize>,
}

enum CloneActionSource {
    Shared(Arc<Mutex<SharedActionTable>>),
    Snapshot(Box<[SigAction; SIG_MAX]>),
}

/// Component C's data model (spec §3 "Thread signal state").
pub struct ThreadSignalState {
    action: ActionTable,
    we_intercept: [bool; SIG_MAX],
    pending: Vec<PendingQueue>,
    pub pending_pool: PendingPool,
    app_mask: u64,
    in_sigsuspend: bool,
    saved_mask: u64,
    app_altstack: AltStack,
    our_altstack: AltStack,
    interrupted_fragment: Option<FragmentId>,
    restorer_cache: Vec<RestorerCache>,
    signals_pending: AtomicBool,
    unstarted_children: Arc<AtomicUsize>,
    recovery_stack: Vec<RecoveryFrame>,
}

impl ThreadSignalState {
    /// `signal_thread_init` (spec §6 "Exposed"). `preexisting` answers, for
    /// each signal, the non-default handler the kernel already had
    /// installed at process/thread startup (spec §4.3's "for each signal
    /// the kernel already has a non-default handler for at startup, stash
    /// it as the app action").
    pub fn init(config: &Config, preexisting: impl Fn(i32) -> Option<SigAction>) -> Self {
        Self::new_with(
            config,
            preexisting,
            ActionTable::owned(),
            0,
            AltStack { base: 0, size: 0, disabled: true },
        )
    }

    fn new_with(
        config: &Config,
        preexisting: impl Fn(i32) -> Option<SigAction>,
        mut action: ActionTable,
        app_mask: u64,
        app_altstack: AltStack,
    ) -> Self {
        let mut we_intercept = [false; SIG_MAX];
        for sig in 1..SIG_MAX {
            if is_realtime_signal(sig) && !config.intercept_realtime_signals {
                continue;
            }
            if sigtable::default_needs_interception(sig as i32) {
                we_intercept[sig] = true;
            }
            if let Some(existing) = preexisting(sig as i32) {
                action.set_mut(sig, existing);
                we_intercept[sig] = true;
            }
        }
        // The translator's own machinery always needs SIGSEGV/SIGBUS
        // regardless of their default action (which already needs
        // interception, see table in `sigtable`) plus whichever signals the
        // host has chosen for thread suspension/profiling; those are the
        // host's concern (it calls `force_intercept` after `init`).
        let pending = (0..SIG_MAX).map(|sig| PendingQueue::new(is_realtime_signal(sig))).collect();

        ThreadSignalState {
            action,
            we_intercept,
            pending,
            pending_pool: PendingPool::new(config.pending_pool_unit_bytes),
            app_mask,
            in_sigsuspend: false,
            saved_mask: 0,
            app_altstack,
            our_altstack: AltStack { base: 0, size: config.altstack_size, disabled: false },
            interrupted_fragment: None,
            restorer_cache: vec![RestorerCache::Unknown; SIG_MAX],
            signals_pending: AtomicBool::new(false),
            unstarted_children: Arc::new(AtomicUsize::new(0)),
            recovery_stack: Vec::new(),
        }
    }

    /// Forces interception of a signal the translator needs for its own
    /// machinery even when its default action would not otherwise require
    /// it (e.g. the chosen suspend or profiling signal, spec §4.3).
    pub fn force_intercept(&mut self, sig: i32) {
        self.we_intercept[sig as usize] = true;
    }

    pub fn we_intercept(&self, sig: i32) -> bool {
        self.we_intercept.get(sig as usize).copied().unwrap_or(false)
    }

    pub fn app_action(&self, sig: i32) -> SigAction {
        self.action.get(sig as usize)
    }

    pub fn app_mask(&self) -> u64 {
        self.app_mask
    }

    pub fn is_blocked(&self, sig: i32) -> bool {
        self.app_mask & mask_bit(sig as usize) != 0
    }

    pub fn our_altstack(&self) -> AltStack {
        self.our_altstack
    }

    pub fn app_altstack(&self) -> AltStack {
        self.app_altstack
    }

    pub fn interrupted_fragment(&self) -> Option<FragmentId> {
        self.interrupted_fragment
    }

    pub fn set_interrupted_fragment(&mut self, fragment: FragmentId) {
        self.interrupted_fragment = Some(fragment);
    }

    pub fn clear_interrupted_fragment(&mut self) {
        self.interrupted_fragment = None;
    }

    pub fn is_restorer_valid(&mut self, sig: i32, memory: &dyn codecage_core::MemoryQuery, pc: u64) -> bool {
        restorer::is_signal_restorer_code(&mut self.restorer_cache, sig as usize, memory, pc)
    }

    /// Reinstalls `mask` as the current `app_mask` directly, bypassing the
    /// intercepted-bits projection `handle_sigprocmask` applies (spec §4.4
    /// "Delivery mechanism": the mask in effect when a frame was captured
    /// is restored verbatim on `sigreturn`, not merged against anything).
    pub fn restore_mask(&mut self, mask: u64) {
        self.app_mask = mask;
    }

    /// Pushes a try/except recovery slot onto this thread's stack (design
    /// note, spec §9).
    pub fn push_recovery_frame(&mut self, frame: RecoveryFrame) {
        self.recovery_stack.push(frame);
    }

    pub fn pop_recovery_frame(&mut self) -> Option<RecoveryFrame> {
        self.recovery_stack.pop()
    }

    /// The innermost registered recovery frame whose guarded range contains
    /// `pc`, if any (spec §4.4's classification table: "if it matches a
    /// registered try/except... slot, longjmp to it").
    pub fn find_recovery_frame(&self, pc: u64) -> Option<RecoveryFrame> {
        self.recovery_stack
            .iter()
            .rev()
            .find(|f| pc >= f.guarded_start && pc < f.guarded_end)
            .copied()
    }

    /// `handle_sigaction` pre/post-syscall hook (spec §4.3, spec §6).
    /// Records the app's request and decides what the kernel-visible
    /// action should become. When `new_act` is `None` (a query-only
    /// `sigaction(sig, NULL, &old)`), no mutation happens; the synthesized
    /// `oldact` never exposes our own handler address, since this table
    /// only ever stores the app's view (spec §4.3's "showing `SIG_DFL` when
    /// we intercept but the app did not").
    pub fn handle_sigaction(
        &mut self,
        sig: i32,
        new_act: Option<SigAction>,
        master_handler_addr: u64,
        our_restorer: u64,
    ) -> (SigAction, SigactionDecision) {
        let idx = sig as usize;
        let old = self.action.get(idx);
        let Some(new_act) = new_act else {
            return (old, SigactionDecision::PassThrough);
        };

        let already_intercepted = self.we_intercept[idx];
        let app_wants_default_or_ignore =
            matches!(new_act.handler, Handler::Default | Handler::Ignore);

        self.action.set_mut(idx, new_act);

        if !already_intercepted && app_wants_default_or_ignore {
            log::debug!("sigaction(sig={sig}): passthrough SIG_DFL/SIG_IGN, not intercepted");
            return (old, SigactionDecision::PassThrough);
        }

        self.we_intercept[idx] = true;
        log::debug!("sigaction(sig={sig}): installing master handler, app handler={:?}", new_act.handler);
        (
            old,
            SigactionDecision::Rewritten(KernelSigAction {
                handler: master_handler_addr,
                mask: u64::MAX,
                flags: SigActionFlags::SIGINFO | SigActionFlags::ONSTACK | SigActionFlags::RESTORER,
                restorer: our_restorer,
            }),
        )
    }

    fn intercepted_mask(&self) -> u64 {
        let mut m = 0u64;
        for sig in 1..SIG_MAX {
            if self.we_intercept[sig] {
                m |= mask_bit(sig);
            }
        }
        m
    }

    /// `handle_sigprocmask` (spec §4.3): only bits for intercepted signals
    /// are projected onto `app_mask`; the rest pass straight to the kernel.
    pub fn handle_sigprocmask(&mut self, how: MaskHow, set: Option<u64>) -> SigprocmaskResult {
        let old = self.app_mask;
        let Some(set) = set else {
            return SigprocmaskResult { old_app_mask: old, kernel_set: None };
        };

        let intercepted = self.intercepted_mask();
        let app_bits = set & intercepted;
        let kernel_bits = set & !intercepted;

        self.app_mask = match how {
            MaskHow::Block => old | app_bits,
            MaskHow::Unblock => old & !app_bits,
            MaskHow::SetMask => (old & !intercepted) | app_bits,
        };

        if self.newly_unblocked_has_pending(old) {
            self.signals_pending.store(true, Ordering::Release);
        }

        SigprocmaskResult { old_app_mask: old, kernel_set: Some(kernel_bits) }
    }

    fn newly_unblocked_has_pending(&self, old_mask: u64) -> bool {
        for sig in 1..SIG_MAX {
            let bit = mask_bit(sig);
            let was_blocked = old_mask & bit != 0;
            let still_blocked = self.app_mask & bit != 0;
            if was_blocked && !still_blocked && !self.pending[sig].is_empty() {
                return true;
            }
        }
        false
    }

    /// `handle_sigaltstack` (spec §4.3): entirely emulated, the kernel
    /// keeps our own alternate stack throughout.
    pub fn handle_sigaltstack(&mut self, new: Option<AltStack>) -> AltStack {
        let old = self.app_altstack;
        if let Some(new) = new {
            self.app_altstack = new;
        }
        old
    }

    /// `handle_sigsuspend` (spec §4.3): save `app_mask`, install the
    /// suspend mask, mark `in_sigsuspend`.
    pub fn handle_sigsuspend(&mut self, mask: u64) {
        self.saved_mask = self.app_mask;
        self.app_mask = mask;
        self.in_sigsuspend = true;
    }

    /// Called by the master handler just before building the app-visible
    /// frame: if the thread is inside `sigsuspend`, this is the first
    /// intercepted delivery, so restore `saved_mask` and clear the flag
    /// (spec §4.3, testable scenario 4).
    pub fn restore_after_sigsuspend_if_pending(&mut self) -> bool {
        if self.in_sigsuspend {
            self.app_mask = self.saved_mask;
            self.in_sigsuspend = false;
            true
        } else {
            false
        }
    }

    /// Enqueues `frame` for `sig`; returns `false` if it coalesced with an
    /// already-pending non-RT frame (spec §3 "capped at 1").
    pub fn enqueue_pending(&mut self, sig: i32, frame: PendingFrame) -> bool {
        let idx = sig as usize;
        let newly = self.pending[idx].push(&self.pending_pool, frame);
        self.signals_pending.store(true, Ordering::Release);
        newly
    }

    /// Drains one deliverable pending frame (the lowest-numbered unblocked
    /// signal with a non-empty queue), matching spec §5's "Pending signals
    /// are drained one at a time per dispatcher reentry."
    pub fn drain_one_pending(&mut self) -> Option<(i32, PendingFrame)> {
        for sig in 1..SIG_MAX {
            if self.app_mask & mask_bit(sig) != 0 {
                continue;
            }
            if let Some(frame) = self.pending[sig].pop(&self.pending_pool) {
                if self.all_pending_empty() {
                    self.signals_pending.store(false, Ordering::Release);
                }
                return Some((sig as i32, frame));
            }
        }
        None
    }

    fn all_pending_empty(&self) -> bool {
        self.pending.iter().all(PendingQueue::is_empty)
    }

    pub fn has_signals_pending(&self) -> bool {
        self.signals_pending.load(Ordering::Acquire)
    }

    /// Promotes an owned action table to a shared one in place, so a
    /// subsequent `begin_clone(shared_handler: true)` has something to
    /// share (spec §4.3 "Clone coordination": "ancestor establishes a
    /// mutex and refcount shared with the child").
    pub fn promote_to_shared(&mut self) {
        if let ActionTable::Owned(table) = &self.action {
            let shared = Arc::new(Mutex::new(SharedActionTable { actions: **table }));
            self.action = ActionTable::Shared(shared);
        }
    }

    /// Called by the parent before `clone()`. For a non-shared-handler
    /// clone, bumps `unstarted_children` so the parent's exit path waits
    /// for the child to finish copying before freeing anything (spec
    /// §4.3: "the parent's thread-exit path waits for this counter to
    /// reach zero before freeing its tables, preventing a race").
    pub fn begin_clone(&self, shared_handler: bool) -> CloneRecord {
        if !shared_handler {
            self.unstarted_children.fetch_add(1, Ordering::SeqCst);
        }
        let action = if shared_handler {
            match &self.action {
                ActionTable::Shared(arc) => CloneActionSource::Shared(Arc::clone(arc)),
                ActionTable::Owned(_) => {
                    codecage_core::fatal(
                        "begin_clone(shared_handler=true) called on a non-shared action table; \
                         call promote_to_shared first",
                    )
                }
            }
        } else {
            CloneActionSource::Snapshot(self.action.snapshot())
        };
        CloneRecord {
            shared_handler,
            action,
            app_mask: self.app_mask,
            app_altstack: self.app_altstack,
            parent_unstarted_children: Arc::clone(&self.unstarted_children),
        }
    }

    /// `signal_thread_inherit(clone_record)` (spec §6 "Exposed"): builds
    /// the child's state from what the parent handed over in
    /// [`ThreadSignalState::begin_clone`], then decrements the parent's
    /// `unstarted_children` counter.
    pub fn inherit(
        record: CloneRecord,
        config: &Config,
        preexisting: impl Fn(i32) -> Option<SigAction>,
    ) -> Self {
        let action = match record.action {
            CloneActionSource::Shared(arc) => ActionTable::Shared(arc),
            CloneActionSource::Snapshot(table) => ActionTable::Owned(table),
        };
        let shared_handler = record.shared_handler;
        let parent_counter = Arc::clone(&record.parent_unstarted_children);
        let state = Self::new_with(config, preexisting, action, record.app_mask, record.app_altstack);
        if !shared_handler {
            parent_counter.fetch_sub(1, Ordering::SeqCst);
        }
        state
    }

    /// Called from `signal_thread_exit` before tearing anything down:
    /// spins until every in-flight child clone has finished copying our
    /// template (spec §5: "`thread_yield` polls inside `clone`
    /// coordination").
    pub fn wait_for_unstarted_children(&self) {
        while self.unstarted_children.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    }

    /// Number of threads still referring to a shared action table; the
    /// last one out restores original kernel actions and frees it (spec §3
    /// `refcount`).
    pub fn action_refcount(&self) -> usize {
        self.action.refcount()
    }
}
