//! Component D: the Master Signal Handler (spec §4.4).
//!
//! This module is the pure decision logic only: classifying the PC a signal
//! interrupted, deciding whether to deliver now, queue for later, recover
//! via a try/except slot, or terminate, and planning the app-visible frame.
//! Nothing here touches a real `ucontext_t` or calls `sigaction`; that is
//! [`crate::trampoline`]'s job, mirroring how [`codecage_xlate::Translator`]
//! never sees a raw signal either.

use crate::action::SigActionFlags;
use crate::pending::PendingFrame;
use crate::sigtable::{self, DefaultAction};
use crate::thread::{self, RecoveryFrame, ThreadSignalState};
use codecage_core::{
    ClientHook, ClientHookAction, Dispatcher, FragmentFlags, FragmentId, MachineContext,
    MemoryQuery, SelfModHandler,
};
use codecage_xlate::{SpillSource, TranslateOutcome, Translator};

/// Where a faulting or delayable PC fell, from the master handler's point
/// of view (spec §4.4's classification table).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcClass {
    InCache(FragmentId),
    GeneratedRoutine,
    TranslatorProper,
    Outside,
}

/// Classifies `pc` without consulting anything signal-specific (spec §4.4:
/// "classify the interrupted PC").
pub fn classify_pc(translator: &Translator, pc: u64) -> PcClass {
    if let Some(fragment) = translator.fragments.fragment_pclookup(pc) {
        return PcClass::InCache(fragment);
    }
    if translator.regions.in_generated_routine(pc) {
        return PcClass::GeneratedRoutine;
    }
    if translator.regions.in_translator_proper(pc) {
        return PcClass::TranslatorProper;
    }
    PcClass::Outside
}

/// What [`check_self_modifying_code`] found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelfModOutcome {
    /// Not a self-modifying-code fault; keep classifying normally.
    NotSelfMod,
    /// It was, and the affected fragments were flushed; nothing more to
    /// deliver, the app simply re-executes the faulting instruction.
    Handled,
}

/// The self-modifying-code check (spec §4.4), run before classification for
/// `SIGSEGV`/`SIGBUS` faults at an in-cache PC: "compute the memory target
/// of the faulting instruction... if it lies in a region the translator
/// write-protected because it is executable, flush and rebuild the
/// fragments covering that region, then let the app re-execute rather than
/// deliver anything".
pub fn check_self_modifying_code(
    translator: &Translator,
    selfmod: &dyn SelfModHandler,
    signum: i32,
    mcontext: &MachineContext,
) -> SelfModOutcome {
    if signum != libc::SIGSEGV && signum != libc::SIGBUS {
        return SelfModOutcome::NotSelfMod;
    }
    let pc = mcontext.pc();
    if translator.fragments.fragment_pclookup(pc).is_none() {
        return SelfModOutcome::NotSelfMod;
    }
    let Some((target, is_write)) = translator.decoder.compute_memory_target(pc, mcontext) else {
        return SelfModOutcome::NotSelfMod;
    };
    if !is_write || !selfmod.was_executable_area_writable(target) {
        return SelfModOutcome::NotSelfMod;
    }

    log::debug!("self-modifying code: write to {target:#x} from fragment at {pc:#x}, flushing");
    if !selfmod.handle_modified_code(target) {
        codecage_core::fatal(
            "handle_modified_code could not flush/rebuild fragments after a self-modifying-code write",
        );
    }
    SelfModOutcome::Handled
}

/// What to do with a signal once it has been classified (spec §4.4's
/// classification table, collapsed to one decision per row).
#[derive(Debug)]
pub enum Disposition {
    /// Unlink the fragment (if any) and queue the frame; the dispatcher
    /// returns on its own and drains it on next reentry.
    Defer {
        fragment: Option<FragmentId>,
        patch_syscall_jump: bool,
    },
    /// Translate `mcontext` now and deliver to the app handler (or its
    /// default action) without ever returning to the dispatcher.
    DeliverSync,
    /// Queue the frame without ever attempting to translate the PC: it is
    /// not safe to expose a translator-internal PC to the app, so delivery
    /// is deferred until the thread naturally reaches app code.
    QueueUntranslated,
    /// A registered try/except recovery frame covers this PC; longjmp to
    /// it instead of building any app-visible frame.
    Recover(RecoveryFrame),
    /// No recovery is possible; the thread must die.
    CrashCleanly,
}

/// The classification table itself (spec §4.4). Call [`check_self_modifying_code`]
/// first for `SIGSEGV`/`SIGBUS`; this function assumes that check already
/// returned [`SelfModOutcome::NotSelfMod`].
pub fn classify_disposition(
    translator: &Translator,
    state: &ThreadSignalState,
    signum: i32,
    pc: u64,
) -> Disposition {
    let always_delay = sigtable::can_always_delay(signum);
    match classify_pc(translator, pc) {
        PcClass::InCache(fragment) => {
            if always_delay {
                let flags = translator.fragments.flags(fragment);
                Disposition::Defer {
                    fragment: Some(fragment),
                    patch_syscall_jump: flags.contains(FragmentFlags::HAS_SYSCALL),
                }
            } else {
                Disposition::DeliverSync
            }
        }
        PcClass::GeneratedRoutine => {
            if always_delay {
                Disposition::QueueUntranslated
            } else {
                Disposition::CrashCleanly
            }
        }
        PcClass::TranslatorProper | PcClass::Outside => {
            if let Some(frame) = state.find_recovery_frame(pc) {
                Disposition::Recover(frame)
            } else if always_delay {
                Disposition::QueueUntranslated
            } else {
                Disposition::CrashCleanly
            }
        }
    }
}

/// Carries out a [`Disposition::Defer`]: unlinks the fragment (forcing the
/// dispatcher to return on its own rather than via an outgoing edge),
/// patches its post-syscall jump if it has an inlined syscall, and queues
/// the already-captured frame (spec §4.4).
pub fn defer_signal(
    dispatcher: &dyn Dispatcher,
    state: &mut ThreadSignalState,
    fragment: Option<FragmentId>,
    patch_syscall_jump: bool,
    signum: i32,
    frame: PendingFrame,
) {
    if let Some(fragment) = fragment {
        dispatcher.unlink_fragment(fragment);
        if patch_syscall_jump {
            dispatcher.patch_post_syscall_jump(fragment);
        }
        state.set_interrupted_fragment(fragment);
    }
    state.enqueue_pending(signum, frame);
}

/// Once a drained pending frame has been fully delivered (or the last one
/// for an interrupted fragment has been), relink the fragment so normal
/// dispatch resumes (spec §4.4, the inverse of [`defer_signal`]'s unlink).
pub fn relink_if_idle(dispatcher: &dyn Dispatcher, state: &mut ThreadSignalState) {
    if state.has_signals_pending() {
        return;
    }
    if let Some(fragment) = state.interrupted_fragment() {
        dispatcher.relink_fragment(fragment);
        state.clear_interrupted_fragment();
    }
}

/// Carries out [`Disposition::DeliverSync`]: translates the interrupted
/// context and asks the optional client hook whether to still deliver it
/// (spec §4.4's delivery path, spec §6 "on_signal").
pub fn translate_for_delivery(
    translator: &Translator,
    hook: Option<&dyn ClientHook>,
    signum: i32,
    mcontext: &MachineContext,
    spill_source: &dyn SpillSource,
) -> (TranslateOutcome, MachineContext) {
    let (outcome, translated) = translator.translate(mcontext, false, spill_source);
    if outcome == TranslateOutcome::Fail {
        return (outcome, translated);
    }
    match hook.map(|h| h.on_signal(signum, translated.pc())) {
        Some(ClientHookAction::Suppress) => (TranslateOutcome::Fail, translated),
        _ => (outcome, translated),
    }
}

/// The plan for building an app-visible frame (spec §4.4 "Frame
/// construction for app delivery"): which stack to land on, which restorer
/// to use, the mask the app handler runs under, and whether the action
/// resets to `SIG_DFL` after this one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryPlan {
    pub frame_sp: u64,
    pub restorer: u64,
    pub blocked_mask: u64,
    pub clears_to_default: bool,
}

/// The minimum unused red zone this code reserves below the chosen stack
/// pointer before placing a frame, matching the System V x86-64 ABI's own
/// 128-byte red zone (spec §4.4 leaves the exact figure unspecified; this
/// is the conventional choice other POSIX signal-delivery code uses).
const FRAME_RED_ZONE: u64 = 128;

/// Builds a [`DeliveryPlan`] for delivering `signum` to the app (spec
/// §4.4). `interrupted_sp` is the stack pointer the app was using when the
/// signal arrived; `our_restorer` is this translator's own `SA_RESTORER`
/// thunk, used whenever the app's own restorer cannot be trusted.
pub fn plan_delivery(
    state: &mut ThreadSignalState,
    memory: &dyn MemoryQuery,
    signum: i32,
    interrupted_sp: u64,
    our_restorer: u64,
) -> DeliveryPlan {
    state.restore_after_sigsuspend_if_pending();

    let action = state.app_action(signum);
    let altstack = state.app_altstack();

    let frame_sp = if action.flags.contains(SigActionFlags::ONSTACK)
        && !altstack.disabled
        && !altstack.contains(interrupted_sp)
    {
        altstack.top() - FRAME_RED_ZONE
    } else {
        interrupted_sp - FRAME_RED_ZONE
    };
    let frame_sp = frame_sp & !0xf;

    let restorer = if action.flags.contains(SigActionFlags::RESTORER)
        && state.is_restorer_valid(signum, memory, action.restorer)
    {
        action.restorer
    } else {
        log::debug!("signal {signum}: app restorer not verified, substituting our own");
        our_restorer
    };

    let mut blocked_mask = action.mask | state.app_mask();
    if !action.flags.contains(SigActionFlags::NODEFER) {
        blocked_mask |= thread::mask_bit(signum as usize);
    }

    DeliveryPlan {
        frame_sp,
        restorer,
        blocked_mask,
        clears_to_default: action.flags.contains(SigActionFlags::RESETHAND),
    }
}

/// Drains and applies [`sigtable::default_action`] for a signal whose app
/// action is `SIG_DFL`/`SIG_IGN` and that therefore has no app frame to
/// build (spec §4.4: rows whose app action is default still need their
/// outcome applied).
pub fn default_action(signum: i32) -> DefaultAction {
    sigtable::default_action(signum)
}

/// `handle_sigreturn(is_rt)` (spec §6 "Exposed"): the app handler returned
/// through its restorer. Restores the mask that was in effect before
/// delivery and clears the interrupted-fragment bookkeeping once nothing
/// else is pending.
pub fn handle_sigreturn(
    dispatcher: &dyn Dispatcher,
    state: &mut ThreadSignalState,
    sigmask_at_delivery: u64,
) {
    state.restore_mask(sigmask_at_delivery);
    relink_if_idle(dispatcher, state);
}

/// What kind of exception [`forge_exception`] should synthesize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForgeKind {
    /// The translator itself could not read or execute `target_pc` (spec
    /// §7 class 4, "Unreadable/unexecutable memory").
    UnreadableMemory,
    /// An arbitrary signal the host wants to forge (e.g. to implement
    /// `SIGILL` for an illegal app instruction it decoded).
    Custom(i32),
}

/// `forge_exception(target_pc, kind)` (spec §6 "Exposed", spec §4.4
/// "Forging signals"): synthesizes a [`PendingFrame`] that was never
/// actually delivered by the kernel, queues it, and redirects the
/// dispatcher to the fcache-return path so it gets drained like any other
/// pending signal.
pub fn forge_exception(
    dispatcher: &dyn Dispatcher,
    state: &mut ThreadSignalState,
    target_pc: u64,
    kind: ForgeKind,
) {
    let signum = match kind {
        ForgeKind::UnreadableMemory => libc::SIGSEGV,
        ForgeKind::Custom(sig) => sig,
    };
    let frame = PendingFrame {
        signum,
        siginfo: [0; 128],
        mcontext: MachineContext::new(target_pc),
        sigmask_at_delivery: state.app_mask(),
        fpstate: None,
        forged: true,
    };
    log::debug!("forging signal {signum} at {target_pc:#x} ({kind:?})");
    state.enqueue_pending(signum, frame);
    dispatcher.set_next_tag(dispatcher.fcache_return_routine());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Handler, SigAction};
    use crate::altstack::AltStack;
    use codecage_core::{
        DecodedInstr, Decoder, FragmentId, FragmentStore, MemoryInfo, SpecialRegions,
        TranslationInfo,
    };
    use std::collections::HashMap;

    struct NoDecode;
    impl Decoder for NoDecode {
        fn decode(&self, _pc: u64) -> Option<DecodedInstr> {
            None
        }
    }

    struct FakeFragments {
        range: Option<(u64, u64, FragmentFlags)>,
    }
    impl FragmentStore for FakeFragments {
        fn fragment_pclookup(&self, pc: u64) -> Option<FragmentId> {
            match self.range {
                Some((start, end, _)) if pc >= start && pc < end => Some(FragmentId(1)),
                _ => None,
            }
        }
        fn fcache_entry_pc(&self, _f: FragmentId) -> u64 {
            self.range.map(|(s, _, _)| s).unwrap_or(0)
        }
        fn in_fcache(&self, pc: u64) -> bool {
            self.fragment_pclookup(pc).is_some()
        }
        fn bounds(&self, _f: FragmentId) -> (u64, u64) {
            self.range.map(|(s, e, _)| (s, e)).unwrap_or((0, 0))
        }
        fn flags(&self, _f: FragmentId) -> FragmentFlags {
            self.range.map(|(_, _, f)| f).unwrap_or(FragmentFlags::empty())
        }
        fn translation_info(&self, _f: FragmentId) -> Option<&TranslationInfo> {
            None
        }
        fn recreate_fragment_ilist(&self, _pc: u64) -> Option<Vec<DecodedInstr>> {
            None
        }
        fn fragment_selfmod_copy_pc(&self, _f: FragmentId) -> Option<u64> {
            None
        }
    }

    struct NoRegions;
    impl SpecialRegions for NoRegions {
        fn is_syscall_gateway(&self, _pc: u64) -> bool {
            false
        }
        fn post_syscall_continuation(&self, _pc: u64) -> Option<u64> {
            None
        }
        fn reset_exit_next_tag(&self, _pc: u64) -> Option<u64> {
            None
        }
        fn in_generated_routine(&self, pc: u64) -> bool {
            pc == 0xaaaa
        }
        fn in_translator_proper(&self, pc: u64) -> bool {
            pc == 0xbbbb
        }
    }

    struct NoopSelfMod;
    impl SelfModHandler for NoopSelfMod {
        fn was_executable_area_writable(&self, _addr: u64) -> bool {
            false
        }
        fn handle_modified_code(&self, _addr: u64) -> bool {
            true
        }
    }

    struct RecordingDispatcher {
        unlinked: std::cell::RefCell<Vec<FragmentId>>,
        relinked: std::cell::RefCell<Vec<FragmentId>>,
        patched: std::cell::RefCell<Vec<FragmentId>>,
    }
    impl RecordingDispatcher {
        fn new() -> Self {
            RecordingDispatcher {
                unlinked: Default::default(),
                relinked: Default::default(),
                patched: Default::default(),
            }
        }
    }
    impl Dispatcher for RecordingDispatcher {
        fn set_next_tag(&self, _pc: u64) {}
        fn fcache_return_routine(&self) -> u64 {
            0x1
        }
        fn forge_exception_entry(&self) -> u64 {
            0x2
        }
        fn unlink_fragment(&self, fragment: FragmentId) {
            self.unlinked.borrow_mut().push(fragment);
        }
        fn relink_fragment(&self, fragment: FragmentId) {
            self.relinked.borrow_mut().push(fragment);
        }
        fn patch_post_syscall_jump(&self, fragment: FragmentId) {
            self.patched.borrow_mut().push(fragment);
        }
    }

    struct FakeMemory {
        bytes: HashMap<u64, Vec<u8>>,
    }
    impl MemoryQuery for FakeMemory {
        fn get_memory_info(&self, _addr: u64) -> Option<MemoryInfo> {
            None
        }
        fn safe_read(&self, src: u64, dst: &mut [u8]) -> bool {
            match self.bytes.get(&src) {
                Some(b) if b.len() >= dst.len() => {
                    dst.copy_from_slice(&b[..dst.len()]);
                    true
                }
                _ => false,
            }
        }
    }

    fn cfg() -> codecage_core::Config {
        codecage_core::Config::default()
    }

    #[test]
    fn classifies_in_cache_pc() {
        let decoder = NoDecode;
        let fragments = FakeFragments { range: Some((0x1000, 0x2000, FragmentFlags::empty())) };
        let regions = NoRegions;
        let translator = Translator::new(&decoder, &fragments, &regions, None);
        assert_eq!(classify_pc(&translator, 0x1500), PcClass::InCache(FragmentId(1)));
    }

    #[test]
    fn classifies_generated_routine_and_translator_proper() {
        let decoder = NoDecode;
        let fragments = FakeFragments { range: None };
        let regions = NoRegions;
        let translator = Translator::new(&decoder, &fragments, &regions, None);
        assert_eq!(classify_pc(&translator, 0xaaaa), PcClass::GeneratedRoutine);
        assert_eq!(classify_pc(&translator, 0xbbbb), PcClass::TranslatorProper);
        assert_eq!(classify_pc(&translator, 0xcccc), PcClass::Outside);
    }

    #[test]
    fn always_delayable_in_cache_signal_defers() {
        let decoder = NoDecode;
        let fragments = FakeFragments {
            range: Some((0x1000, 0x2000, FragmentFlags::HAS_SYSCALL)),
        };
        let regions = NoRegions;
        let translator = Translator::new(&decoder, &fragments, &regions, None);
        let state = ThreadSignalState::init(&cfg(), |_| None);
        let disposition = classify_disposition(&translator, &state, libc::SIGCHLD, 0x1500);
        match disposition {
            Disposition::Defer { fragment, patch_syscall_jump } => {
                assert_eq!(fragment, Some(FragmentId(1)));
                assert!(patch_syscall_jump);
            }
            other => panic!("expected Defer, got {other:?}"),
        }
    }

    #[test]
    fn synchronous_in_cache_signal_delivers_now() {
        let decoder = NoDecode;
        let fragments = FakeFragments { range: Some((0x1000, 0x2000, FragmentFlags::empty())) };
        let regions = NoRegions;
        let translator = Translator::new(&decoder, &fragments, &regions, None);
        let state = ThreadSignalState::init(&cfg(), |_| None);
        let disposition = classify_disposition(&translator, &state, libc::SIGSEGV, 0x1500);
        assert!(matches!(disposition, Disposition::DeliverSync));
    }

    #[test]
    fn outside_all_regions_with_no_recovery_crashes() {
        let decoder = NoDecode;
        let fragments = FakeFragments { range: None };
        let regions = NoRegions;
        let translator = Translator::new(&decoder, &fragments, &regions, None);
        let state = ThreadSignalState::init(&cfg(), |_| None);
        let disposition = classify_disposition(&translator, &state, libc::SIGSEGV, 0xcccc);
        assert!(matches!(disposition, Disposition::CrashCleanly));
    }

    #[test]
    fn registered_recovery_frame_wins_over_crash() {
        let decoder = NoDecode;
        let fragments = FakeFragments { range: None };
        let regions = NoRegions;
        let translator = Translator::new(&decoder, &fragments, &regions, None);
        let mut state = ThreadSignalState::init(&cfg(), |_| None);
        state.push_recovery_frame(RecoveryFrame {
            guarded_start: 0xbbbb,
            guarded_end: 0xbbbc,
            recovery_target: 0x7777,
            saved_mask: 0,
        });
        let disposition = classify_disposition(&translator, &state, libc::SIGSEGV, 0xbbbb);
        match disposition {
            Disposition::Recover(frame) => assert_eq!(frame.recovery_target, 0x7777),
            other => panic!("expected Recover, got {other:?}"),
        }
    }

    #[test]
    fn self_mod_check_ignores_non_segv_signals() {
        let decoder = NoDecode;
        let fragments = FakeFragments { range: Some((0x1000, 0x2000, FragmentFlags::empty())) };
        let regions = NoRegions;
        let translator = Translator::new(&decoder, &fragments, &regions, None);
        let selfmod = NoopSelfMod;
        let mc = MachineContext::new(0x1500);
        let outcome = check_self_modifying_code(&translator, &selfmod, libc::SIGUSR1, &mc);
        assert_eq!(outcome, SelfModOutcome::NotSelfMod);
    }

    struct WriteDecoder;
    impl Decoder for WriteDecoder {
        fn decode(&self, _pc: u64) -> Option<DecodedInstr> {
            None
        }
        fn compute_memory_target(
            &self,
            _pc: u64,
            _mcontext: &MachineContext,
        ) -> Option<(u64, bool)> {
            Some((0x3000, true))
        }
    }

    struct WritableSelfMod {
        flushed: std::cell::RefCell<Vec<u64>>,
    }
    impl SelfModHandler for WritableSelfMod {
        fn was_executable_area_writable(&self, addr: u64) -> bool {
            addr == 0x3000
        }
        fn handle_modified_code(&self, addr: u64) -> bool {
            self.flushed.borrow_mut().push(addr);
            true
        }
    }

    #[test]
    fn self_mod_write_flushes_and_reports_handled() {
        let decoder = WriteDecoder;
        let fragments = FakeFragments { range: Some((0x1000, 0x2000, FragmentFlags::empty())) };
        let regions = NoRegions;
        let translator = Translator::new(&decoder, &fragments, &regions, None);
        let selfmod = WritableSelfMod { flushed: Default::default() };
        let mc = MachineContext::new(0x1500);
        let outcome = check_self_modifying_code(&translator, &selfmod, libc::SIGSEGV, &mc);
        assert_eq!(outcome, SelfModOutcome::Handled);
        assert_eq!(*selfmod.flushed.borrow(), vec![0x3000]);
    }

    #[test]
    fn defer_unlinks_and_patches_then_relink_clears_interrupted_fragment() {
        let dispatcher = RecordingDispatcher::new();
        let mut state = ThreadSignalState::init(&cfg(), |_| None);
        let frame = PendingFrame {
            signum: libc::SIGCHLD,
            siginfo: [0; 128],
            mcontext: MachineContext::new(0x1500),
            sigmask_at_delivery: 0,
            fpstate: None,
            forged: false,
        };
        defer_signal(&dispatcher, &mut state, Some(FragmentId(1)), true, libc::SIGCHLD, frame);
        assert_eq!(*dispatcher.unlinked.borrow(), vec![FragmentId(1)]);
        assert_eq!(*dispatcher.patched.borrow(), vec![FragmentId(1)]);
        assert_eq!(state.interrupted_fragment(), Some(FragmentId(1)));

        state.drain_one_pending();
        relink_if_idle(&dispatcher, &mut state);
        assert_eq!(*dispatcher.relinked.borrow(), vec![FragmentId(1)]);
        assert_eq!(state.interrupted_fragment(), None);
    }

    #[test]
    fn plan_delivery_prefers_altstack_when_app_requested_it() {
        let mut state = ThreadSignalState::init(&cfg(), |_| None);
        state.handle_sigaltstack(Some(AltStack { base: 0x8000, size: 0x1000, disabled: false }));
        state.handle_sigaction(
            libc::SIGUSR1,
            Some(SigAction {
                handler: Handler::Address(0x4000),
                flags: SigActionFlags::ONSTACK,
                ..Default::default()
            }),
            0xdead,
            0xbeef,
        );
        let memory = FakeMemory { bytes: Default::default() };
        let plan = plan_delivery(&mut state, &memory, libc::SIGUSR1, 0x7fff_0000, 0xbeef);
        assert!(plan.frame_sp < 0x9000 && plan.frame_sp >= 0x8000);
        assert_eq!(plan.restorer, 0xbeef, "unverifiable app restorer falls back to ours");
    }

    #[test]
    fn forge_exception_queues_a_forged_frame_and_redirects_dispatcher() {
        let dispatcher = RecordingDispatcher::new();
        let mut state = ThreadSignalState::init(&cfg(), |_| None);
        forge_exception(&dispatcher, &mut state, 0x9999, ForgeKind::UnreadableMemory);
        assert!(state.has_signals_pending());
        let (signum, frame) = state.drain_one_pending().unwrap();
        assert_eq!(signum, libc::SIGSEGV);
        assert!(frame.forged);
        assert_eq!(frame.mcontext.pc(), 0x9999);
    }
}
