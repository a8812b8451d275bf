//! Components C and D of the codecage DBT core: per-thread signal state
//! ([`thread`]) and the master signal handler ([`handler`], [`trampoline`]).
//!
//! `thread` and `handler` are pure and portable; only [`trampoline`] and
//! [`mcontext_io`] touch a real `ucontext_t`, and only for Linux/x86-64
//! today. Everything this crate exposes at the top level corresponds to
//! one pre/post-syscall interception point or runtime entry a host
//! embedding the translator needs to call.

pub mod action;
pub mod altstack;
pub mod handler;
pub mod mcontext_io;
pub mod pending;
pub mod restorer;
pub mod sigtable;
pub mod thread;
pub mod trampoline;

pub use action::{ActionTable, Handler, SharedActionTable, SigAction, SigActionFlags};
pub use altstack::AltStack;
pub use handler::{DeliveryPlan, Disposition, ForgeKind, PcClass, SelfModOutcome};
pub use pending::{PendingFrame, PendingPool, PendingQueue, FPSTATE_BYTES};
pub use restorer::RestorerCache;
pub use sigtable::{can_always_delay, default_action, default_needs_interception, DefaultAction, SIG_MAX};
pub use thread::{
    CloneRecord, KernelSigAction, MaskHow, RecoveryFrame, SigactionDecision, SigprocmaskResult,
    ThreadSignalState,
};
pub use trampoline::ThreadContext;

use anyhow::Context;
use codecage_core::{Config, MachineContext, MemoryQuery};
use codecage_xlate::{SpillSource, TranslateOutcome, Translator};

/// `signal_thread_init` (spec §6 "Exposed"): builds a thread's signal
/// state, stashing whatever the kernel already has installed for each
/// signal (spec §4.3).
pub fn signal_thread_init(config: &Config) -> ThreadSignalState {
    ThreadSignalState::init(config, |sig| unsafe { trampoline::query_preexisting(sig) })
}

/// `signal_thread_exit` (spec §6): waits for any in-flight `clone()`
/// children to finish copying this thread's state before the caller frees
/// it (spec §4.3 "Clone coordination").
pub fn signal_thread_exit(state: &ThreadSignalState) {
    state.wait_for_unstarted_children();
}

/// `signal_thread_inherit(clone_record)` (spec §6): the child side of a
/// `clone()`, rebuilding its own state from what the parent handed over in
/// [`ThreadSignalState::begin_clone`].
pub fn signal_thread_inherit(record: CloneRecord, config: &Config) -> ThreadSignalState {
    ThreadSignalState::inherit(record, config, |sig| unsafe { trampoline::query_preexisting(sig) })
}

/// Installs the real kernel handler for every signal `state` intercepts.
/// `sigaction` is process-wide, so this only needs to run once per signal
/// regardless of how many threads later call [`signal_thread_init`].
///
/// Not on the signal-delivery hot path (it runs once, at startup), so it
/// returns `anyhow::Result` per SPEC_FULL.md's ambient error-handling
/// section rather than the narrower [`codecage_core::Error`] the tracker
/// and master handler use on every fault.
pub fn install_intercepted_handlers(state: &ThreadSignalState) -> anyhow::Result<()> {
    for sig in 1..sigtable::SIG_MAX as i32 {
        if state.we_intercept(sig) {
            unsafe { trampoline::install_master_handler(sig) }
                .with_context(|| format!("installing master handler for signal {sig}"))?;
        }
    }
    Ok(())
}

/// `is_signal_restorer_code(pc)` (spec §6): whether `pc` is the app's
/// verified `sigreturn` restorer thunk, memoized per signal in `state`.
pub fn is_signal_restorer_code(
    state: &mut ThreadSignalState,
    sig: i32,
    memory: &dyn MemoryQuery,
    pc: u64,
) -> bool {
    state.is_restorer_valid(sig, memory, pc)
}

/// `translate_app_pc(cache_pc)` (spec §6): PC-only translation, never
/// touching register state.
pub fn translate_app_pc(
    translator: &Translator,
    mcontext: &MachineContext,
    spill_source: &dyn SpillSource,
) -> (TranslateOutcome, MachineContext) {
    translator.translate(mcontext, true, spill_source)
}

/// `translate_app_state(mcontext, restore_memory)` (spec §6): full-state
/// translation, used for synchronous delivery (spec §4.4's
/// `Disposition::DeliverSync`).
pub fn translate_app_state(
    translator: &Translator,
    mcontext: &MachineContext,
    spill_source: &dyn SpillSource,
) -> (TranslateOutcome, MachineContext) {
    translator.translate(mcontext, false, spill_source)
}

/// `forge_exception(target_pc, kind)` (spec §6): see [`handler::forge_exception`].
pub use handler::forge_exception;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
/// `thread_set_self_context(sc)` (spec §6): replaces the kernel-visible
/// context for the signal delivery currently in progress with `sc`. Only
/// meaningful while a [`trampoline`] entry for this thread is on the
/// stack; there is no raw `ucontext_t` to rewrite otherwise.
///
/// # Safety
/// `ucontext` must be the same pointer the active master-handler
/// invocation received.
pub unsafe fn thread_set_self_context(ucontext: *mut libc::ucontext_t, sc: &MachineContext) {
    mcontext_io::write_mcontext(ucontext, sc);
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
/// `handle_sigreturn(is_rt)` (spec §6 "Exposed"): see
/// [`trampoline::handle_sigreturn`]. The host's syscall gateway calls this
/// from its intercepted `rt_sigreturn` path, passing the frame the app is
/// unwinding.
///
/// # Safety
/// Same as [`trampoline::handle_sigreturn`].
pub unsafe fn handle_sigreturn(
    ctx: &ThreadContext,
    state: &mut ThreadSignalState,
    ucontext: *const libc::ucontext_t,
) {
    trampoline::handle_sigreturn(ctx, state, ucontext);
}
