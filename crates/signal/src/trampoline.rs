//! The only `unsafe`, OS-touching part of this crate: installs the real
//! `sigaction` handler, converts a raw `ucontext_t`/`siginfo_t` into the
//! neutral types [`crate::handler`] reasons about, and drives its
//! decisions back into the kernel-visible context before returning.
//!
//! Split the same way wasmtime's own trap handler is: a thread-local
//! handle to "everything this thread needs" ([`ThreadContext`]), a tiny
//! `tls` module to stash/retrieve it, and one `extern "C"` entry point that
//! does no real work itself.

use crate::action::{Handler, SigAction, SigActionFlags};
use crate::handler::{self, Disposition, SelfModOutcome};
use crate::mcontext_io;
use crate::pending::PendingFrame;
use crate::thread::{MaskHow, ThreadSignalState};
use codecage_core::{Dispatcher, MachineContext, MemoryQuery, SelfModHandler};
use codecage_xlate::{SpillSource, TranslateOutcome, Translator};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, OnceLock};

/// Everything the trampoline needs to reach for while this thread is
/// registered (spec §6's "Consumed" list, gathered into one handle since a
/// thread-local can only hold one pointer).
pub struct ThreadContext<'a> {
    pub state: RefCell<ThreadSignalState>,
    pub translator: Translator<'a>,
    pub dispatcher: &'a dyn Dispatcher,
    pub memory: &'a dyn MemoryQuery,
    pub selfmod: &'a dyn SelfModHandler,
    pub spill_source: &'a dyn SpillSource,
    pub our_restorer: u64,
}

mod tls {
    use super::ThreadContext;
    use std::cell::Cell;
    use std::ptr;

    thread_local!(static PTR: Cell<*const ThreadContext<'static>> = Cell::new(ptr::null()));

    /// Registers `ctx` for the duration of `body`. Any signal the kernel
    /// delivers to this thread while `body` runs can reach it through
    /// [`with`].
    pub fn set<'a, R>(ctx: &ThreadContext<'a>, body: impl FnOnce() -> R) -> R {
        struct Reset(*const ThreadContext<'static>);
        impl Drop for Reset {
            fn drop(&mut self) {
                PTR.with(|p| p.set(self.0));
            }
        }
        // Safety: the pointer never outlives `body`, since `Reset::drop`
        // clears it again before `set` returns; the `'static` cast only
        // ever serves as a TLS storage type, never escapes this module.
        let erased = ctx as *const ThreadContext<'a> as *const ThreadContext<'static>;
        let previous = PTR.with(|p| p.replace(erased));
        let _reset = Reset(previous);
        body()
    }

    pub fn with<R>(f: impl FnOnce(Option<&ThreadContext<'static>>) -> R) -> R {
        PTR.with(|p| {
            let ptr = p.get();
            unsafe { f(if ptr.is_null() { None } else { Some(&*ptr) }) }
        })
    }
}

/// Registers `ctx` as this thread's signal context for the duration of
/// `body` (spec §6's `signal_thread_init`/`signal_thread_exit` bracket a
/// thread's whole lifetime; this is that bracket).
pub fn enter<'a, R>(ctx: &ThreadContext<'a>, body: impl FnOnce() -> R) -> R {
    tls::set(ctx, body)
}

fn previous_actions() -> &'static Mutex<HashMap<i32, libc::sigaction>> {
    static PREVIOUS: OnceLock<Mutex<HashMap<i32, libc::sigaction>>> = OnceLock::new();
    PREVIOUS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Installs the master handler for `sig`, remembering whatever was
/// installed before so a signal delivered with no thread context
/// registered (or one this crate decides to crash on) still reaches it
/// (spec §4.3: "for each signal the kernel already has a non-default
/// handler for at startup, stash it").
///
/// # Safety
/// Must be called before any thread can receive `sig`; sigaction itself is
/// process-wide, so this only needs to run once regardless of thread count.
pub unsafe fn install_master_handler(sig: i32) -> io::Result<()> {
    let mut sa: libc::sigaction = std::mem::zeroed();
    sa.sa_sigaction = master_trampoline as usize;
    sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
    libc::sigemptyset(&mut sa.sa_mask);

    let mut previous: libc::sigaction = std::mem::zeroed();
    if libc::sigaction(sig, &sa, &mut previous) != 0 {
        return Err(io::Error::last_os_error());
    }
    previous_actions()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(sig, previous);
    Ok(())
}

/// Reads whatever the kernel currently has installed for `sig`, translated
/// into the app-visible [`SigAction`] shape `ThreadSignalState::init`'s
/// `preexisting` closure expects. `None` means `SIG_DFL`.
///
/// # Safety
/// Safe to call from any thread at any time; reading a disposition cannot
/// fault.
pub unsafe fn query_preexisting(sig: i32) -> Option<SigAction> {
    let mut current: libc::sigaction = std::mem::zeroed();
    if libc::sigaction(sig, std::ptr::null(), &mut current) != 0 {
        return None;
    }
    sigaction_to_app(&current)
}

fn sigaction_to_app(raw: &libc::sigaction) -> Option<SigAction> {
    let handler = if raw.sa_sigaction == libc::SIG_DFL {
        return None;
    } else if raw.sa_sigaction == libc::SIG_IGN {
        Handler::Ignore
    } else {
        Handler::Address(raw.sa_sigaction as u64)
    };
    Some(SigAction {
        handler,
        mask: 0,
        flags: SigActionFlags::from_bits_truncate(raw.sa_flags as i32),
        restorer: 0,
    })
}

unsafe extern "C" fn master_trampoline(
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let raw_ucontext = ucontext as *mut libc::ucontext_t;
    let mcontext = mcontext_io::read_mcontext(raw_ucontext);

    tls::with(|ctx| {
        let Some(ctx) = ctx else {
            run_previous_or_default(signum, siginfo, ucontext);
            return;
        };
        let mut state = ctx.state.borrow_mut();

        if check_self_mod(ctx, &mcontext, signum) {
            return;
        }

        match handler::classify_disposition(&ctx.translator, &state, signum, mcontext.pc()) {
            Disposition::Defer { fragment, patch_syscall_jump } => {
                let frame = capture_frame(signum, siginfo, &mcontext, state.app_mask(), false);
                handler::defer_signal(ctx.dispatcher, &mut state, fragment, patch_syscall_jump, signum, frame);
                redirect_to_dispatcher(ctx, raw_ucontext, &mcontext);
            }
            Disposition::QueueUntranslated => {
                let frame = capture_frame(signum, siginfo, &mcontext, state.app_mask(), false);
                state.enqueue_pending(signum, frame);
                redirect_to_dispatcher(ctx, raw_ucontext, &mcontext);
            }
            Disposition::Recover(recovery) => {
                state.restore_mask(recovery.saved_mask);
                let mut out = mcontext.clone();
                out.set_pc(recovery.recovery_target);
                mcontext_io::write_mcontext(raw_ucontext, &out);
            }
            Disposition::DeliverSync => {
                let (outcome, translated) = handler::translate_for_delivery(
                    &ctx.translator,
                    ctx.translator.hook,
                    signum,
                    &mcontext,
                    ctx.spill_source,
                );
                if outcome == TranslateOutcome::Fail {
                    codecage_core::fatal(
                        "fault translator could not reconstruct app state for a synchronous signal",
                    );
                }
                let siginfo_bytes = mcontext_io::read_siginfo(siginfo);
                deliver_or_default(ctx, &mut state, signum, &translated, &siginfo_bytes, raw_ucontext);
            }
            Disposition::CrashCleanly => {
                drop(state);
                run_previous_or_default(signum, siginfo, ucontext);
            }
        }
    });
}

fn check_self_mod(ctx: &ThreadContext, mcontext: &MachineContext, signum: i32) -> bool {
    matches!(
        handler::check_self_modifying_code(&ctx.translator, ctx.selfmod, signum, mcontext),
        SelfModOutcome::Handled
    )
}

fn capture_frame(
    signum: i32,
    siginfo: *mut libc::siginfo_t,
    mcontext: &MachineContext,
    sigmask_at_delivery: u64,
    forged: bool,
) -> PendingFrame {
    PendingFrame {
        signum,
        siginfo: unsafe { mcontext_io::read_siginfo(siginfo) },
        mcontext: mcontext.clone(),
        sigmask_at_delivery,
        fpstate: None,
        forged,
    }
}

/// Rewrites the interrupted thread's own sigcontext so that returning from
/// this handler lands it at the dispatcher's fcache-return routine instead
/// of back where it was (spec §4.4 "Delivery mechanism": no app frame is
/// built at all for a deferred signal; the pending queue carries it).
fn redirect_to_dispatcher(ctx: &ThreadContext, raw_ucontext: *mut libc::ucontext_t, mcontext: &MachineContext) {
    let mut out = mcontext.clone();
    out.set_pc(ctx.dispatcher.fcache_return_routine());
    unsafe { mcontext_io::write_mcontext(raw_ucontext, &out) };
}

fn deliver_or_default(
    ctx: &ThreadContext,
    state: &mut ThreadSignalState,
    signum: i32,
    translated: &MachineContext,
    siginfo_bytes: &[u8; 128],
    raw_ucontext: *mut libc::ucontext_t,
) {
    match state.app_action(signum).handler {
        Handler::Ignore => {
            unsafe { mcontext_io::write_mcontext(raw_ucontext, translated) };
        }
        Handler::Default => {
            apply_default_action(signum);
        }
        Handler::Address(handler_pc) => {
            let plan = handler::plan_delivery(state, ctx.memory, signum, translated.xsp(), ctx.our_restorer);

            // spec §7 class 4: pre-check the frame's pages are writable
            // before committing to the copy; the app has a handler, so an
            // unwritable frame means terminating explicitly rather than
            // risking an infinite fault loop.
            let frame_bytes = mcontext_io::app_frame_size() as u64;
            match ctx.memory.get_memory_info(plan.frame_sp.saturating_sub(frame_bytes)) {
                Some(info) if info.writable => {}
                _ => codecage_core::fatal(
                    "app signal frame stack page is unwritable; cannot deliver without an infinite fault loop",
                ),
            }

            let app_frame = unsafe {
                mcontext_io::write_app_frame(
                    plan.frame_sp,
                    plan.restorer,
                    translated,
                    plan.blocked_mask,
                    siginfo_bytes,
                )
            };

            let mut frame_mc = translated.clone();
            frame_mc.set_reg(codecage_core::Reg::Rdi, signum as u64);
            frame_mc.set_reg(codecage_core::Reg::Rsi, app_frame.siginfo_ptr);
            frame_mc.set_reg(codecage_core::Reg::Rdx, app_frame.ucontext_ptr);
            frame_mc.set_xsp(app_frame.entry_sp);
            frame_mc.set_pc(handler_pc);
            unsafe { mcontext_io::write_mcontext(raw_ucontext, &frame_mc) };

            state.handle_sigprocmask(MaskHow::Block, Some(plan.blocked_mask));
            if plan.clears_to_default {
                state.handle_sigaction(signum, Some(SigAction::default()), 0, 0);
            }
        }
    }
}

/// `handle_sigreturn` (spec §6 "Exposed", spec §4.4 "`sigreturn`
/// interception"): called from the host's intercepted `rt_sigreturn`
/// syscall path with the raw frame the app's `sigreturn` is unwinding, so
/// the mask it restores comes from the actual on-stack `uc_sigmask` rather
/// than replaying software bookkeeping the handler may have clobbered.
///
/// # Safety
/// `ucontext` must point to the frame the app's `sigreturn` is about to
/// restore from (the host's syscall gateway reads it off the app's stack
/// pointer before letting the syscall through).
pub unsafe fn handle_sigreturn(
    ctx: &ThreadContext,
    state: &mut ThreadSignalState,
    ucontext: *const libc::ucontext_t,
) {
    let sigmask_at_delivery = mcontext_io::sigset_to_mask(&(*ucontext).uc_sigmask);
    handler::handle_sigreturn(ctx.dispatcher, state, sigmask_at_delivery);
}

fn apply_default_action(signum: i32) {
    use crate::sigtable::DefaultAction;
    match handler::default_action(signum) {
        DefaultAction::Ignore | DefaultAction::Continue => {}
        DefaultAction::Stop => unsafe {
            libc::raise(libc::SIGSTOP);
        },
        DefaultAction::Terminate | DefaultAction::TerminateCore => unsafe {
            libc::signal(signum, libc::SIG_DFL);
            libc::raise(signum);
        },
    }
}

unsafe fn run_previous_or_default(signum: i32, siginfo: *mut libc::siginfo_t, ucontext: *mut libc::c_void) {
    let previous = previous_actions()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&signum)
        .copied();
    match previous {
        Some(prev) if prev.sa_sigaction != libc::SIG_DFL && prev.sa_sigaction != libc::SIG_IGN => {
            let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                std::mem::transmute(prev.sa_sigaction);
            f(signum, siginfo, ucontext);
        }
        _ => {
            libc::signal(signum, libc::SIG_DFL);
            libc::raise(signum);
        }
    }
}
