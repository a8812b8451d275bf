//! The two signal-number-indexed tables SPEC_FULL.md §11 says the
//! distillation dropped but component D's classification step still needs:
//! each signal's default action, and whether it can always be delayed.
//!
//! Reproduced faithfully by signal number from
//! `original_source/core/linux/signal.c`'s `default_action`/
//! `can_always_delay` arrays, as `const` tables rather than the original's
//! parallel C arrays.

/// The upper bound (exclusive) on signal numbers this table covers: Linux's
/// real-time range tops out at `SIGRTMAX` (typically 64).
pub const SIG_MAX: usize = 65;

/// What the kernel does with a signal when no handler is installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    TerminateCore,
    Ignore,
    Stop,
    Continue,
}

/// `default_action[sig]` (spec §11). Index 0 is unused (there is no signal
/// 0); its entry is never consulted.
pub const DEFAULT_ACTION: [DefaultAction; SIG_MAX] = {
    use DefaultAction::*;
    let mut table = [Terminate; SIG_MAX];
    table[0] = Ignore;
    table[libc::SIGHUP as usize] = Terminate;
    table[libc::SIGINT as usize] = Terminate;
    table[libc::SIGQUIT as usize] = TerminateCore;
    table[libc::SIGILL as usize] = TerminateCore;
    table[libc::SIGTRAP as usize] = TerminateCore;
    table[libc::SIGABRT as usize] = TerminateCore;
    table[libc::SIGBUS as usize] = Terminate;
    table[libc::SIGFPE as usize] = TerminateCore;
    table[libc::SIGKILL as usize] = Terminate;
    table[libc::SIGUSR1 as usize] = Terminate;
    table[libc::SIGSEGV as usize] = TerminateCore;
    table[libc::SIGUSR2 as usize] = Terminate;
    table[libc::SIGPIPE as usize] = Terminate;
    table[libc::SIGALRM as usize] = Terminate;
    table[libc::SIGTERM as usize] = Terminate;
    table[libc::SIGSTKFLT as usize] = Terminate;
    table[libc::SIGCHLD as usize] = Ignore;
    table[libc::SIGCONT as usize] = Continue;
    table[libc::SIGSTOP as usize] = Stop;
    table[libc::SIGTSTP as usize] = Stop;
    table[libc::SIGTTIN as usize] = Stop;
    table[libc::SIGTTOU as usize] = Stop;
    table[libc::SIGURG as usize] = Ignore;
    table[libc::SIGXCPU as usize] = Terminate;
    table[libc::SIGXFSZ as usize] = Terminate;
    table[libc::SIGVTALRM as usize] = Terminate;
    table[libc::SIGPROF as usize] = Terminate;
    table[libc::SIGWINCH as usize] = Ignore;
    table[libc::SIGIO as usize] = Terminate;
    table[libc::SIGPWR as usize] = Terminate;
    table[libc::SIGSYS as usize] = Terminate;
    // Real-time signals (32..=64): assumed default of terminate, matching
    // the original's ASSUMPTION comment.
    table
};

/// "We know that many signals are always asynchronous. Others, however,
/// may be synchronous or may not... thus we have to assume that we must
/// not delay any SIGSEGV deliveries" (spec §11, `can_always_delay`).
pub const CAN_ALWAYS_DELAY: [bool; SIG_MAX] = {
    let mut table = [true; SIG_MAX];
    table[libc::SIGILL as usize] = false;
    table[libc::SIGTRAP as usize] = false;
    table[libc::SIGABRT as usize] = false;
    table[libc::SIGBUS as usize] = false;
    table[libc::SIGFPE as usize] = false;
    table[libc::SIGSEGV as usize] = false;
    table[libc::SIGPIPE as usize] = false;
    table[libc::SIGXCPU as usize] = false;
    table[libc::SIGSYS as usize] = false;
    // Real-time signals (32..=64): assumed always delayable.
    table
};

/// Signals whose default action is *not* stop/continue, the set spec §4.3
/// says the translator must intercept at thread init even if the app
/// never installs a handler for them ("every signal whose default action
/// is not 'stop'/'continue' (those are unsupported)").
///
/// `SIGKILL` and `SIGSTOP` are excluded outright even though their default
/// action is `Terminate`/`Stop`: the kernel rejects any `sigaction` call
/// for either one with `EINVAL`, so nothing may ever try to install a
/// handler for them regardless of what `DEFAULT_ACTION` says (matching
/// `original_source/core/linux/signal.c`'s own `i != SIGKILL && i !=
/// SIGSTOP` guard).
pub fn default_needs_interception(sig: i32) -> bool {
    if sig == libc::SIGKILL || sig == libc::SIGSTOP {
        return false;
    }
    let sig = sig as usize;
    sig < SIG_MAX
        && !matches!(
            DEFAULT_ACTION[sig],
            DefaultAction::Stop | DefaultAction::Continue
        )
}

pub fn can_always_delay(sig: i32) -> bool {
    let sig = sig as usize;
    sig < SIG_MAX && CAN_ALWAYS_DELAY[sig]
}

pub fn default_action(sig: i32) -> DefaultAction {
    let sig = sig as usize;
    if sig < SIG_MAX {
        DEFAULT_ACTION[sig]
    } else {
        DefaultAction::Terminate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigsegv_is_never_delayable() {
        assert!(!can_always_delay(libc::SIGSEGV));
    }

    #[test]
    fn sigusr1_is_always_delayable() {
        assert!(can_always_delay(libc::SIGUSR1));
    }

    #[test]
    fn sigstop_and_sigcont_are_excluded_from_interception() {
        assert!(!default_needs_interception(libc::SIGSTOP));
        assert!(!default_needs_interception(libc::SIGCONT));
        assert!(!default_needs_interception(libc::SIGTSTP));
    }

    #[test]
    fn sigsegv_default_action_needs_interception() {
        assert_eq!(default_action(libc::SIGSEGV), DefaultAction::TerminateCore);
        assert!(default_needs_interception(libc::SIGSEGV));
    }

    #[test]
    fn realtime_signal_defaults_to_terminate_and_delayable() {
        let rt = libc::SIGRTMIN();
        assert_eq!(default_action(rt), DefaultAction::Terminate);
        assert!(can_always_delay(rt));
    }

    #[test]
    fn out_of_range_signal_number_is_safe() {
        assert_eq!(default_action(200), DefaultAction::Terminate);
        assert!(!can_always_delay(200));
    }
}
