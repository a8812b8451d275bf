//! The application-visible signal action table (spec §3's `app_action`,
//! `shared_action`/`refcount`/`shared_lock`).

use crate::sigtable::SIG_MAX;
use std::sync::{Arc, Mutex};

bitflags::bitflags! {
    /// The subset of `sigaction` flags the application's view can carry.
    /// Mirrors the POSIX flags by name; values match `libc`'s so they can
    /// be passed straight through to the kernel-visible action we install.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SigActionFlags: i32 {
        const SIGINFO   = libc::SA_SIGINFO;
        const ONSTACK   = libc::SA_ONSTACK;
        const RESTART   = libc::SA_RESTART;
        const NODEFER   = libc::SA_NODEFER;
        const RESETHAND = libc::SA_RESETHAND;
        const RESTORER  = 0x0400_0000; // SA_RESTORER, not exposed by libc on all targets
    }
}

/// What the application believes is installed for a signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handler {
    Default,
    Ignore,
    Address(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigAction {
    pub handler: Handler,
    pub mask: u64,
    pub flags: SigActionFlags,
    pub restorer: u64,
}

impl Default for SigAction {
    fn default() -> Self {
        SigAction {
            handler: Handler::Default,
            mask: 0,
            flags: SigActionFlags::empty(),
            restorer: 0,
        }
    }
}

/// The shared backing table for threads created with
/// `CLONE_SIGHAND`-equivalent semantics (spec §3 `shared_action`). The
/// `Arc`'s strong count plays the role of the original's manual
/// `refcount`.
#[derive(Debug, Default)]
pub struct SharedActionTable {
    pub actions: [SigAction; SIG_MAX],
}

/// Owned or shared backing storage for a thread's action table (design
/// note: "model as `Arc<Mutex<ActionTable>>` when shared, or owned when
/// not, with a copy-on-clone decision at thread creation").
pub enum ActionTable {
    Owned(Box<[SigAction; SIG_MAX]>),
    Shared(Arc<Mutex<SharedActionTable>>),
}

impl ActionTable {
    pub fn owned() -> Self {
        ActionTable::Owned(Box::new([SigAction::default(); SIG_MAX]))
    }

    pub fn shared_new() -> Arc<Mutex<SharedActionTable>> {
        Arc::new(Mutex::new(SharedActionTable::default()))
    }

    pub fn shared(table: Arc<Mutex<SharedActionTable>>) -> Self {
        ActionTable::Shared(table)
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, ActionTable::Shared(_))
    }

    /// Number of threads still referring to this table, meaningful only
    /// when shared (spec §3 `refcount`): the table is freed when the last
    /// one drops.
    pub fn refcount(&self) -> usize {
        match self {
            ActionTable::Owned(_) => 1,
            ActionTable::Shared(arc) => Arc::strong_count(arc),
        }
    }

    pub fn get(&self, sig: usize) -> SigAction {
        match self {
            ActionTable::Owned(table) => table[sig],
            ActionTable::Shared(arc) => {
                arc.lock().unwrap_or_else(|e| e.into_inner()).actions[sig]
            }
        }
    }

    pub fn set_mut(&mut self, sig: usize, action: SigAction) {
        match self {
            ActionTable::Owned(table) => table[sig] = action,
            ActionTable::Shared(arc) => {
                arc.lock().unwrap_or_else(|e| e.into_inner()).actions[sig] = action;
            }
        }
    }

    /// A full snapshot, used to deep-copy into a non-shared clone child
    /// (spec §4.3 "Clone coordination": "the child gets a deep copy of
    /// the parent table").
    pub fn snapshot(&self) -> Box<[SigAction; SIG_MAX]> {
        match self {
            ActionTable::Owned(table) => table.clone(),
            ActionTable::Shared(arc) => {
                Box::new(arc.lock().unwrap_or_else(|e| e.into_inner()).actions)
            }
        }
    }
}
