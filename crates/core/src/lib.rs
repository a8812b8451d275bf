//! Shared types and external-collaborator traits for the codecage core.
//!
//! This crate owns nothing that actually runs translated code, decodes an
//! instruction, or stores a fragment: those are external collaborators
//! (spec: decoder, fragment store, dispatcher) consumed only through the
//! traits defined here. [`codecage-xlate`](https://docs.rs/codecage-xlate)
//! and [`codecage-signal`](https://docs.rs/codecage-signal) build the actual
//! subsystems on top of these seams.

mod config;
mod error;
mod mcontext;
mod traits;

pub use config::Config;
pub use error::{Error, Result};
pub use mcontext::{MachineContext, Reg, REG_COUNT};
pub use traits::{
    ClientHook, ClientHookAction, DecodedInstr, Decoder, Dispatcher, FragmentFlags, FragmentId,
    FragmentStore, InstrKind, MemoryInfo, MemoryQuery, SelfModHandler, SpecialRegions, SpillSlot,
    TranslationInfo, TranslationInfoEntry, TranslationInfoFlags,
};

/// Calls [`log::error!`] with `msg` and then aborts the process.
///
/// This is the only response to spec error class 1 ("Translator bug
/// (invariant violation)"): there is no recovery path, and returning the
/// error to a caller that might paper over it would violate the invariant
/// it protects. Unlike the other three classes, a bug never flows through
/// [`Error`] — there is no `Result` to return once the invariant it
/// protects is already broken.
#[cold]
pub fn fatal(msg: &str) -> ! {
    log::error!("codecage: fatal invariant violation: {msg}");
    std::process::abort()
}
