//! Fault-context translation for the codecage DBT core.
//!
//! This crate implements components A and B from the core design: the
//! spill/mangling tracker ([`tracker`]) that walks a fragment's
//! instructions symbolically, and the fault translator ([`translator`])
//! that uses it to reconstruct application state from a code-cache PC.
//! Neither component touches signals directly; `codecage-signal` is the
//! only consumer.

pub mod tracker;
pub mod translator;

pub use tracker::Walk;
pub use translator::{SpillSource, TranslateOutcome, Translator};
