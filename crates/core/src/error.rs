use thiserror::Error;

/// The four error classes from spec §7.
///
/// Only the classes that a caller can meaningfully receive and act on are
/// represented here. Class 1 (translator bug) never flows through a
/// `Result`: it goes straight to [`crate::fatal`].
#[derive(Debug, Error)]
pub enum Error {
    /// Spec §7 class 2: an unsupported mangled sequence was encountered
    /// while reconstructing application state. Only ever returned for
    /// asynchronous (relocation) translation; a synchronous fault hitting
    /// this path is a bug, not this variant.
    #[error("unsupported mangled sequence at cache offset {cache_offset:#x}")]
    UnsupportedMangle { cache_offset: u64 },

    /// Spec §7 class 3: a `safe_read` probe could not read the requested
    /// address. Callers are expected to fall back to a conservative
    /// assumption (e.g. treat a restorer-pattern cache as invalid) rather
    /// than propagate this further.
    #[error("probe of address {addr:#x} ({len} bytes) faulted")]
    UnsafeProbe { addr: u64, len: usize },

    /// Spec §7 class 4: a signal could not be delivered safely (the app
    /// stack/altstack was unreadable, or a fault loop would otherwise
    /// result). The only valid response is process termination, except for
    /// the narrow always-delayable/no-managed-thread exception spec §7
    /// calls out.
    #[error("signal {signum} undeliverable: {reason}")]
    UndeliverableFault { signum: i32, reason: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
