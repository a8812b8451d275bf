//! `restorer_cache[SIG_MAX]`: a tri-state cache of whether the app's
//! restorer pointer matches the libc restorer byte pattern (spec §3, spec
//! §6's `is_signal_restorer_code`).
//!
//! Checking a restorer pointer means probing application memory, which can
//! fault; spec §7 class 3 says the caller "continues conservatively (e.g.,
//! treats the restorer cache as invalid)" whenever that probe fails, so the
//! cache's `Unknown` state always resolves to `Invalid` rather than
//! retrying the probe on every fault.

use codecage_core::MemoryQuery;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RestorerCache {
    #[default]
    Unknown,
    Valid,
    Invalid,
}

/// glibc's `__restore_rt` trampoline on x86-64: `mov $__NR_rt_sigreturn,
/// %eax; syscall`. The handful of bytes every libc build emits for the
/// `SA_RESTORER` thunk, used only to decide whether the app-supplied
/// restorer is this well-known one (spec §4.4 "Frame construction").
const RESTORE_RT_PATTERN: [u8; 7] = [0xb8, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05];

/// `is_signal_restorer_code(pc) -> bool` (spec §6) backed by the cache: a
/// cache hit never re-probes; a miss probes via [`MemoryQuery::safe_read`]
/// and remembers the result.
pub fn is_signal_restorer_code(
    cache: &mut [RestorerCache],
    sig: usize,
    memory: &dyn MemoryQuery,
    pc: u64,
) -> bool {
    match cache.get(sig).copied().unwrap_or_default() {
        RestorerCache::Valid => return true,
        RestorerCache::Invalid => return false,
        RestorerCache::Unknown => {}
    }

    let mut buf = [0u8; RESTORE_RT_PATTERN.len()];
    let matches = memory.safe_read(pc, &mut buf) && buf == RESTORE_RT_PATTERN;
    if let Some(slot) = cache.get_mut(sig) {
        *slot = if matches {
            RestorerCache::Valid
        } else {
            RestorerCache::Invalid
        };
    }
    matches
}
