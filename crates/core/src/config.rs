/// Tunables for the signal and fault-translation subsystems.
///
/// Defaults mirror the hard-coded constants the source this core is
/// modeled on uses; they are exposed here rather than hard-coded so a host
/// embedding this core can size the alternate stack to its own translated
/// code's worst-case stack usage.
#[derive(Clone, Debug)]
pub struct Config {
    /// Size in bytes of the alternate signal stack the translator installs
    /// per thread (spec §4.3: "size >= the translator's own stack size, not
    /// the libc minimum").
    pub altstack_size: usize,

    /// Whether to attempt interception of real-time signals beyond the
    /// POSIX-required minimum at all. This only gates *whether* we try;
    /// spec §1's non-goals exclude replicating the host kernel's RT
    /// ordering guarantees regardless of this flag.
    pub intercept_realtime_signals: bool,

    /// Page-commit unit size for the pending-frame slab (spec §3:
    /// `pending_pool`). The slab never takes a lock below this threshold;
    /// crossing it is the "unrealistic pending-signal pressure" spec §5
    /// describes.
    pub pending_pool_unit_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            // 256 KiB: comfortably larger than SIGSTKSZ and enough for the
            // master handler's own frame plus one nested clean-call.
            altstack_size: 256 * 1024,
            intercept_realtime_signals: true,
            pending_pool_unit_bytes: 24 * 1024,
        }
    }
}
