//! External-collaborator traits (spec §6, "Consumed").
//!
//! Everything in this module is a seam: the decoder, the fragment/code
//! cache store, and the dispatcher are explicitly out of scope (spec §1)
//! and are modeled only through the narrow interfaces their real
//! implementations would satisfy.

use crate::mcontext::Reg;
use bitflags::bitflags;

/// A stable handle to one fragment in the code cache. Opaque to this crate;
/// the fragment store assigns and interprets these however it likes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FragmentId(pub u64);

bitflags! {
    /// Per-fragment flag bits (spec §6).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FragmentFlags: u32 {
        const IS_TRACE          = 1 << 0;
        const SELFMOD_SANDBOXED = 1 << 1;
        const WAS_DELETED       = 1 << 2;
        const HAS_SYSCALL       = 1 << 3;
        const SHARED            = 1 << 4;
        const COARSE_GRAIN      = 1 << 5;
    }
}

/// Where a translator-emitted spill for a register lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillSlot {
    /// Thread-local storage at the given byte offset (fastest: spec §4.1).
    Tls(u32),
    /// The saved mcontext, at the given byte offset.
    Mcontext(u32),
}

/// The tagged instruction kinds the tracker's state machine consumes
/// (design notes §9: "model as a visitor interface on the decoder
/// abstraction returning tagged instruction kinds").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstrKind {
    /// An application instruction, unmodified by mangling.
    AppInstr,
    /// A translator-emitted spill of `reg` to `slot`.
    Spill { reg: Reg, slot: SpillSlot },
    /// A translator-emitted restore of `reg` from `slot`.
    Restore { reg: Reg, slot: SpillSlot },
    /// A translator-emitted adjustment of the translated stack pointer by
    /// `delta` bytes (positive: grew; negative: shrank).
    StackAdjust { delta: i32 },
    /// A control transfer. `is_exit` distinguishes a fragment-exit CTI
    /// (spills survive) from an intra-fragment branch (spills reset).
    /// `target`, when known statically, is the cache PC branched to.
    Cti { is_exit: bool, target: Option<u64> },
    /// The label marking entry into a clean call's argument-marshalling
    /// region (spec §4.1's "known-safe instruction kinds" list, "clean-call
    /// arg label"), kept distinct from the other known-safe kinds because
    /// it is the only one that should flip the tracker's `in_clean_call`
    /// state — the fault translator's failure policy (spec
    /// §4.2) only attempts priv-mcontext recovery inside an actual clean
    /// call, not merely because some other recognized mangling was seen.
    CleanCallArg,
    /// Mangling not covered by the other variants. `recognized` is true
    /// for the other "known-safe" kinds spec §4.1 lists (inline-syscall
    /// jump, segment-base load, special lea, trace-compare, mcontext-base
    /// load, `rseq` preamble); false sets `unsupported_mangle` sticky.
    OurMangling { recognized: bool },
}

/// One decoded cache instruction plus the translator-attached metadata the
/// tracker and translator need: whether the decoder emitted it as part of
/// the translator's own mangling, and (if so/known) which application PC it
/// corresponds to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedInstr {
    pub kind: InstrKind,
    /// True if this instruction was emitted by the translator rather than
    /// copied from application code (spec §3's `OUR_MANGLING`).
    pub our_mangling: bool,
    /// The application PC this instruction's mangling region corresponds
    /// to, when attached (spec §3's `TranslationWalk::translation`).
    pub translation: Option<u64>,
    /// Encoded length in bytes.
    pub length: u32,
}

/// The decoder/encoder (spec §6, consumed opaquely).
pub trait Decoder {
    /// Decode the instruction at `pc`. `None` means the bytes at `pc`
    /// could not be decoded (e.g. `pc` is not actually an instruction
    /// boundary); callers treat this the same as a probe fault.
    fn decode(&self, pc: u64) -> Option<DecodedInstr>;

    /// The length, in bytes, of an already-decoded instruction.
    fn instr_length(&self, instr: &DecodedInstr) -> u32 {
        instr.length
    }

    /// `pc + instr_length(decode(pc))`, provided as a convenience since
    /// almost every caller wants it immediately after decoding.
    fn decode_next_pc(&self, pc: u64) -> Option<u64> {
        self.decode(pc).map(|i| pc + u64::from(i.length))
    }

    /// Decode the instruction at `pc` and evaluate its memory operand (if
    /// any) against `mcontext`, returning `(address, is_write)`. Used only
    /// by the master handler's self-modifying-code check (spec §4.4): "compute
    /// the memory target of the faulting instruction (decode it, evaluate
    /// its memory operands against the current context)". `None` means the
    /// instruction has no memory operand, or the decoder does not support
    /// this query.
    fn compute_memory_target(
        &self,
        _pc: u64,
        _mcontext: &crate::MachineContext,
    ) -> Option<(u64, bool)> {
        None
    }
}

/// One change-point entry in a fragment's [`TranslationInfo`] table (spec
/// §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TranslationInfoEntry {
    pub cache_offset: u32,
    pub app_pc: u64,
    pub flags: TranslationInfoFlags,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TranslationInfoFlags: u8 {
        /// Consecutive cache instructions all translate to the same app PC.
        const IDENTICAL    = 1 << 0;
        /// Cache stride equals app stride.
        const CONTIGUOUS   = 1 << 1;
        /// Emitted by the translator, not the app.
        const OUR_MANGLING = 1 << 2;
        /// Inside an argument-marshalling region for a clean call.
        const IN_CLEAN_CALL = 1 << 3;
    }
}

/// A compact, sorted-by-`cache_offset` table recording the translation at
/// each change point within a fragment (spec §3's `TranslationInfo`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TranslationInfo {
    pub entries: Vec<TranslationInfoEntry>,
}

impl TranslationInfo {
    /// The entry covering `cache_offset`, i.e. the last entry whose
    /// `cache_offset` is `<=` the target.
    pub fn entry_covering(&self, cache_offset: u32) -> Option<&TranslationInfoEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.cache_offset <= cache_offset)
    }
}

/// The code cache / fragment store (spec §6, consumed opaquely).
pub trait FragmentStore {
    fn fragment_pclookup(&self, pc: u64) -> Option<FragmentId>;
    fn fcache_entry_pc(&self, fragment: FragmentId) -> u64;
    fn in_fcache(&self, pc: u64) -> bool;
    /// Fragment boundaries `(cache_start, cache_end)`, used to distinguish
    /// exit jumps from intra-fragment jumps (spec §3).
    fn bounds(&self, fragment: FragmentId) -> (u64, u64);
    fn flags(&self, fragment: FragmentId) -> FragmentFlags;
    /// The optional precomputed translation table (spec §4.2: "if the
    /// fragment has a `TranslationInfo` table, iterate through it").
    fn translation_info(&self, fragment: FragmentId) -> Option<&TranslationInfo>;
    /// Rebuild the fragment's instruction list from the code cache (or,
    /// for a selfmod fragment, from the stored copy) when no
    /// `TranslationInfo` is available.
    fn recreate_fragment_ilist(&self, pc: u64) -> Option<Vec<DecodedInstr>>;
    /// For a selfmod-sandboxed fragment, the address of the translator's
    /// private copy of the original application bytes (spec §4.2).
    fn fragment_selfmod_copy_pc(&self, fragment: FragmentId) -> Option<u64>;
}

/// Memory queries the translator and master handler both need without
/// risking a fault of their own (spec §6).
pub trait MemoryQuery {
    /// Size and protection flags of the mapping containing `addr`, or
    /// `None` if unmapped.
    fn get_memory_info(&self, addr: u64) -> Option<MemoryInfo>;
    /// Read `dst.len()` bytes from `src` into `dst` without faulting the
    /// caller; returns `false` (spec §7 class 3) on failure.
    fn safe_read(&self, src: u64, dst: &mut [u8]) -> bool;
}

/// The translator's bookkeeping of which executable regions it marked
/// read-only, and the recovery path when one of them is written (spec
/// §4.4 "Self-modifying-code check"). Kept separate from [`FragmentStore`]
/// because the check runs before any fragment is looked up.
pub trait SelfModHandler {
    /// `addr` lies in a region the translator write-protected precisely
    /// because it is executable and was, in the application's view,
    /// writable.
    fn was_executable_area_writable(&self, addr: u64) -> bool;
    /// Flush and rebuild the fragments covering the page containing `addr`
    /// so that the now-modified bytes are re-translated. Returns `false`
    /// if the flush itself could not be completed (spec error class 1: the
    /// caller escalates to [`crate::fatal`]).
    fn handle_modified_code(&self, addr: u64) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryInfo {
    pub base: u64,
    pub size: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cache_offset: u32, app_pc: u64) -> TranslationInfoEntry {
        TranslationInfoEntry {
            cache_offset,
            app_pc,
            flags: TranslationInfoFlags::CONTIGUOUS,
        }
    }

    #[test]
    fn entry_covering_picks_last_entry_at_or_before_offset() {
        let table = TranslationInfo {
            entries: vec![entry(0, 0x1000), entry(8, 0x1005), entry(20, 0x1010)],
        };
        assert_eq!(table.entry_covering(0).unwrap().app_pc, 0x1000);
        assert_eq!(table.entry_covering(7).unwrap().app_pc, 0x1000);
        assert_eq!(table.entry_covering(8).unwrap().app_pc, 0x1005);
        assert_eq!(table.entry_covering(19).unwrap().app_pc, 0x1005);
        assert_eq!(table.entry_covering(20).unwrap().app_pc, 0x1010);
        assert_eq!(table.entry_covering(1000).unwrap().app_pc, 0x1010);
    }

    #[test]
    fn entry_covering_before_first_entry_is_none() {
        let table = TranslationInfo {
            entries: vec![entry(4, 0x2000)],
        };
        assert!(table.entry_covering(0).is_none());
    }
}

/// The dispatcher/interpreter (spec §6, consumed opaquely). The core only
/// specifies the handoff protocol, not how fragments actually run.
pub trait Dispatcher {
    /// Set the dispatcher's "next tag": the application (or translator
    /// entry-point) address it should transfer to on its next reentry.
    fn set_next_tag(&self, pc: u64);
    /// The cache PC of the routine a thread should land at to reenter the
    /// dispatcher's "fcache return" path (spec §4.4's delivery mechanism).
    fn fcache_return_routine(&self) -> u64;
    /// Called by the fault translator/master handler to synthesize a
    /// forged exception (spec §4.4's "Forging signals").
    fn forge_exception_entry(&self) -> u64;
    /// Unlink a fragment's outgoing edges to force a dispatcher return
    /// (spec §4.4's classification table, first row).
    fn unlink_fragment(&self, fragment: FragmentId);
    /// Relink a fragment previously unlinked by [`Dispatcher::unlink_fragment`].
    fn relink_fragment(&self, fragment: FragmentId);
    /// Patch an inlined syscall's post-syscall jump so the dispatcher
    /// regains control before the syscall executes, for a fragment that is
    /// both unlinked and marked [`FragmentFlags::HAS_SYSCALL`] (spec §4.4:
    /// "additionally patch its post-syscall jump").
    fn patch_post_syscall_jump(&self, fragment: FragmentId);
}

/// What a registered client hook decided for a signal event (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientHookAction {
    Deliver,
    Suppress,
    BypassToDefault,
    Redirect(u64),
}

/// An optional client callback invoked by the fault translator after
/// reconstruction, and by the master handler around delivery decisions
/// (spec §4.2 "Hook protocol", spec §6).
pub trait ClientHook {
    fn on_translated(&self, raw: &crate::MachineContext, cooked: &crate::MachineContext) -> bool;
    fn on_signal(&self, signum: i32, pc: u64) -> ClientHookAction;
}

/// The translator-owned regions outside the code cache that the fault
/// translator's special-case gates (spec §4.2) must recognize before
/// falling back to fragment-based reconstruction: the syscall gateway
/// page, translator-issued syscalls, the reset-exit stub, and generated
/// routines in general.
///
/// Kept separate from [`FragmentStore`] because none of these PCs are
/// inside the code cache; a host embedding this core answers them from
/// its own generated-code bookkeeping.
pub trait SpecialRegions {
    /// `pc` is inside a recognized syscall-gateway page (vsyscall/sysenter
    /// trampoline): no translation is needed.
    fn is_syscall_gateway(&self, pc: u64) -> bool;

    /// `pc` is immediately after a translator-issued syscall that
    /// returns; the app's post-syscall continuation PC is returned
    /// (spec §4.2 gate 2, "handling the case where the thread is
    /// suspended mid-kernel").
    fn post_syscall_continuation(&self, pc: u64) -> Option<u64>;

    /// `pc` is the translator's reset-exit stub; the next dispatched
    /// application tag is returned (spec §4.2 gate 3).
    fn reset_exit_next_tag(&self, pc: u64) -> Option<u64>;

    /// `pc` is inside a generated-routine region not covered by any of
    /// the other gates (spec §4.2 gate 4: "thread not relocatable").
    fn in_generated_routine(&self, pc: u64) -> bool;

    /// `pc` is inside the translator's own code (not a generated routine,
    /// not the cache): library text, the translator's clean-call targets,
    /// etc. Used only by the master handler's classification table (spec
    /// §4.4) to tell a genuinely external PC apart from one a registered
    /// try/except recovery frame might cover. Defaults to `false`, which
    /// folds this case into "outside everything we recognize".
    fn in_translator_proper(&self, _pc: u64) -> bool {
        false
    }
}
