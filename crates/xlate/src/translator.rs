//! Component B: the Fault Translator (spec §4.2).
//!
//! Given a cache PC and a machine context captured there, reconstructs the
//! equivalent application PC and (optionally) register values, driving the
//! spill/mangling tracker (component A, [`crate::tracker`]) across the
//! fragment's instructions.

use crate::tracker::Walk;
use codecage_core::{
    ClientHook, DecodedInstr, Decoder, FragmentFlags, FragmentStore, MachineContext,
    SpecialRegions, TranslationInfoFlags,
};

/// The result of [`Translator::translate`] (spec §4.2's tri-state
/// contract).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslateOutcome {
    /// Both PC and all registers reconstructed faithfully.
    StateOk,
    /// PC reconstructed but some register state is unrecoverable.
    PcOk,
    /// The context cannot be used; the thread is not in a relocatable
    /// state.
    Fail,
}

/// Bundles the external collaborators the fault translator needs (spec §6
/// "Consumed"): a decoder, the fragment store, the translator's special
/// regions outside the cache, a memory-probe surface for reading TLS/saved
/// mcontext spill slots, and an optional client hook.
pub struct Translator<'a> {
    pub decoder: &'a dyn Decoder,
    pub fragments: &'a dyn FragmentStore,
    pub regions: &'a dyn SpecialRegions,
    pub hook: Option<&'a dyn ClientHook>,
}

/// Accessors for the two places a spill slot's value may actually live,
/// supplied by the caller (signal crate) since only it knows where a
/// thread's TLS block and saved-mcontext-on-dstack structure are.
pub trait SpillSource {
    fn tls(&self, offset: u32) -> u64;
    fn saved_mcontext(&self, offset: u32) -> u64;
    /// Whether a priv-mcontext saved on the dstack is present right now
    /// (spec §4.2 failure policy: "restore the full mcontext from the
    /// priv-mcontext saved on the dstack... documented caveat that
    /// asynchronous translation may observe a half-built dstack").
    fn priv_mcontext_available(&self) -> bool;
}

impl<'a> Translator<'a> {
    pub fn new(
        decoder: &'a dyn Decoder,
        fragments: &'a dyn FragmentStore,
        regions: &'a dyn SpecialRegions,
        hook: Option<&'a dyn ClientHook>,
    ) -> Self {
        Translator {
            decoder,
            fragments,
            regions,
            hook,
        }
    }

    /// `translate(thread, mcontext, just_pc, restore_memory)` from spec
    /// §4.2. Returns the reconstructed context in place (via the returned
    /// [`MachineContext`] when not `Fail`) alongside the outcome.
    pub fn translate(
        &self,
        mcontext: &MachineContext,
        just_pc: bool,
        spill_source: &dyn SpillSource,
    ) -> (TranslateOutcome, MachineContext) {
        let pc = mcontext.pc();

        // Gate 1: syscall-gateway page.
        if self.regions.is_syscall_gateway(pc) {
            log::trace!("translate: pc {pc:#x} is a syscall gateway, no translation needed");
            return (TranslateOutcome::StateOk, mcontext.clone());
        }

        // Gate 2: immediately after a translator-issued syscall.
        if let Some(app_pc) = self.regions.post_syscall_continuation(pc) {
            let mut out = mcontext.clone();
            out.set_pc(app_pc);
            log::trace!("translate: post-syscall continuation {pc:#x} -> {app_pc:#x}");
            return (TranslateOutcome::PcOk, out);
        }

        // Gate 3: the reset-exit stub.
        if let Some(next_tag) = self.regions.reset_exit_next_tag(pc) {
            let mut out = mcontext.clone();
            out.set_pc(next_tag);
            log::trace!("translate: reset-exit stub {pc:#x} -> next tag {next_tag:#x}");
            return (TranslateOutcome::PcOk, out);
        }

        // Gate 4: any other generated-routine region.
        if self.regions.in_generated_routine(pc) {
            log::warn!("translate: pc {pc:#x} is in a generated routine, not relocatable");
            return (TranslateOutcome::Fail, mcontext.clone());
        }

        // Gate 5: inside the code cache.
        if self.fragments.in_fcache(pc) {
            return self.translate_in_fragment(mcontext, just_pc, spill_source);
        }

        // Gate 6: inside translator DLL/libc/etc.
        log::warn!("translate: pc {pc:#x} outside all recognized regions");
        (TranslateOutcome::Fail, mcontext.clone())
    }

    fn translate_in_fragment(
        &self,
        mcontext: &MachineContext,
        just_pc: bool,
        spill_source: &dyn SpillSource,
    ) -> (TranslateOutcome, MachineContext) {
        let pc = mcontext.pc();
        let Some(fragment) = self.fragments.fragment_pclookup(pc) else {
            log::warn!("translate: {pc:#x} in fcache range but no fragment found");
            return (TranslateOutcome::Fail, mcontext.clone());
        };
        let (cache_start, cache_end) = self.fragments.bounds(fragment);
        let flags = self.fragments.flags(fragment);
        let target_offset = (pc - cache_start) as u32;

        let mut walk = Walk::init(cache_start, cache_end, mcontext.clone());

        let reached = if let Some(table) = self.fragments.translation_info(fragment) {
            self.walk_via_translation_info(&mut walk, table, cache_start, target_offset)
        } else {
            self.walk_via_recreated_ilist(&mut walk, fragment, flags, cache_start, target_offset)
        };

        let Some(app_pc) = reached else {
            log::warn!(
                "translate: fragment {fragment:?} walk never reached offset {target_offset:#x}"
            );
            return (TranslateOutcome::Fail, mcontext.clone());
        };

        let mut out = mcontext.clone();
        out.set_pc(app_pc);

        if just_pc {
            return (TranslateOutcome::PcOk, out);
        }

        let at_post_region = walk.translation() != Some(app_pc);
        let good_state = walk.good_state(at_post_region);

        if good_state {
            walk.restore(
                &|off| spill_source.tls(off),
                &|off| spill_source.saved_mcontext(off),
                at_post_region,
            );
            let outcome = self.run_hook(mcontext, &walk.mcontext);
            return (outcome, walk.mcontext);
        }

        // Failure policy: not in a good state for full translation.
        if walk.in_clean_call() && spill_source.priv_mcontext_available() {
            // Restore the full mcontext from the priv-mcontext saved on
            // the dstack rather than from tracked spills; we trust the
            // caller's `SpillSource` to source that structure's fields
            // through the same `saved_mcontext` accessor.
            walk.restore(
                &|off| spill_source.tls(off),
                &|off| spill_source.saved_mcontext(off),
                at_post_region,
            );
            let outcome = self.run_hook(mcontext, &walk.mcontext);
            return (outcome, walk.mcontext);
        }

        // We know the PC even though full-state translation is unsafe:
        // downgrade rather than fail outright.
        log::warn!(
            "translate: downgrading to PC_OK for fragment {fragment:?} (unsupported mangle mid-region)"
        );
        let outcome = self.run_hook(mcontext, &out);
        let outcome = match outcome {
            TranslateOutcome::Fail => TranslateOutcome::Fail,
            _ => TranslateOutcome::PcOk,
        };
        (outcome, out)
    }

    /// Walks a fragment using its precomputed [`TranslationInfo`] table
    /// (spec §4.2: "iterate through the table, advancing an 'answer' app
    /// PC between change points by 0 (identical) or by decoded
    /// cache-instruction length (contiguous)").
    fn walk_via_translation_info(
        &self,
        walk: &mut Walk,
        table: &codecage_core::TranslationInfo,
        cache_start: u64,
        target_offset: u32,
    ) -> Option<u64> {
        let mut answer = table.entries.first()?.app_pc;
        let mut offset = table.entries.first()?.cache_offset;

        loop {
            let entry = table.entry_covering(offset)?;
            answer = if entry.flags.contains(TranslationInfoFlags::IDENTICAL) {
                entry.app_pc
            } else {
                answer
            };

            let instr = self.decoder.decode(cache_start + u64::from(offset))?;
            walk.pre(&instr);
            walk.post(&instr);

            if entry.flags.contains(TranslationInfoFlags::CONTIGUOUS) {
                answer = entry.app_pc + u64::from(offset - entry.cache_offset);
            }

            if offset >= target_offset {
                return Some(answer);
            }
            offset += instr.length;
        }
    }

    /// Walks a fragment whose `TranslationInfo` is absent, recovering the
    /// instruction list via [`FragmentStore::recreate_fragment_ilist`]
    /// (spec §4.2).
    fn walk_via_recreated_ilist(
        &self,
        walk: &mut Walk,
        fragment: codecage_core::FragmentId,
        flags: FragmentFlags,
        cache_start: u64,
        target_offset: u32,
    ) -> Option<u64> {
        let base_pc = if flags.contains(FragmentFlags::SELFMOD_SANDBOXED) {
            // Instruction list is rebuilt from the translator's private
            // copy of the original app code, then rebased onto the
            // fragment's tag.
            self.fragments.fragment_selfmod_copy_pc(fragment)?
        } else {
            cache_start
        };

        let ilist = self
            .fragments
            .recreate_fragment_ilist(cache_start)
            .or_else(|| self.fragments.recreate_fragment_ilist(base_pc))?;

        let mut offset = 0u32;
        let mut answer = None;
        for instr in &ilist {
            walk.pre(instr);
            walk.post(instr);
            if let Some(t) = instr.translation {
                answer = Some(t);
            }
            if offset >= target_offset {
                break;
            }
            offset += instr.length;
        }
        answer
    }

    fn run_hook(&self, raw: &MachineContext, cooked: &MachineContext) -> TranslateOutcome {
        match self.hook {
            Some(hook) if !hook.on_translated(raw, cooked) => TranslateOutcome::Fail,
            _ => TranslateOutcome::StateOk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codecage_core::{
        DecodedInstr, FragmentId, InstrKind, TranslationInfo, TranslationInfoEntry,
    };
    use std::collections::HashMap;

    struct FakeDecoder {
        instrs: HashMap<u64, DecodedInstr>,
    }
    impl Decoder for FakeDecoder {
        fn decode(&self, pc: u64) -> Option<DecodedInstr> {
            self.instrs.get(&pc).cloned()
        }
    }

    struct FakeStore {
        fragment: FragmentId,
        start: u64,
        end: u64,
        flags: FragmentFlags,
        info: Option<TranslationInfo>,
        ilist: Option<Vec<DecodedInstr>>,
    }
    impl FragmentStore for FakeStore {
        fn fragment_pclookup(&self, pc: u64) -> Option<FragmentId> {
            (pc >= self.start && pc < self.end).then_some(self.fragment)
        }
        fn fcache_entry_pc(&self, _f: FragmentId) -> u64 {
            self.start
        }
        fn in_fcache(&self, pc: u64) -> bool {
            pc >= self.start && pc < self.end
        }
        fn bounds(&self, _f: FragmentId) -> (u64, u64) {
            (self.start, self.end)
        }
        fn flags(&self, _f: FragmentId) -> FragmentFlags {
            self.flags
        }
        fn translation_info(&self, _f: FragmentId) -> Option<&TranslationInfo> {
            self.info.as_ref()
        }
        fn recreate_fragment_ilist(&self, _pc: u64) -> Option<Vec<DecodedInstr>> {
            self.ilist.clone()
        }
        fn fragment_selfmod_copy_pc(&self, _f: FragmentId) -> Option<u64> {
            None
        }
    }

    struct NoSpecialRegions;
    impl SpecialRegions for NoSpecialRegions {
        fn is_syscall_gateway(&self, _pc: u64) -> bool {
            false
        }
        fn post_syscall_continuation(&self, _pc: u64) -> Option<u64> {
            None
        }
        fn reset_exit_next_tag(&self, _pc: u64) -> Option<u64> {
            None
        }
        fn in_generated_routine(&self, _pc: u64) -> bool {
            false
        }
    }

    struct FakeSpillSource {
        tls: HashMap<u32, u64>,
    }
    impl SpillSource for FakeSpillSource {
        fn tls(&self, offset: u32) -> u64 {
            *self.tls.get(&offset).unwrap_or(&0)
        }
        fn saved_mcontext(&self, _offset: u32) -> u64 {
            0
        }
        fn priv_mcontext_available(&self) -> bool {
            false
        }
    }

    #[test]
    fn syscall_gateway_needs_no_translation() {
        let decoder = FakeDecoder { instrs: HashMap::new() };
        let store = FakeStore {
            fragment: FragmentId(1),
            start: 0,
            end: 0,
            flags: FragmentFlags::empty(),
            info: None,
            ilist: None,
        };
        struct Gateway;
        impl SpecialRegions for Gateway {
            fn is_syscall_gateway(&self, pc: u64) -> bool {
                pc == 0xffff_0000
            }
            fn post_syscall_continuation(&self, _pc: u64) -> Option<u64> {
                None
            }
            fn reset_exit_next_tag(&self, _pc: u64) -> Option<u64> {
                None
            }
            fn in_generated_routine(&self, _pc: u64) -> bool {
                false
            }
        }
        let regions = Gateway;
        let t = Translator::new(&decoder, &store, &regions, None);
        let mc = MachineContext::new(0xffff_0000);
        let spill = FakeSpillSource { tls: HashMap::new() };
        let (outcome, out) = t.translate(&mc, false, &spill);
        assert_eq!(outcome, TranslateOutcome::StateOk);
        assert_eq!(out.pc(), 0xffff_0000);
    }

    #[test]
    fn translation_info_reconstructs_identical_region_pc() {
        let mut instrs = HashMap::new();
        instrs.insert(
            0xc000_0000,
            DecodedInstr {
                kind: InstrKind::AppInstr,
                our_mangling: false,
                translation: Some(0x4000),
                length: 4,
            },
        );
        instrs.insert(
            0xc000_0004,
            DecodedInstr {
                kind: InstrKind::AppInstr,
                our_mangling: false,
                translation: Some(0x4000),
                length: 4,
            },
        );
        let decoder = FakeDecoder { instrs };
        let info = TranslationInfo {
            entries: vec![TranslationInfoEntry {
                cache_offset: 0,
                app_pc: 0x4000,
                flags: TranslationInfoFlags::IDENTICAL,
            }],
        };
        let store = FakeStore {
            fragment: FragmentId(1),
            start: 0xc000_0000,
            end: 0xc000_0010,
            flags: FragmentFlags::empty(),
            info: Some(info),
            ilist: None,
        };
        let regions = NoSpecialRegions;
        let t = Translator::new(&decoder, &store, &regions, None);
        let mc = MachineContext::new(0xc000_0004);
        let spill = FakeSpillSource { tls: HashMap::new() };
        let (outcome, out) = t.translate(&mc, false, &spill);
        assert_eq!(outcome, TranslateOutcome::StateOk);
        assert_eq!(out.pc(), 0x4000);
    }

    #[test]
    fn unmapped_target_pc_outside_all_regions_fails() {
        let decoder = FakeDecoder { instrs: HashMap::new() };
        let store = FakeStore {
            fragment: FragmentId(1),
            start: 0,
            end: 0,
            flags: FragmentFlags::empty(),
            info: None,
            ilist: None,
        };
        let regions = NoSpecialRegions;
        let t = Translator::new(&decoder, &store, &regions, None);
        let mc = MachineContext::new(0x1234);
        let spill = FakeSpillSource { tls: HashMap::new() };
        let (outcome, _) = t.translate(&mc, true, &spill);
        assert_eq!(outcome, TranslateOutcome::Fail);
    }

    #[test]
    fn client_hook_can_fail_a_translation() {
        let mut instrs = HashMap::new();
        instrs.insert(
            0xc000_0000,
            DecodedInstr {
                kind: InstrKind::AppInstr,
                our_mangling: false,
                translation: Some(0x4000),
                length: 4,
            },
        );
        let decoder = FakeDecoder { instrs };
        let info = TranslationInfo {
            entries: vec![TranslationInfoEntry {
                cache_offset: 0,
                app_pc: 0x4000,
                flags: TranslationInfoFlags::IDENTICAL,
            }],
        };
        let store = FakeStore {
            fragment: FragmentId(1),
            start: 0xc000_0000,
            end: 0xc000_0010,
            flags: FragmentFlags::empty(),
            info: Some(info),
            ilist: None,
        };
        let regions = NoSpecialRegions;
        struct RejectHook;
        impl ClientHook for RejectHook {
            fn on_translated(&self, _raw: &MachineContext, _cooked: &MachineContext) -> bool {
                false
            }
            fn on_signal(&self, _signum: i32, _pc: u64) -> codecage_core::ClientHookAction {
                codecage_core::ClientHookAction::Deliver
            }
        }
        let hook = RejectHook;
        let t = Translator::new(&decoder, &store, &regions, Some(&hook));
        let mc = MachineContext::new(0xc000_0000);
        let spill = FakeSpillSource { tls: HashMap::new() };
        let (outcome, _) = t.translate(&mc, false, &spill);
        assert_eq!(outcome, TranslateOutcome::Fail);
    }
}
