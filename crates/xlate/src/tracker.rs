//! Component A: the Spill / Mangling Tracker (spec §4.1).
//!
//! Walks a fragment's instructions symbolically, tracking which
//! application registers are currently displaced into translator spill
//! slots and how far the translated stack pointer has drifted from the
//! application's. The fault translator (component B, [`crate::translator`])
//! drives this walk instruction-by-instruction while reconstructing
//! application state from a cache PC.

use codecage_core::{DecodedInstr, InstrKind, MachineContext, Reg, SpillSlot, REG_COUNT};

/// Where, if anywhere, a register's value currently lives in a spill slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    None,
    Spilled(SpillSlot),
}

/// Transient, stack-allocated state for one fault-translation walk (spec
/// §3's `TranslationWalk`).
///
/// Constructed fresh for each translation attempt via [`Walk::init`]; the
/// fault translator feeds it every cache instruction between the
/// fragment's start and the target PC via [`Walk::pre`]/[`Walk::post`],
/// then calls [`Walk::restore`] to reconstruct the application-visible
/// register file.
#[derive(Debug)]
pub struct Walk {
    pub mcontext: MachineContext,
    cache_start: u64,
    cache_end: u64,
    reg_slot: [Slot; REG_COUNT],
    /// Cumulative translated-stack-pointer delta from the application
    /// value (spec §3's `xsp_adjust`).
    pub xsp_adjust: i64,
    /// The mangling-region boundary state machine (spec §4.1 `walk_pre`).
    in_mangle_region: bool,
    in_mangle_epilogue: bool,
    in_clean_call: bool,
    /// Sticky: once set, full-state translation must fail (spec §4.1).
    unsupported_mangle: bool,
    /// The application PC the current mangling region corresponds to.
    translation: Option<u64>,
    /// Set by [`Walk::pre`] when the just-reset spill state was reset
    /// because we crossed a region boundary while a dedicated stolen
    /// register's spill was outstanding; the very next instruction is
    /// asserted to be the matching TLS restore (spec §4.1).
    expect_stolen_restore: Option<Reg>,
}

impl Walk {
    /// Reset all spill slots to [`Slot::None`] and `xsp_adjust` to 0 (spec
    /// §4.1 `walk_init`).
    pub fn init(cache_start: u64, cache_end: u64, mcontext: MachineContext) -> Self {
        Walk {
            mcontext,
            cache_start,
            cache_end,
            reg_slot: [Slot::None; REG_COUNT],
            xsp_adjust: 0,
            in_mangle_region: false,
            in_mangle_epilogue: false,
            in_clean_call: false,
            unsupported_mangle: false,
            translation: None,
            expect_stolen_restore: None,
        }
    }

    pub fn cache_bounds(&self) -> (u64, u64) {
        (self.cache_start, self.cache_end)
    }

    /// Called before each cache instruction is classified: detects a
    /// mangling-region boundary crossing and, if one is crossed, resets
    /// all spill tracking (spec §4.1 `walk_pre`).
    ///
    /// A boundary is crossed when the instruction belongs to a new
    /// mangling region, or its attached translation PC differs from the
    /// region we were in, or the mangling epilogue was just exited.
    pub fn pre(&mut self, instr: &DecodedInstr) {
        let entering_new_region = !instr.our_mangling
            || instr.translation != self.translation
            || (self.in_mangle_epilogue && !Self::is_epilogue_kind(&instr.kind));

        if entering_new_region {
            if let Some(stolen) = self.expect_stolen_restore.take() {
                debug_assert!(
                    matches!(instr.kind, InstrKind::Restore { reg, .. } if reg == stolen),
                    "stolen-register restore must immediately follow a region reset that left it spilled",
                );
            }
            let stolen_outstanding = self.stolen_reg_outstanding();
            self.reg_slot = [Slot::None; REG_COUNT];
            self.xsp_adjust = 0;
            self.unsupported_mangle = false;
            self.in_mangle_region = instr.our_mangling;
            self.in_mangle_epilogue = false;
            self.in_clean_call = false;
            self.translation = instr.translation;
            self.expect_stolen_restore = stolen_outstanding;
        }
        log::trace!(
            "tracker: pre pc_region={:?} our_mangling={} translation={:?}",
            self.in_mangle_region,
            instr.our_mangling,
            instr.translation
        );
    }

    /// `true` on architectures/ABIs where a dedicated stolen register is
    /// spilled across application instructions and is still outstanding.
    /// The reference implementation only ever tracks `Reg::R10` this way;
    /// kept general so other archs' stolen-register choice works too.
    fn stolen_reg_outstanding(&self) -> Option<Reg> {
        const STOLEN: Reg = Reg::R10;
        match self.reg_slot[STOLEN as usize] {
            Slot::Spilled(slot @ SpillSlot::Tls(_)) => {
                let _ = slot;
                Some(STOLEN)
            }
            _ => None,
        }
    }

    fn is_epilogue_kind(kind: &InstrKind) -> bool {
        matches!(kind, InstrKind::Restore { .. } | InstrKind::StackAdjust { .. })
    }

    /// Updates the walk with the just-classified instruction (spec §4.1
    /// `walk_post`).
    pub fn post(&mut self, instr: &DecodedInstr) {
        match instr.kind {
            InstrKind::Spill { reg, slot } => {
                // Redundant spills (spill while already spilled) are allowed.
                self.reg_slot[reg as usize] = Slot::Spilled(slot);
                self.in_mangle_epilogue = false;
            }
            InstrKind::Restore { reg, .. } => {
                self.reg_slot[reg as usize] = Slot::None;
                self.in_mangle_epilogue = true;
            }
            InstrKind::Cti { is_exit, .. } => {
                if !is_exit {
                    // Intra-fragment branch: downstream code may not rely
                    // on prior spills, so conservatively reset.
                    self.reg_slot = [Slot::None; REG_COUNT];
                }
                // Exit CTIs: spills survive to the translation target.
            }
            InstrKind::StackAdjust { delta } => {
                self.xsp_adjust += i64::from(delta);
                self.in_mangle_epilogue = true;
            }
            InstrKind::CleanCallArg => {
                self.in_clean_call = true;
            }
            InstrKind::OurMangling { recognized } => {
                if !recognized {
                    self.unsupported_mangle = true;
                }
            }
            InstrKind::AppInstr => {}
        }
    }

    /// The good-state predicate (spec §4.1): true iff full-state
    /// translation may proceed. PC-only translation ignores this.
    pub fn good_state(&self, target_pc_is_past_region: bool) -> bool {
        !self.unsupported_mangle || target_pc_is_past_region
    }

    pub fn in_clean_call(&self) -> bool {
        self.in_clean_call
    }

    pub fn translation(&self) -> Option<u64> {
        self.translation
    }

    /// Reload every spilled register from its slot into the reconstructed
    /// context and subtract `xsp_adjust` from the stack pointer (spec
    /// §4.1 "Restore operation").
    ///
    /// `tls` and `saved_mcontext` supply the actual spilled values; `at_post_region`
    /// suppresses the `xsp_adjust` subtraction when the reconstructed PC is
    /// the post-region point (we already arrived past the push/pop).
    pub fn restore(
        &mut self,
        tls: &dyn Fn(u32) -> u64,
        saved_mcontext: &dyn Fn(u32) -> u64,
        at_post_region: bool,
    ) {
        for reg in Reg::all() {
            if let Slot::Spilled(slot) = self.reg_slot[reg as usize] {
                let value = match slot {
                    SpillSlot::Tls(off) => tls(off),
                    SpillSlot::Mcontext(off) => saved_mcontext(off),
                };
                self.mcontext.set_reg(reg, value);
            }
        }
        if !at_post_region {
            let xsp = self.mcontext.xsp();
            self.mcontext
                .set_xsp(xsp.wrapping_sub(self.xsp_adjust as u64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codecage_core::MachineContext;

    fn instr(kind: InstrKind, our_mangling: bool, translation: Option<u64>) -> DecodedInstr {
        DecodedInstr {
            kind,
            our_mangling,
            translation,
            length: 4,
        }
    }

    #[test]
    fn spill_then_restore_round_trips_register_value() {
        let mc = MachineContext::new(0xc000_0000);
        let mut walk = Walk::init(0xc000_0000, 0xc000_1000, mc);

        let spill = instr(
            InstrKind::Spill {
                reg: Reg::Rax,
                slot: SpillSlot::Tls(0x40),
            },
            true,
            Some(0x4000),
        );
        walk.pre(&spill);
        walk.post(&spill);

        // Mid-region: rax should be reported as spilled at TLS[0x40].
        let tls_values = std::collections::HashMap::from([(0x40u32, 0xdead_beefu64)]);
        walk.restore(&|off| tls_values[&off], &|_| 0, false);
        assert_eq!(walk.mcontext.reg(Reg::Rax), 0xdead_beef);
    }

    #[test]
    fn intra_fragment_branch_resets_spills() {
        let mc = MachineContext::new(0xc000_0000);
        let mut walk = Walk::init(0xc000_0000, 0xc000_1000, mc);
        let spill = instr(
            InstrKind::Spill {
                reg: Reg::Rbx,
                slot: SpillSlot::Tls(0x8),
            },
            true,
            Some(0x4000),
        );
        walk.pre(&spill);
        walk.post(&spill);

        let branch = instr(InstrKind::Cti { is_exit: false, target: None }, true, Some(0x4000));
        walk.pre(&branch);
        walk.post(&branch);

        walk.restore(&|_| 0xffff, &|_| 0, false);
        // rbx spill was cleared by the intra-fragment branch, so restore
        // must not touch it (it stays at its initial zero value).
        assert_eq!(walk.mcontext.reg(Reg::Rbx), 0);
    }

    #[test]
    fn exit_cti_preserves_spills() {
        let mc = MachineContext::new(0xc000_0000);
        let mut walk = Walk::init(0xc000_0000, 0xc000_1000, mc);
        let spill = instr(
            InstrKind::Spill {
                reg: Reg::Rcx,
                slot: SpillSlot::Tls(0x10),
            },
            true,
            Some(0x4000),
        );
        walk.pre(&spill);
        walk.post(&spill);

        let exit = instr(
            InstrKind::Cti {
                is_exit: true,
                target: Some(0x5000),
            },
            true,
            Some(0x4000),
        );
        walk.pre(&exit);
        walk.post(&exit);

        walk.restore(&|off| if off == 0x10 { 0x1234 } else { 0 }, &|_| 0, false);
        assert_eq!(walk.mcontext.reg(Reg::Rcx), 0x1234);
    }

    #[test]
    fn stack_adjust_accumulates_and_is_subtracted_on_restore() {
        let mut mc = MachineContext::new(0xc000_0000);
        mc.set_xsp(0x7fff_1000);
        let mut walk = Walk::init(0xc000_0000, 0xc000_1000, mc);

        for delta in [-8i32, -8] {
            let adj = instr(InstrKind::StackAdjust { delta }, true, Some(0x4000));
            walk.pre(&adj);
            walk.post(&adj);
        }
        assert_eq!(walk.xsp_adjust, -16);
        walk.restore(&|_| 0, &|_| 0, false);
        assert_eq!(walk.mcontext.xsp(), 0x7fff_1010);
    }

    #[test]
    fn post_region_restore_does_not_subtract_xsp_adjust() {
        let mut mc = MachineContext::new(0xc000_0000);
        mc.set_xsp(0x7fff_1000);
        let mut walk = Walk::init(0xc000_0000, 0xc000_1000, mc);
        let adj = instr(InstrKind::StackAdjust { delta: -8 }, true, Some(0x4000));
        walk.pre(&adj);
        walk.post(&adj);

        walk.restore(&|_| 0, &|_| 0, true);
        assert_eq!(walk.mcontext.xsp(), 0x7fff_1000);
    }

    #[test]
    fn unrecognized_mangling_sets_unsupported_sticky() {
        let mc = MachineContext::new(0xc000_0000);
        let mut walk = Walk::init(0xc000_0000, 0xc000_1000, mc);
        let weird = instr(
            InstrKind::OurMangling { recognized: false },
            true,
            Some(0x4000),
        );
        walk.pre(&weird);
        walk.post(&weird);
        assert!(!walk.good_state(false));
        assert!(walk.good_state(true), "past the region, full translation may proceed regardless");
    }

    #[test]
    fn recognized_known_safe_mangling_keeps_good_state() {
        let mc = MachineContext::new(0xc000_0000);
        let mut walk = Walk::init(0xc000_0000, 0xc000_1000, mc);
        let safe = instr(
            InstrKind::OurMangling { recognized: true },
            true,
            Some(0x4000),
        );
        walk.pre(&safe);
        walk.post(&safe);
        assert!(walk.good_state(false));
        assert!(
            !walk.in_clean_call(),
            "a recognized known-safe mangling is not by itself a clean call"
        );
    }

    #[test]
    fn clean_call_arg_label_sets_in_clean_call() {
        let mc = MachineContext::new(0xc000_0000);
        let mut walk = Walk::init(0xc000_0000, 0xc000_1000, mc);
        let label = instr(InstrKind::CleanCallArg, false, None);
        walk.pre(&label);
        walk.post(&label);
        assert!(walk.in_clean_call());
    }

    #[test]
    fn crossing_region_boundary_resets_spill_state() {
        let mc = MachineContext::new(0xc000_0000);
        let mut walk = Walk::init(0xc000_0000, 0xc000_1000, mc);
        let spill = instr(
            InstrKind::Spill {
                reg: Reg::Rdx,
                slot: SpillSlot::Mcontext(0x20),
            },
            true,
            Some(0x4000),
        );
        walk.pre(&spill);
        walk.post(&spill);

        // A later instruction attached to a different app PC starts a new
        // region and must reset tracking.
        let next_region = instr(InstrKind::AppInstr, false, Some(0x4004));
        walk.pre(&next_region);
        walk.post(&next_region);

        walk.restore(&|_| 0, &|off| if off == 0x20 { 0x99 } else { 0 }, false);
        assert_eq!(walk.mcontext.reg(Reg::Rdx), 0, "spill from prior region must not leak");
    }
}
