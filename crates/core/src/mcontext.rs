//! An architecture-neutral view of a machine context.
//!
//! The signal crate builds one of these from a real `ucontext_t` delivered
//! by the kernel (or tears one back down into one for `sigreturn`); the
//! translation crate only ever sees this abstraction, never raw platform
//! structures, so it stays portable across the archs DynamoRIO-style
//! translators target (x86-64 is the only one modeled concretely today).

/// General-purpose registers a fragment's mangling can spill, in the order
/// `TranslationWalk::reg_spilled`/`reg_in_tls` (spec §3) index them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Reg {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

pub const REG_COUNT: usize = 16;

const ALL_REGS: [Reg; REG_COUNT] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rbx,
    Reg::Rsp,
    Reg::Rbp,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

impl Reg {
    pub fn all() -> impl Iterator<Item = Reg> {
        ALL_REGS.iter().copied()
    }
}

/// A mutable copy of an application's (or, transiently, a cache-PC) register
/// file plus program counter.
///
/// This is `TranslationWalk::mcontext` in spec §3: the fault translator
/// reconstructs one of these from a cache context by walking spills and
/// stack adjustments backwards, and the master signal handler builds one
/// from (and tears one back down into) the kernel-delivered `ucontext_t`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineContext {
    gregs: [u64; REG_COUNT],
    pc: u64,
}

impl MachineContext {
    pub fn new(pc: u64) -> Self {
        MachineContext {
            gregs: [0; REG_COUNT],
            pc,
        }
    }

    pub fn reg(&self, r: Reg) -> u64 {
        self.gregs[r as usize]
    }

    pub fn set_reg(&mut self, r: Reg, value: u64) {
        self.gregs[r as usize] = value;
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    /// The stack pointer, i.e. `Reg::Rsp`. Exposed under its own name
    /// because the tracker/translator deal with it far more than any other
    /// register (spec §4.1's `xsp_adjust`).
    pub fn xsp(&self) -> u64 {
        self.reg(Reg::Rsp)
    }

    pub fn set_xsp(&mut self, value: u64) {
        self.set_reg(Reg::Rsp, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_round_trips_through_get_set() {
        let mut mc = MachineContext::new(0x1000);
        for r in Reg::all() {
            mc.set_reg(r, 0xdead_beef);
        }
        for r in Reg::all() {
            assert_eq!(mc.reg(r), 0xdead_beef);
        }
        assert_eq!(mc.xsp(), 0xdead_beef);
    }

    #[test]
    fn xsp_is_rsp() {
        let mut mc = MachineContext::new(0);
        mc.set_xsp(0x7fff_0000);
        assert_eq!(mc.reg(Reg::Rsp), 0x7fff_0000);
    }
}
