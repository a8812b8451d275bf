//! Conversions between a kernel-delivered `ucontext_t` and the
//! architecture-neutral [`MachineContext`] (mcontext.rs's own doc comment:
//! "the signal crate builds one of these from a real `ucontext_t`... the
//! translation crate only ever sees this abstraction").
//!
//! x86-64 Linux only today, the same scope the fault translator's tracker
//! and `MachineContext` itself are built for.

use codecage_core::{MachineContext, Reg};

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        /// Reads the general-purpose registers and PC out of a raw
        /// `ucontext_t` delivered by the kernel into the handler.
        ///
        /// # Safety
        /// `ucontext` must point to a valid, fully-initialized
        /// `libc::ucontext_t` for the duration of the call.
        pub unsafe fn read_mcontext(ucontext: *const libc::ucontext_t) -> MachineContext {
            let gregs = &(*ucontext).uc_mcontext.gregs;
            let mut mc = MachineContext::new(gregs[libc::REG_RIP as usize] as u64);
            mc.set_reg(Reg::Rax, gregs[libc::REG_RAX as usize] as u64);
            mc.set_reg(Reg::Rcx, gregs[libc::REG_RCX as usize] as u64);
            mc.set_reg(Reg::Rdx, gregs[libc::REG_RDX as usize] as u64);
            mc.set_reg(Reg::Rbx, gregs[libc::REG_RBX as usize] as u64);
            mc.set_reg(Reg::Rsp, gregs[libc::REG_RSP as usize] as u64);
            mc.set_reg(Reg::Rbp, gregs[libc::REG_RBP as usize] as u64);
            mc.set_reg(Reg::Rsi, gregs[libc::REG_RSI as usize] as u64);
            mc.set_reg(Reg::Rdi, gregs[libc::REG_RDI as usize] as u64);
            mc.set_reg(Reg::R8, gregs[libc::REG_R8 as usize] as u64);
            mc.set_reg(Reg::R9, gregs[libc::REG_R9 as usize] as u64);
            mc.set_reg(Reg::R10, gregs[libc::REG_R10 as usize] as u64);
            mc.set_reg(Reg::R11, gregs[libc::REG_R11 as usize] as u64);
            mc.set_reg(Reg::R12, gregs[libc::REG_R12 as usize] as u64);
            mc.set_reg(Reg::R13, gregs[libc::REG_R13 as usize] as u64);
            mc.set_reg(Reg::R14, gregs[libc::REG_R14 as usize] as u64);
            mc.set_reg(Reg::R15, gregs[libc::REG_R15 as usize] as u64);
            mc
        }

        /// The inverse of [`read_mcontext`]: writes a reconstructed context
        /// back into the kernel-visible `ucontext_t` before resuming,
        /// either straight back into the app (an in-place PC/register
        /// fixup) or into the dispatcher's fcache-return routine (spec
        /// §4.4's delivery mechanism: "rewrite the translator's own
        /// sigcontext so the signal return lands back in the dispatcher").
        ///
        /// # Safety
        /// Same as [`read_mcontext`].
        pub unsafe fn write_mcontext(ucontext: *mut libc::ucontext_t, mc: &MachineContext) {
            let gregs = &mut (*ucontext).uc_mcontext.gregs;
            gregs[libc::REG_RIP as usize] = mc.pc() as i64;
            gregs[libc::REG_RAX as usize] = mc.reg(Reg::Rax) as i64;
            gregs[libc::REG_RCX as usize] = mc.reg(Reg::Rcx) as i64;
            gregs[libc::REG_RDX as usize] = mc.reg(Reg::Rdx) as i64;
            gregs[libc::REG_RBX as usize] = mc.reg(Reg::Rbx) as i64;
            gregs[libc::REG_RSP as usize] = mc.reg(Reg::Rsp) as i64;
            gregs[libc::REG_RBP as usize] = mc.reg(Reg::Rbp) as i64;
            gregs[libc::REG_RSI as usize] = mc.reg(Reg::Rsi) as i64;
            gregs[libc::REG_RDI as usize] = mc.reg(Reg::Rdi) as i64;
            gregs[libc::REG_R8 as usize] = mc.reg(Reg::R8) as i64;
            gregs[libc::REG_R9 as usize] = mc.reg(Reg::R9) as i64;
            gregs[libc::REG_R10 as usize] = mc.reg(Reg::R10) as i64;
            gregs[libc::REG_R11 as usize] = mc.reg(Reg::R11) as i64;
            gregs[libc::REG_R12 as usize] = mc.reg(Reg::R12) as i64;
            gregs[libc::REG_R13 as usize] = mc.reg(Reg::R13) as i64;
            gregs[libc::REG_R14 as usize] = mc.reg(Reg::R14) as i64;
            gregs[libc::REG_R15 as usize] = mc.reg(Reg::R15) as i64;
        }

        /// Copies `siginfo_t` into the fixed byte buffer a [`crate::pending::PendingFrame`]
        /// carries, truncating (never panicking) if the kernel's struct is
        /// somehow larger than our buffer.
        ///
        /// # Safety
        /// `siginfo` must point to a valid `libc::siginfo_t`.
        pub unsafe fn read_siginfo(siginfo: *const libc::siginfo_t) -> [u8; 128] {
            let mut buf = [0u8; 128];
            let src = siginfo as *const u8;
            let len = std::mem::size_of::<libc::siginfo_t>().min(buf.len());
            std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), len);
            buf
        }

        /// Builds a `sigset_t` with exactly the bits named by `mask` set
        /// (spec §3/§4.4: `app_mask`/`uc_sigmask` are carried around this
        /// crate as a plain `u64`, one bit per signal 1..=64; the kernel's
        /// `sigset_t` is the only place that bitmask has to become a real
        /// libc type again).
        pub unsafe fn mask_to_sigset(mask: u64) -> libc::sigset_t {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            for sig in 1..=64i32 {
                if mask & (1u64 << (sig - 1)) != 0 {
                    libc::sigaddset(&mut set, sig);
                }
            }
            set
        }

        /// The inverse of [`mask_to_sigset`]: used when reading back
        /// `uc_sigmask` out of a frame the app's `sigreturn` is unwinding.
        pub unsafe fn sigset_to_mask(set: &libc::sigset_t) -> u64 {
            let mut mask = 0u64;
            for sig in 1..=64i32 {
                if libc::sigismember(set, sig) == 1 {
                    mask |= 1u64 << (sig - 1);
                }
            }
            mask
        }

        /// The real on-stack frame a signal handler registered with
        /// `SA_SIGINFO` expects: a return address (the restorer), a
        /// `ucontext_t`, and a `siginfo_t`, matching the Linux kernel's own
        /// `rt_sigframe` layout (spec §4.4 "Frame construction for app
        /// delivery": "copy the `PendingFrame` onto that stack... fix all
        /// intra-frame pointers... to point within the copied frame").
        #[repr(C)]
        struct RtSigframe {
            pretcode: u64,
            uc: libc::ucontext_t,
            info: libc::siginfo_t,
        }

        /// Where the three pieces of a just-written [`RtSigframe`] ended up,
        /// and the stack pointer the app handler should be entered with.
        #[derive(Clone, Copy, Debug)]
        pub struct AppFrame {
            pub entry_sp: u64,
            pub siginfo_ptr: u64,
            pub ucontext_ptr: u64,
        }

        /// Size in bytes of the on-stack frame [`write_app_frame`] writes,
        /// so callers can pre-check the target pages are writable before
        /// committing to the copy (spec §7 class 4).
        pub fn app_frame_size() -> usize {
            std::mem::size_of::<RtSigframe>()
        }

        /// Writes a full `rt_sigframe`-shaped frame at (at or below)
        /// `top_sp`, 16-byte aligned so a `call`-convention entry into the
        /// app handler sees a correctly aligned stack. Returns the pointers
        /// the three-argument `sa_sigaction` calling convention needs
        /// (`rdi = signum`, `rsi = siginfo_ptr`, `rdx = ucontext_ptr`).
        ///
        /// # Safety
        /// `top_sp` must point at writable memory at least
        /// `size_of::<RtSigframe>()` bytes below it, already verified via
        /// [`codecage_core::MemoryQuery::get_memory_info`] by the caller
        /// (spec §7 class 4: "pre-check each page's protection").
        pub unsafe fn write_app_frame(
            top_sp: u64,
            restorer: u64,
            mcontext: &MachineContext,
            sigmask: u64,
            siginfo_bytes: &[u8; 128],
        ) -> AppFrame {
            let size = std::mem::size_of::<RtSigframe>();
            let base = (top_sp as usize - size) & !0xf;
            let frame = base as *mut RtSigframe;
            std::ptr::write_bytes(frame.cast::<u8>(), 0, size);

            (*frame).pretcode = restorer;
            write_mcontext(&mut (*frame).uc as *mut libc::ucontext_t, mcontext);
            (*frame).uc.uc_sigmask = mask_to_sigset(sigmask);

            let info_dst = (&mut (*frame).info) as *mut libc::siginfo_t as *mut u8;
            let info_len = std::mem::size_of::<libc::siginfo_t>().min(siginfo_bytes.len());
            std::ptr::copy_nonoverlapping(siginfo_bytes.as_ptr(), info_dst, info_len);

            AppFrame {
                entry_sp: base as u64,
                siginfo_ptr: (&(*frame).info) as *const libc::siginfo_t as u64,
                ucontext_ptr: (&(*frame).uc) as *const libc::ucontext_t as u64,
            }
        }
    }
}

#[cfg(all(test, target_os = "linux", target_arch = "x86_64"))]
mod tests {
    use super::*;

    #[test]
    fn round_trips_pc_and_general_registers() {
        unsafe {
            let mut ctx: libc::ucontext_t = std::mem::zeroed();
            let mut mc = MachineContext::new(0x4000);
            mc.set_reg(Reg::Rax, 0x1111);
            mc.set_reg(Reg::Rsp, 0x7fff_0000);
            write_mcontext(&mut ctx, &mc);
            let back = read_mcontext(&ctx);
            assert_eq!(back.pc(), 0x4000);
            assert_eq!(back.reg(Reg::Rax), 0x1111);
            assert_eq!(back.reg(Reg::Rsp), 0x7fff_0000);
        }
    }
}
