//! Context-switch backend.
//!
//! The scheduler multiplexes logical threads over a single hardware thread by
//! saving and restoring captured execution contexts. Everything
//! architecture-specific sits behind the narrow [`ContextBackend`] capability:
//!
//! - `prepare` lays out a fresh private stack so that the first resume of the
//!   returned context enters the thread entry shim with a well-formed call
//!   frame (the relocate-for-new-stack operation);
//! - `switch` captures the caller's context and resumes another one in a
//!   single fused operation. The call returns only when the saved context is
//!   itself resumed later.
//!
//! Alternative backends (OS threads, fibers, green-thread runtimes) can
//! satisfy the same contract without touching scheduler logic.

use core::ptr;

/// Entry shim invoked on the first resume of a prepared context.
///
/// The shim receives the opaque argument given to
/// [`ContextBackend::prepare`] and must never return: there is no frame
/// beneath it to return into.
pub type RawEntry = extern "C" fn(*mut ()) -> !;

/// A captured execution context: enough machine state to resume exactly
/// where it suspended.
///
/// For the native backend this is just the stack pointer, since the
/// callee-saved register file lives on the suspended thread's own stack.
/// Other backends may treat the word as an arbitrary handle.
#[derive(Debug)]
#[repr(C)]
pub struct Context {
    sp: *mut u8,
}

impl Context {
    /// A context that has never been captured. Resuming it is a contract
    /// violation; it exists so a context slot can be created before the
    /// first capture writes into it.
    pub const fn empty() -> Self {
        Context {
            sp: ptr::null_mut(),
        }
    }
}

/// The context-switch capability consumed by the scheduler.
///
/// # Safety
///
/// Implementations must guarantee that `switch` preserves every piece of
/// machine state the compiled code may rely on across a call boundary, and
/// that a context produced by `prepare` enters `entry(arg)` on the supplied
/// stack when first resumed.
pub unsafe trait ContextBackend {
    /// Lays out `len` bytes at `stack` so that resuming the returned context
    /// enters `entry(arg)` on that stack.
    ///
    /// # Safety
    ///
    /// `stack` must be valid for writes of `len` bytes and stay valid (and
    /// unshared) for as long as the prepared context or the running thread
    /// exists. `len` must be at least [`crate::thread::MIN_STACK_SIZE`].
    unsafe fn prepare(&self, stack: *mut u8, len: usize, entry: RawEntry, arg: *mut ()) -> Context;

    /// Captures the calling context into `save` and resumes `resume`.
    /// Returns when `save` is itself resumed.
    ///
    /// # Safety
    ///
    /// `save` must be valid for writes, `resume` must hold a context that was
    /// produced by `prepare` or a previous `switch` on this backend and has
    /// not been resumed since.
    unsafe fn switch(&self, save: *mut Context, resume: *const Context);
}

/// The pure user-space backend: no OS, no hardware thread support, one
/// shared CPU. Contexts are switched by swapping stack pointers after
/// spilling the callee-saved register file onto the suspending stack.
pub struct NativeBackend;

unsafe impl ContextBackend for NativeBackend {
    unsafe fn prepare(&self, stack: *mut u8, len: usize, entry: RawEntry, arg: *mut ()) -> Context {
        unsafe { arch::prepare(stack, len, entry, arg) }
    }

    unsafe fn switch(&self, save: *mut Context, resume: *const Context) {
        unsafe { arch::switch_context(save, resume) }
    }
}

#[cfg(all(target_arch = "x86_64", target_family = "unix"))]
mod arch {
    use core::arch::naked_asm;

    use super::{Context, RawEntry};

    // Frame consumed by `switch_context`, lowest address first:
    //   rbx, rbp, r12, r13, r14, r15, return rip
    const FRAME_WORDS: usize = 7;

    pub(super) unsafe fn prepare(
        stack: *mut u8,
        len: usize,
        entry: RawEntry,
        arg: *mut (),
    ) -> Context {
        // The trampoline is entered with rsp == top, so top itself must be
        // 16-byte aligned for the SysV call that follows.
        let top = (stack as usize + len) & !15;
        let frame = (top - FRAME_WORDS * 8) as *mut u64;
        unsafe {
            frame.add(0).write(0); // rbx
            frame.add(1).write(0); // rbp
            frame.add(2).write(arg as u64); // r12
            frame.add(3).write(entry as usize as u64); // r13
            frame.add(4).write(0); // r14
            frame.add(5).write(0); // r15
            frame.add(6).write(thread_trampoline as usize as u64); // return rip
        }
        Context {
            sp: frame as *mut u8,
        }
    }

    /// First code a fresh thread runs. `prepare` seeded r12 with the entry
    /// argument and r13 with the entry shim; the shim never returns.
    #[unsafe(naked)]
    extern "C" fn thread_trampoline() -> ! {
        naked_asm!("mov rdi, r12", "call r13", "ud2");
    }

    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn switch_context(_save: *mut Context, _resume: *const Context) {
        naked_asm!(
            "push r15",
            "push r14",
            "push r13",
            "push r12",
            "push rbp",
            "push rbx",
            "mov [rdi], rsp",
            "mov rsp, [rsi]",
            "pop rbx",
            "pop rbp",
            "pop r12",
            "pop r13",
            "pop r14",
            "pop r15",
            "ret",
        );
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use core::arch::naked_asm;

    use super::{Context, RawEntry};

    // AAPCS64 callee-saved frame: x19..x28, fp, lr, then d8..d15.
    const FRAME_SIZE: usize = 160;

    pub(super) unsafe fn prepare(
        stack: *mut u8,
        len: usize,
        entry: RawEntry,
        arg: *mut (),
    ) -> Context {
        let top = (stack as usize + len) & !15;
        let frame = (top - FRAME_SIZE) as *mut u64;
        unsafe {
            core::ptr::write_bytes(frame, 0, FRAME_SIZE / 8);
            frame.add(0).write(arg as u64); // x19
            frame.add(1).write(entry as usize as u64); // x20
            frame.add(11).write(thread_trampoline as usize as u64); // x30
        }
        Context {
            sp: frame as *mut u8,
        }
    }

    /// First code a fresh thread runs. `prepare` seeded x19 with the entry
    /// argument and x20 with the entry shim; the shim never returns.
    #[unsafe(naked)]
    extern "C" fn thread_trampoline() -> ! {
        naked_asm!("mov x0, x19", "blr x20", "brk #0");
    }

    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn switch_context(_save: *mut Context, _resume: *const Context) {
        naked_asm!(
            "sub sp, sp, #160",
            "stp x19, x20, [sp, #0]",
            "stp x21, x22, [sp, #16]",
            "stp x23, x24, [sp, #32]",
            "stp x25, x26, [sp, #48]",
            "stp x27, x28, [sp, #64]",
            "stp x29, x30, [sp, #80]",
            "stp d8, d9, [sp, #96]",
            "stp d10, d11, [sp, #112]",
            "stp d12, d13, [sp, #128]",
            "stp d14, d15, [sp, #144]",
            "mov x2, sp",
            "str x2, [x0]",
            "ldr x2, [x1]",
            "mov sp, x2",
            "ldp x19, x20, [sp, #0]",
            "ldp x21, x22, [sp, #16]",
            "ldp x23, x24, [sp, #32]",
            "ldp x25, x26, [sp, #48]",
            "ldp x27, x28, [sp, #64]",
            "ldp x29, x30, [sp, #80]",
            "ldp d8, d9, [sp, #96]",
            "ldp d10, d11, [sp, #112]",
            "ldp d12, d13, [sp, #128]",
            "ldp d14, d15, [sp, #144]",
            "add sp, sp, #160",
            "ret",
        );
    }
}

#[cfg(not(any(all(target_arch = "x86_64", target_family = "unix"), target_arch = "aarch64")))]
compile_error!("no native context-switch backend for this target");

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn never_entry(_arg: *mut ()) -> ! {
        unreachable!("prepared context resumed in a unit test")
    }

    #[test]
    fn prepared_context_points_into_stack() {
        let mut stack = vec![0u8; 4096];
        let base = stack.as_mut_ptr();
        let ctx = unsafe { NativeBackend.prepare(base, stack.len(), never_entry, ptr::null_mut()) };
        let sp = ctx.sp as usize;
        assert!(sp > base as usize);
        assert!(sp < base as usize + stack.len());
        // The register spill area must be 8-byte aligned.
        assert_eq!(sp % 8, 0);
    }
}
