//! Register snapshots and provenance-free memory loads.
//!
//! Everything here that varies by architecture is confined to this file; the
//! stack walker and allocator backends are architecture-agnostic.

/// Highest address a userspace mapping can occupy. Used as the synthetic
/// "top of stack" marker when a walk runs out of frames.
#[cfg(target_arch = "x86_64")]
pub const MAXIMUM_USER_ADDRESS: usize = 0x0000_7fff_ffff_f000;

#[cfg(target_arch = "aarch64")]
pub const MAXIMUM_USER_ADDRESS: usize = 0x0000_ffff_ffff_f000;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("unsupported arch");

/// Read the current stack pointer.
#[inline(always)]
pub fn current_sp() -> usize {
    let sp: usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        std::arch::asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}

/// Read the current frame pointer. Only meaningful when the enclosing code
/// was compiled to maintain one; callers treat 0 or junk as "not recovered".
#[inline(always)]
pub fn current_bp() -> usize {
    let bp: usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!("mov {}, rbp", out(reg) bp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        std::arch::asm!("mov {}, x29", out(reg) bp, options(nomem, nostack, preserves_flags));
    }
    bp
}

/// Read the current instruction pointer (address of the next instruction).
#[inline(always)]
pub fn current_ip() -> usize {
    let ip: usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!("lea {}, [rip]", out(reg) ip, options(nomem, nostack, preserves_flags));
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        std::arch::asm!("adr {}, .", out(reg) ip, options(nomem, nostack, preserves_flags));
    }
    ip
}

/// Read a single `usize` from `src`. `src` can have **no provenance** -- this
/// is how we look at saved frame pointers and chunk headers that no Rust
/// object ever owned.
///
/// # Safety
///
/// - `src` must be mapped and readable, or you get the SIGSEGV you deserve
/// - `src` must be aligned to `usize`
#[inline(always)]
pub unsafe fn usize_raw_load(dst: &mut usize, src: *const usize) {
    debug_assert!(!src.is_null());
    debug_assert!(src as usize % std::mem::align_of::<usize>() == 0);

    #[cfg(target_arch = "x86_64")]
    unsafe {
        // Properly ordered on x86 by default, and a single mov is atomic.
        std::arch::asm! {
            "mov rax, [{src}]",
            "mov [{dst}], rax",
            src = in(reg) src,
            dst = in(reg) dst,
            out("rax") _,
            options(nostack, preserves_flags),
        }
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        std::arch::asm! {
            "ldr {tmp}, [{src}]",
            "str {tmp}, [{dst}]",
            src = in(reg) src,
            dst = in(reg) dst,
            tmp = out(reg) _,
            options(nostack, preserves_flags),
        }
    }
}

/// [`usize_raw_load`] returning the value.
///
/// # Safety
///
/// Same contract as [`usize_raw_load`].
#[inline(always)]
pub unsafe fn usize_load(src: *const usize) -> usize {
    let mut dst = 0;
    usize_raw_load(&mut dst, src);
    dst
}
