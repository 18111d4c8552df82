//! A minimal frame-pointer unwinder behind a stepping-cursor trait.
//!
//! The trait is the seam: the stack walker and the stack allocator backend
//! only ever talk to an [`UnwindCursor`], so tests drive them with scripted
//! cursors and never have to care what the real machine stack looks like.

use once_cell::sync::Lazy;

use crate::arch::mem::{self, MAXIMUM_USER_ADDRESS};
use crate::error::{Error, Result};

static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// Sanity bound on how far apart two adjacent frames may be.
const MAX_FRAME_SPAN_PAGES: usize = 256;

/// The registers a cursor can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reg {
    Ip,
    Sp,
    Bp,
}

/// Outcome of one step toward the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// The cursor now describes the caller's frame.
    Stepped,
    /// There is no caller; the walk has run off the top of the stack.
    Exhausted,
}

/// A position in some stack, steppable toward older frames.
pub trait UnwindCursor {
    /// The value of `reg` at the current frame, if recovered.
    fn register(&self, reg: Reg) -> Option<usize>;

    /// Advance to the caller's frame.
    fn step(&mut self) -> Result<Step>;
}

/// Cursor over the live call stack, following the saved-frame-pointer chain.
///
/// Requires frame pointers to be maintained (`-C force-frame-pointers` or a
/// matching C ABI). A frame that was compiled without one will read junk, so
/// every step is plausibility-checked and implausible chains end the walk
/// with an error rather than a fault.
#[derive(Clone, Copy, Debug)]
pub struct FramePointerCursor {
    ip: usize,
    sp: usize,
    bp: usize,
}

impl FramePointerCursor {
    /// Snapshot the caller's registers. `#[inline(always)]` so the captured
    /// frame is the caller's, not our own.
    #[inline(always)]
    pub fn capture() -> Self {
        Self {
            ip: mem::current_ip(),
            sp: mem::current_sp(),
            bp: mem::current_bp(),
        }
    }

    fn bp_is_plausible(bp: usize, sp: usize) -> bool {
        bp != 0
            && bp % std::mem::align_of::<usize>() == 0
            && bp >= sp
            && bp < MAXIMUM_USER_ADDRESS
    }
}

impl UnwindCursor for FramePointerCursor {
    fn register(&self, reg: Reg) -> Option<usize> {
        match reg {
            Reg::Ip => Some(self.ip),
            Reg::Sp => Some(self.sp),
            Reg::Bp => Some(self.bp),
        }
    }

    fn step(&mut self) -> Result<Step> {
        if !Self::bp_is_plausible(self.bp, self.sp) {
            return Err(Error::StackWalkStepFailure);
        }
        // Saved layout at bp: [caller's bp][return address].
        let caller_bp = unsafe { mem::usize_load(self.bp as *const usize) };
        let ret_ip = unsafe { mem::usize_load((self.bp + 8) as *const usize) };
        if caller_bp == 0 || ret_ip == 0 {
            return Ok(Step::Exhausted);
        }
        if caller_bp <= self.bp || caller_bp - self.bp > MAX_FRAME_SPAN_PAGES * *PAGE_SIZE {
            return Err(Error::StackWalkStepFailure);
        }
        self.sp = self.bp + 16;
        self.bp = caller_bp;
        self.ip = ret_ip;
        Ok(Step::Stepped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_reports_all_registers() {
        let cursor = FramePointerCursor::capture();
        let sp = cursor.register(Reg::Sp).unwrap();
        assert_ne!(sp, 0);
        assert!(sp < MAXIMUM_USER_ADDRESS);
        assert!(cursor.register(Reg::Ip).unwrap() > 0);
    }

    #[test]
    fn zero_bp_fails_a_step() {
        let mut cursor = FramePointerCursor { ip: 1, sp: 0x1000, bp: 0 };
        assert!(matches!(cursor.step(), Err(Error::StackWalkStepFailure)));
    }

    #[test]
    fn misaligned_bp_fails_a_step() {
        let mut cursor = FramePointerCursor { ip: 1, sp: 0x1000, bp: 0x1001 };
        assert!(matches!(cursor.step(), Err(Error::StackWalkStepFailure)));
    }

    #[test]
    fn synthetic_frame_chain_steps_and_exhausts() {
        // Two fake frames laid out in an ordinary array: the inner frame's
        // saved-bp slot points at the outer frame, whose saved bp is 0.
        let mut stack = [0usize; 8];
        let base = stack.as_mut_ptr() as usize;
        // Outer frame at slots 4..6: saved bp 0, return ip 0 (end of chain).
        // Inner frame at slots 0..2: saved bp -> outer, return ip nonzero.
        stack[0] = base + 4 * 8;
        stack[1] = 0xabcd;

        let mut cursor = FramePointerCursor { ip: 0x1111, sp: base, bp: base };
        assert_eq!(cursor.step().unwrap(), Step::Stepped);
        assert_eq!(cursor.register(Reg::Ip), Some(0xabcd));
        assert_eq!(cursor.register(Reg::Sp), Some(base + 16));
        assert_eq!(cursor.register(Reg::Bp), Some(base + 4 * 8));
        assert_eq!(cursor.step().unwrap(), Step::Exhausted);
    }
}
