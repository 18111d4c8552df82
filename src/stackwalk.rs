//! The generic stack walk: drive an [`UnwindCursor`] from the innermost
//! frame outward, handing each frame to a visitor.
//!
//! When the cursor reports exhaustion we synthesize one final sentinel frame
//! whose `sp` and `bp` both sit at [`TOP_OF_STACK`]. The sentinel is visited
//! like any other frame, so a visitor accumulating frame extents sees the
//! outermost real frame bounded above just like every inner one, with no
//! special final-iteration case.

use std::ops::ControlFlow;

use crate::arch::mem::MAXIMUM_USER_ADDRESS;
use crate::arch::unwind::{Reg, Step, UnwindCursor};
use crate::error::Result;

/// The `sp`/`bp` of the synthetic frame that closes every walk.
pub const TOP_OF_STACK: usize = MAXIMUM_USER_ADDRESS;

/// One visited frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSnapshot {
    /// Instruction pointer; 0 in the sentinel frame.
    pub ip: usize,
    pub sp: usize,
    /// Frame pointer, when the cursor recovered one.
    pub bp: Option<usize>,
}

impl FrameSnapshot {
    pub fn is_sentinel(&self) -> bool {
        self.sp == TOP_OF_STACK
    }

    fn of(cursor: &(impl UnwindCursor + ?Sized)) -> Option<Self> {
        Some(FrameSnapshot {
            ip: cursor.register(Reg::Ip)?,
            sp: cursor.register(Reg::Sp)?,
            bp: cursor.register(Reg::Bp),
        })
    }

    fn sentinel() -> Self {
        FrameSnapshot { ip: 0, sp: TOP_OF_STACK, bp: Some(TOP_OF_STACK) }
    }
}

/// Walk `cursor` outward, visiting every frame and finally the sentinel.
///
/// Returns `Ok(Some(b))` if the visitor broke with `b`, `Ok(None)` if the
/// whole stack (sentinel included) was visited, and `Err` if the cursor
/// failed to recover a frame mid-walk.
pub fn walk_stack<B>(
    cursor: &mut (impl UnwindCursor + ?Sized),
    mut visit: impl FnMut(&FrameSnapshot) -> ControlFlow<B>,
) -> Result<Option<B>> {
    loop {
        let frame = match FrameSnapshot::of(cursor) {
            Some(frame) => frame,
            None => break,
        };
        if let ControlFlow::Break(b) = visit(&frame) {
            return Ok(Some(b));
        }
        match cursor.step()? {
            Step::Stepped => {}
            Step::Exhausted => break,
        }
    }
    if let ControlFlow::Break(b) = visit(&FrameSnapshot::sentinel()) {
        return Ok(Some(b));
    }
    Ok(None)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;

    /// A cursor that replays a fixed list of frames.
    pub(crate) struct ScriptedCursor {
        pub frames: Vec<(usize, usize, usize)>,
        pub at: usize,
        /// Fail instead of exhausting after the last frame.
        pub fail_at_end: bool,
    }

    impl ScriptedCursor {
        pub fn new(frames: Vec<(usize, usize, usize)>) -> Self {
            Self { frames, at: 0, fail_at_end: false }
        }
    }

    impl UnwindCursor for ScriptedCursor {
        fn register(&self, reg: Reg) -> Option<usize> {
            let &(ip, sp, bp) = self.frames.get(self.at)?;
            Some(match reg {
                Reg::Ip => ip,
                Reg::Sp => sp,
                Reg::Bp => bp,
            })
        }

        fn step(&mut self) -> Result<Step> {
            if self.at + 1 < self.frames.len() {
                self.at += 1;
                Ok(Step::Stepped)
            } else if self.fail_at_end {
                Err(Error::StackWalkStepFailure)
            } else {
                Ok(Step::Exhausted)
            }
        }
    }

    #[test]
    fn visits_every_frame_then_the_sentinel() {
        let mut cursor = ScriptedCursor::new(vec![
            (0x10, 0x7000, 0x7010),
            (0x20, 0x7020, 0x7040),
            (0x30, 0x7050, 0x7080),
        ]);
        let mut seen = Vec::new();
        let out: Option<()> = walk_stack(&mut cursor, |f| {
            seen.push(*f);
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(out, None);
        assert_eq!(seen.len(), 4);
        assert!(seen[..3].iter().all(|f| !f.is_sentinel()));
        assert!(seen[3].is_sentinel());
        assert_eq!(seen[3].bp, Some(TOP_OF_STACK));
        assert_eq!(seen[0].ip, 0x10);
        assert_eq!(seen[2].bp, Some(0x7080));
    }

    #[test]
    fn breaking_early_skips_the_rest() {
        let mut cursor = ScriptedCursor::new(vec![
            (0x10, 0x7000, 0x7010),
            (0x20, 0x7020, 0x7040),
        ]);
        let mut visits = 0;
        let out = walk_stack(&mut cursor, |f| {
            visits += 1;
            if f.ip == 0x10 {
                ControlFlow::Break(f.ip)
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();
        assert_eq!(out, Some(0x10));
        assert_eq!(visits, 1);
    }

    #[test]
    fn step_failure_propagates() {
        let mut cursor = ScriptedCursor {
            frames: vec![(0x10, 0x7000, 0x7010)],
            at: 0,
            fail_at_end: true,
        };
        let out: Result<Option<()>> = walk_stack(&mut cursor, |_| ControlFlow::Continue(()));
        assert!(matches!(out, Err(Error::StackWalkStepFailure)));
    }

    #[test]
    fn empty_stack_still_visits_the_sentinel() {
        let mut cursor = ScriptedCursor::new(vec![]);
        let mut seen = Vec::new();
        let out: Option<()> = walk_stack(&mut cursor, |f| {
            seen.push(*f);
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(out, None);
        assert_eq!(seen, vec![FrameSnapshot::sentinel()]);
    }

    #[test]
    fn a_break_on_the_sentinel_is_reported() {
        let mut cursor = ScriptedCursor::new(vec![(0x10, 0x7000, 0x7010)]);
        let out = walk_stack(&mut cursor, |f| {
            if f.is_sentinel() {
                ControlFlow::Break("top")
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();
        assert_eq!(out, Some("top"));
    }
}
