//! Stack frame identity.
//!
//! A frame's locals block runs from its own frame pointer up to (not
//! including) its caller's. Walking outward from the innermost frame, each
//! adjacent pair of visited frames therefore bounds one locals block, and the
//! sentinel frame the walker appends bounds the outermost block the same way
//! as every inner one.
//!
//! Which type those locals carry comes from the [`FrameTable`]: a sorted
//! table of function entry points, each mapping the function's code range to
//! the composite type describing its frame layout.

use crate::alloc::{AllocBackend, AllocationRecord, BackendKind};
use crate::arch::mem;
use crate::arch::unwind::UnwindCursor;
use crate::error::{Error, Result};
use crate::meta::TypeId;
use crate::stackwalk::{self, FrameSnapshot, TOP_OF_STACK};
use std::ops::ControlFlow;

/// Frame layout facts for one function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Entry point of the function.
    pub entry: usize,
    /// Bytes of code; an `ip` anywhere in `[entry, entry + code_size)`
    /// belongs to this function.
    pub code_size: usize,
    /// The composite type describing the frame's locals block.
    pub locals: TypeId,
}

/// Frame descriptors sorted by entry point, probed by return address.
#[derive(Clone, Debug, Default)]
pub struct FrameTable {
    frames: Vec<FrameDescriptor>,
}

impl FrameTable {
    pub fn new(mut frames: Vec<FrameDescriptor>) -> Self {
        frames.sort_by_key(|d| d.entry);
        Self { frames }
    }

    /// The descriptor of the function whose code contains `ip`.
    pub fn lookup(&self, ip: usize) -> Option<FrameDescriptor> {
        let idx = self.frames.partition_point(|d| d.entry <= ip);
        let d = self.frames.get(idx.checked_sub(1)?)?;
        (ip < d.entry + d.code_size).then_some(*d)
    }
}

type CursorFactory = Box<dyn Fn() -> Box<dyn UnwindCursor> + Send + Sync>;

/// The stack's [`AllocBackend`]. The cursor factory is injected so tests can
/// script a stack; production wires in
/// [`FramePointerCursor::capture`](crate::arch::unwind::FramePointerCursor).
pub struct StackBackend {
    frames: FrameTable,
    cursor: CursorFactory,
    /// Explicit `[lo, hi)` stack extent; when absent, "somewhere above the
    /// current stack pointer" is used.
    domain: Option<(usize, usize)>,
}

impl StackBackend {
    pub fn new(
        frames: FrameTable,
        cursor: impl Fn() -> Box<dyn UnwindCursor> + Send + Sync + 'static,
    ) -> Self {
        Self { frames, cursor: Box::new(cursor), domain: None }
    }

    pub fn with_domain(mut self, lo: usize, hi: usize) -> Self {
        self.domain = Some((lo, hi));
        self
    }

    fn record_for(
        &self,
        owner: &FrameSnapshot,
        lo: usize,
        hi: usize,
    ) -> Result<AllocationRecord> {
        match self.frames.lookup(owner.ip) {
            Some(d) => Ok(AllocationRecord {
                start: lo as *const (),
                size: hi - lo,
                ty: Some(d.locals),
                site: Some(d.entry),
            }),
            None => Err(Error::UnrecognisedAllocSite {
                record: AllocationRecord {
                    start: lo as *const (),
                    size: hi - lo,
                    ty: None,
                    site: None,
                },
            }),
        }
    }
}

impl AllocBackend for StackBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Stack
    }

    fn contains(&self, addr: usize) -> bool {
        match self.domain {
            Some((lo, hi)) => addr >= lo && addr < hi,
            None => addr >= mem::current_sp() && addr < TOP_OF_STACK,
        }
    }

    fn resolve(&self, addr: usize) -> Result<AllocationRecord> {
        let mut cursor = (self.cursor)();
        let mut prev: Option<FrameSnapshot> = None;
        let found = stackwalk::walk_stack(&mut *cursor, |frame| {
            if let Some(owner) = prev {
                if let (Some(lo), Some(hi)) = (owner.bp, frame.bp) {
                    if addr >= lo && addr < hi {
                        return ControlFlow::Break(self.record_for(&owner, lo, hi));
                    }
                    // Frame extents only grow outward; once we are past the
                    // address, no later frame can hold it.
                    if addr < lo {
                        return ControlFlow::Break(Err(Error::StackWalkUnexpectedFrame {
                            addr,
                        }));
                    }
                }
            }
            prev = Some(*frame);
            ControlFlow::Continue(())
        })?;
        match found {
            Some(result) => result,
            None => Err(Error::StackWalkReachedTop),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{TypeKind, TypeTable};
    use crate::stackwalk::tests::ScriptedCursor;

    fn table() -> (TypeTable, TypeId, TypeId) {
        let mut t = TypeTable::new();
        let long = t.base("long", 8);
        let inner = t.composite(TypeKind::Struct, "inner_frame", 32, &[(0, long), (8, long)]);
        let outer = t.composite(TypeKind::Struct, "outer_frame", 64, &[(0, long)]);
        (t, inner, outer)
    }

    fn backend(inner: TypeId, outer: TypeId) -> StackBackend {
        let frames = FrameTable::new(vec![
            FrameDescriptor { entry: 0x4000, code_size: 0x100, locals: inner },
            FrameDescriptor { entry: 0x5000, code_size: 0x100, locals: outer },
        ]);
        // Innermost frame first: inner_frame called from outer_frame.
        StackBackend::new(frames, || {
            Box::new(ScriptedCursor::new(vec![
                (0x4010, 0x7f00_0000, 0x7f00_0040),
                (0x5020, 0x7f00_0050, 0x7f00_00c0),
            ]))
        })
        .with_domain(0x7f00_0000, 0x7f10_0000)
    }

    #[test]
    fn frame_table_lookup_is_by_code_range() {
        let (_, inner, outer) = table();
        let frames = FrameTable::new(vec![
            FrameDescriptor { entry: 0x5000, code_size: 0x100, locals: outer },
            FrameDescriptor { entry: 0x4000, code_size: 0x100, locals: inner },
        ]);
        assert_eq!(frames.lookup(0x4000).unwrap().locals, inner);
        assert_eq!(frames.lookup(0x40ff).unwrap().locals, inner);
        assert!(frames.lookup(0x4100).is_none());
        assert!(frames.lookup(0x3fff).is_none());
        assert_eq!(frames.lookup(0x5050).unwrap().locals, outer);
    }

    #[test]
    fn locals_resolve_to_their_owning_frame() {
        let (_, inner, outer) = table();
        let b = backend(inner, outer);

        // Inside the innermost frame's block [0x7f00_0040, 0x7f00_00c0).
        let r = b.resolve(0x7f00_0048).unwrap();
        assert_eq!(r.start as usize, 0x7f00_0040);
        assert_eq!(r.size, 0x80);
        assert_eq!(r.ty, Some(inner));
        assert_eq!(r.site, Some(0x4000));

        // The outermost frame's block is closed by the sentinel.
        let r = b.resolve(0x7f00_00d0).unwrap();
        assert_eq!(r.start as usize, 0x7f00_00c0);
        assert_eq!(r.size, TOP_OF_STACK - 0x7f00_00c0);
        assert_eq!(r.ty, Some(outer));
        assert_eq!(r.site, Some(0x5000));
    }

    #[test]
    fn an_address_below_every_frame_is_unexpected() {
        let (_, inner, outer) = table();
        let b = backend(inner, outer);
        assert!(matches!(
            b.resolve(0x7f00_0010),
            Err(Error::StackWalkUnexpectedFrame { addr: 0x7f00_0010 })
        ));
    }

    #[test]
    fn unknown_function_yields_a_partial_record() {
        let (_t, inner, _) = table();
        // Only the inner function is described; the outer frame's ip misses.
        let frames = FrameTable::new(vec![FrameDescriptor {
            entry: 0x4000,
            code_size: 0x100,
            locals: inner,
        }]);
        let b = StackBackend::new(frames, || {
            Box::new(ScriptedCursor::new(vec![
                (0x4010, 0x7f00_0000, 0x7f00_0040),
                (0x9999, 0x7f00_0050, 0x7f00_00c0),
            ]))
        })
        .with_domain(0x7f00_0000, 0x7f10_0000);
        match b.resolve(0x7f00_00d0) {
            Err(Error::UnrecognisedAllocSite { record }) => {
                assert_eq!(record.start as usize, 0x7f00_00c0);
                assert_eq!(record.ty, None);
                assert_eq!(record.site, None);
            }
            other => panic!("expected UnrecognisedAllocSite, got {other:?}"),
        }
    }

    #[test]
    fn step_failure_surfaces_as_a_stack_error() {
        let (_, inner, outer) = table();
        let frames = FrameTable::new(vec![
            FrameDescriptor { entry: 0x4000, code_size: 0x100, locals: inner },
            FrameDescriptor { entry: 0x5000, code_size: 0x100, locals: outer },
        ]);
        let b = StackBackend::new(frames, || {
            Box::new(ScriptedCursor {
                frames: vec![(0x4010, 0x7f00_0000, 0x7f00_0040)],
                at: 0,
                fail_at_end: true,
            })
        })
        .with_domain(0x7f00_0000, 0x7f10_0000);
        assert!(matches!(
            b.resolve(0x7f05_0000),
            Err(Error::StackWalkStepFailure)
        ));
    }
}
