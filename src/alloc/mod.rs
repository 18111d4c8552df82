//! Allocation identity: who owns a given address, how big the owning object
//! is, and what type it carries.
//!
//! Each storage class (heap, stack, static, plain mapped memory) gets its own
//! [`AllocBackend`]; the [`Registry`] holds them in nesting order, innermost
//! storage first, and dispatches a query to the first backend that claims the
//! address. Heap before stack matters: a heap chunk can live inside a region
//! the map-level backend would also claim, and the more specific answer wins.

pub mod heap;
pub mod mapped;
pub mod stack;
pub mod statics;

use serde::{Deserialize, Serialize};

use crate::diag;
use crate::error::{Error, Result};
use crate::meta::TypeId;
use crate::util::hint::cold;

/// The resolved identity of one allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Base address of the whole object.
    #[serde(with = "crate::serialize::serde_usize")]
    pub start: *const (),
    /// Extent in bytes.
    pub size: usize,
    /// The type laid out at `start`, when one is known.
    pub ty: Option<TypeId>,
    /// The site that created the allocation: a call-site address for heap
    /// chunks, a function entry point for stack frames, the object's own
    /// address for statics. `None` for plain mapped memory.
    pub site: Option<usize>,
}

impl AllocationRecord {
    pub fn end(&self) -> usize {
        self.start as usize + self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start as usize && addr < self.end()
    }
}

/// The storage class a backend covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Heap,
    Stack,
    Static,
    Mapped,
}

/// One storage class's resolver.
pub trait AllocBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Cheap containment test; `resolve` is only called when this says yes.
    fn contains(&self, addr: usize) -> bool;

    fn resolve(&self, addr: usize) -> Result<AllocationRecord>;
}

/// A successful query, tagged with the backend that answered it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub backend: BackendKind,
    pub record: AllocationRecord,
}

type UnindexedHook = Box<dyn Fn(usize) -> bool + Send + Sync>;

/// The dispatch table over every registered backend.
#[derive(Default)]
pub struct Registry {
    backends: Vec<Box<dyn AllocBackend>>,
    unindexed_hook: Option<UnindexedHook>,
}

impl Registry {
    pub fn new() -> Self {
        Self { backends: Vec::new(), unindexed_hook: None }
    }

    /// Append a backend. Order is significant: push innermost storage first
    /// (heap, then stack, then statics, then mapped regions).
    pub fn push(&mut self, backend: Box<dyn AllocBackend>) {
        self.backends.push(backend);
    }

    /// Install the one-shot recovery hook: called with the queried address
    /// when no backend had it indexed. The hook's job is to index
    /// lazily-discovered storage (a foreign allocator's arena, a fresh
    /// mapping); returning `true` means it did something and the query is
    /// retried, once.
    pub fn set_unindexed_hook(&mut self, hook: impl Fn(usize) -> bool + Send + Sync + 'static) {
        self.unindexed_hook = Some(Box::new(hook));
    }

    fn try_resolve(&self, addr: usize) -> Result<Resolved> {
        for backend in &self.backends {
            if backend.contains(addr) {
                let record = backend.resolve(addr)?;
                return Ok(Resolved { backend: backend.kind(), record });
            }
        }
        cold(|| ());
        Err(Error::ObjectOfUnknownStorage { addr })
    }

    /// Resolve `addr` to its owning allocation.
    pub fn resolve(&self, addr: usize) -> Result<Resolved> {
        let mut out = self.try_resolve(addr);
        if let Err(err) = &out {
            if err.unindexed_recoverable() {
                if let Some(hook) = &self.unindexed_hook {
                    if hook(addr) {
                        out = self.try_resolve(addr);
                    }
                }
            }
        }
        match &out {
            Ok(resolved) => diag::bump(match resolved.backend {
                BackendKind::Heap => &diag::HIT_HEAP,
                BackendKind::Stack => &diag::HIT_STACK,
                BackendKind::Static => &diag::HIT_STATIC,
                BackendKind::Mapped => &diag::HIT_MAPPED,
            }),
            Err(err) => {
                match err {
                    Error::StackWalkStepFailure
                    | Error::StackWalkUnexpectedFrame { .. }
                    | Error::StackWalkReachedTop => diag::bump(&diag::ABORTED_STACK),
                    Error::UnindexedHeapObject { .. } => {
                        diag::bump(&diag::ABORTED_UNINDEXED_HEAP)
                    }
                    Error::UnrecognisedAllocSite { .. } => {
                        diag::bump(&diag::ABORTED_UNRECOGNISED_ALLOCSITE)
                    }
                    Error::UnrecognisedStaticObject { .. } => diag::bump(&diag::ABORTED_STATIC),
                    Error::ObjectOfUnknownStorage { .. } => {
                        diag::bump(&diag::ABORTED_UNKNOWN_STORAGE)
                    }
                    _ => {}
                }
                log::warn!("failed to resolve {addr:#x}: {err}");
            }
        }
        out
    }
}
