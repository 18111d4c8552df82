//! Runtime type and allocation metadata for a running native process.
//!
//! Given nothing but an address, answer: which allocation owns it, how big
//! is that allocation, what type lives there, and which subobject of that
//! type does the address fall inside?
//!
//! The pieces:
//!
//! - [`meta`]: the type-layout graph and the offset-to-subobject locators
//! - [`alloc`]: per-storage-class backends (heap, stack, statics, mapped
//!   regions) behind one dispatching [`alloc::Registry`]
//! - [`stackwalk`] + [`arch::unwind`]: the frame walk the stack backend
//!   rides on
//! - [`os::maps`]: the address-space map reader
//! - [`diag`]: process-wide hit/abort counters
//!
//! Everything hangs off a [`Runtime`], installed once per process (or built
//! standalone for tests and tools). The free functions at the crate root are
//! the query surface against the installed runtime; they self-initialize via
//! the registered initializer on first use, so no query ever has to assume
//! startup code ran first.

pub mod alloc;
pub mod arch;
pub mod diag;
pub mod error;
pub mod init;
pub mod meta;
pub mod os;
pub mod serialize;
pub mod stackwalk;
pub mod util;

use std::ops::ControlFlow;

use once_cell::sync::OnceCell;

use crate::alloc::{Registry, Resolved};
use crate::error::{Error, Result};
use crate::init::{InitCell, InitState};
use crate::meta::locate::{self, SearchTrail, SpanStep, SubobjectPath};
use crate::meta::{TypeId, TypeTable};

/// The assembled metadata service: one type table, one backend registry.
pub struct Runtime {
    types: TypeTable,
    registry: Registry,
}

impl Runtime {
    pub fn new(types: TypeTable, registry: Registry) -> Self {
        Self { types, registry }
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    /// Resolve an address to its owning allocation.
    pub fn resolve(&self, addr: *const ()) -> Result<Resolved> {
        self.registry.resolve(addr as usize)
    }

    /// The innermost subobject path at `offset` within `root`.
    pub fn locate_subobject_at_offset(
        &self,
        root: TypeId,
        offset: usize,
    ) -> Result<SubobjectPath> {
        locate::locate_subobject_at_offset(&self.types, root, offset)
    }

    /// Whether any subobject of `desired` type starts exactly at `offset`
    /// within `root`.
    pub fn find_subobject_of_type(
        &self,
        root: TypeId,
        offset: usize,
        desired: TypeId,
    ) -> bool {
        let mut trail = SearchTrail::default();
        locate::find_matching_subobject(&self.types, offset, root, Some(desired), &mut trail)
    }

    /// Assert the subobject at `offset` within `root` is `desired`.
    pub fn check_subobject_type(
        &self,
        root: TypeId,
        offset: usize,
        desired: TypeId,
    ) -> Result<()> {
        locate::check_subobject_type(&self.types, root, offset, desired)
    }

    /// Visit every subobject of `root` spanning `offset`, outermost first.
    pub fn walk_subobjects_spanning<B>(
        &self,
        root: TypeId,
        offset: usize,
        visit: &mut impl FnMut(&SpanStep) -> ControlFlow<B>,
    ) -> Option<B> {
        locate::walk_subobjects_spanning(&self.types, root, offset, visit)
    }

    /// Resolve `addr` and descend to the innermost subobject it points into.
    pub fn innermost_type_at(&self, addr: *const ()) -> Result<TypeId> {
        let resolved = self.resolve(addr)?;
        let root = resolved
            .record
            .ty
            .ok_or(Error::UnrecognisedAllocSite { record: resolved.record })?;
        let mut offset = addr as usize - resolved.record.start as usize;
        let size = self.types.max_offset(root);
        if size == 0 {
            return Err(Error::SubobjectNotFound { ty: root, offset });
        }
        // An allocation larger than its attributed type is a run of that
        // type (a heap array, or a mapped region of bytes).
        if offset >= size {
            offset %= size;
        }
        if offset == 0 {
            return Ok(root);
        }
        Ok(self.locate_subobject_at_offset(root, offset)?.innermost())
    }
}

static RUNTIME: InitCell<Runtime> = InitCell::new();
static INITIALIZER: OnceCell<Box<dyn Fn() -> Runtime + Send + Sync>> = OnceCell::new();

/// Register the closure that will build the process-wide [`Runtime`] on
/// first use. Later registrations are ignored; the first one wins.
pub fn set_initializer(init: impl Fn() -> Runtime + Send + Sync + 'static) {
    let _ = INITIALIZER.set(Box::new(init));
}

/// Install `runtime` as the process-wide instance right now. A no-op if one
/// is already installed.
pub fn install(runtime: Runtime) -> &'static Runtime {
    RUNTIME.get_or_init(|| runtime)
}

/// Whether the process-wide runtime is absent, mid-construction, or ready.
pub fn state() -> InitState {
    RUNTIME.state()
}

/// The process-wide runtime, building it via the registered initializer if
/// this is the first use.
pub fn ensure_init() -> Result<&'static Runtime> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    let init = INITIALIZER.get().ok_or(Error::NotInitialized)?;
    Ok(RUNTIME.get_or_init(|| {
        log::debug!("building the process-wide metadata runtime");
        init()
    }))
}

/// Resolve an address against the process-wide runtime.
pub fn resolve(addr: *const ()) -> Result<Resolved> {
    ensure_init()?.resolve(addr)
}

/// The type of the allocation owning `addr`, if attributed.
pub fn alloc_type_of(addr: *const ()) -> Result<Option<TypeId>> {
    Ok(resolve(addr)?.record.ty)
}

/// The extent in bytes of the allocation owning `addr`.
pub fn alloc_size_of(addr: *const ()) -> Result<usize> {
    Ok(resolve(addr)?.record.size)
}

/// The creating site of the allocation owning `addr`, if recorded.
pub fn alloc_site_of(addr: *const ()) -> Result<Option<usize>> {
    Ok(resolve(addr)?.record.site)
}

/// The innermost subobject type at `addr`, per the process-wide runtime.
pub fn innermost_type_at(addr: *const ()) -> Result<TypeId> {
    ensure_init()?.innermost_type_at(addr)
}
