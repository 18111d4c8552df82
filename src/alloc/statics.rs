//! Static object identity: per-module tables of file-scope objects, built at
//! registration time from each module's symbol facts.

use crate::alloc::{AllocBackend, AllocationRecord, BackendKind};
use crate::error::{Error, Result};
use crate::meta::TypeId;

/// One file-scope object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticObject {
    pub start: usize,
    pub size: usize,
    pub ty: TypeId,
    pub name: String,
}

/// Every described static object of one loaded module, sorted by address.
#[derive(Clone, Debug)]
pub struct ModuleStatics {
    pub name: String,
    /// `[start, end)` of the module's static data in the address space.
    pub start: usize,
    pub end: usize,
    objects: Vec<StaticObject>,
}

impl ModuleStatics {
    pub fn new(name: &str, start: usize, end: usize, mut objects: Vec<StaticObject>) -> Self {
        objects.sort_by_key(|o| o.start);
        Self { name: name.to_owned(), start, end, objects }
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    fn lookup(&self, addr: usize) -> Option<&StaticObject> {
        let idx = self.objects.partition_point(|o| o.start <= addr);
        let o = self.objects.get(idx.checked_sub(1)?)?;
        (addr < o.start + o.size).then_some(o)
    }
}

/// The statics [`AllocBackend`].
#[derive(Default)]
pub struct StaticBackend {
    modules: Vec<ModuleStatics>,
}

impl StaticBackend {
    pub fn new(modules: Vec<ModuleStatics>) -> Self {
        Self { modules }
    }

    pub fn push(&mut self, module: ModuleStatics) {
        self.modules.push(module);
    }
}

impl AllocBackend for StaticBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Static
    }

    fn contains(&self, addr: usize) -> bool {
        self.modules.iter().any(|m| m.contains(addr))
    }

    fn resolve(&self, addr: usize) -> Result<AllocationRecord> {
        let module = self
            .modules
            .iter()
            .find(|m| m.contains(addr))
            .ok_or(Error::ObjectOfUnknownStorage { addr })?;
        match module.lookup(addr) {
            Some(o) => Ok(AllocationRecord {
                start: o.start as *const (),
                size: o.size,
                ty: Some(o.ty),
                site: Some(o.start),
            }),
            // In the module's data but between described objects: padding,
            // or a symbol the metadata never covered.
            None => Err(Error::UnrecognisedStaticObject {
                addr,
                module: module.name.clone(),
            }),
        }
    }
}
