//! The fallback backend: plain mapped regions.
//!
//! Anything no finer-grained backend claims but the address-space map covers
//! resolves to its whole region, typed as an untyped byte run (or nothing at
//! all when no byte type was registered). The region table is cached and
//! refreshed at most once per miss, so a mapping created after the cache was
//! last filled still resolves on first query.

use std::sync::RwLock;

use crate::alloc::{AllocBackend, AllocationRecord, BackendKind};
use crate::error::{Error, Result};
use crate::meta::TypeId;
use crate::os::maps::{MapSource, Region};

pub struct MappedBackend {
    source: Box<dyn MapSource + Send + Sync>,
    regions: RwLock<Vec<Region>>,
    /// The "unsigned char" type records from this backend carry, if one was
    /// registered.
    byte_type: Option<TypeId>,
}

impl MappedBackend {
    pub fn new(source: impl MapSource + Send + Sync + 'static, byte_type: Option<TypeId>) -> Self {
        Self {
            source: Box::new(source),
            regions: RwLock::new(Vec::new()),
            byte_type,
        }
    }

    fn find_cached(&self, addr: usize) -> Option<Region> {
        self.regions
            .read()
            .expect("region cache poisoned")
            .iter()
            .find(|r| r.contains(addr))
            .cloned()
    }

    fn refresh(&self) -> Result<()> {
        let fresh = self.source.snapshot()?;
        *self.regions.write().expect("region cache poisoned") = fresh;
        Ok(())
    }

    /// Cached lookup with one refresh on a cold miss.
    fn find(&self, addr: usize) -> Option<Region> {
        if let Some(r) = self.find_cached(addr) {
            return Some(r);
        }
        if let Err(err) = self.refresh() {
            log::warn!("address-space map refresh failed: {err}");
            return None;
        }
        self.find_cached(addr)
    }
}

impl AllocBackend for MappedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mapped
    }

    fn contains(&self, addr: usize) -> bool {
        self.find(addr).is_some()
    }

    fn resolve(&self, addr: usize) -> Result<AllocationRecord> {
        let region = self
            .find(addr)
            .ok_or(Error::ObjectOfUnknownStorage { addr })?;
        Ok(AllocationRecord {
            start: region.start as *const (),
            size: region.len(),
            ty: self.byte_type,
            site: None,
        })
    }
}
