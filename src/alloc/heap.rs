//! Heap chunk identity.
//!
//! Two sources feed the index. [`TracingAlloc`] wraps any [`GlobalAlloc`]
//! and records every live chunk as it is handed out, stashing a small header
//! immediately below the payload so the identity survives even if the index
//! entry is lost. [`HeapIndex::adopt`] goes the other way: given a payload
//! pointer whose header is intact (a chunk created before tracing started,
//! or by a foreign wrapper using the same header discipline), it reads the
//! header back and indexes the chunk after the fact. `adopt` is what the
//! registry's unindexed-address hook is built from.

use std::alloc::{GlobalAlloc, Layout};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use ahash::AHashMap;

use crate::alloc::{AllocBackend, AllocationRecord, BackendKind};
use crate::arch::mem;
use crate::error::{Error, Result};
use crate::meta::TypeId;
use crate::util::hint::cold;
use crate::util::num::round_up;

/// The per-chunk header, stored in the `header_size` bytes directly below
/// the payload.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Requested payload size in bytes.
    pub size: usize,
    /// Allocation-site address, or 0 when none was declared.
    pub site: usize,
}

/// Compute the expanded layout for a request, returning `(layout,
/// header_size)` where `header_size` is the gap between the base of the raw
/// allocation and the payload. The header itself occupies the top
/// `size_of::<ChunkHeader>()` bytes of that gap, so it always sits directly
/// below the payload whatever the alignment.
pub fn layout_with_header(layout: Layout) -> (Layout, usize) {
    let header_size = round_up(
        std::mem::size_of::<ChunkHeader>().max(layout.align()),
        layout.align(),
    );
    // The whole allocation is at least header-aligned so the header words
    // can be read back with aligned loads.
    let align = layout.align().max(std::mem::align_of::<ChunkHeader>());
    let total =
        Layout::from_size_align(header_size + layout.size(), align).expect("layout overflow");
    (total, header_size)
}

/// What the index remembers about one live chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkMeta {
    pub size: usize,
    pub site: Option<usize>,
}

/// The live-chunk index: payload base address -> chunk metadata.
///
/// A `BTreeMap` under an `RwLock` rather than anything cleverer: writes
/// happen on the allocation path where we are already paying for the
/// allocator, reads are the interior-pointer lookups we actually want to be
/// cheap, and `range(..=addr).next_back()` gives those in one ordered probe.
#[derive(Debug)]
pub struct HeapIndex {
    chunks: RwLock<BTreeMap<usize, ChunkMeta>>,
    /// Watermarks bounding every address the index has ever covered.
    lo: AtomicUsize,
    hi: AtomicUsize,
}

impl HeapIndex {
    pub const fn new() -> Self {
        Self {
            chunks: RwLock::new(BTreeMap::new()),
            lo: AtomicUsize::new(usize::MAX),
            hi: AtomicUsize::new(0),
        }
    }

    pub fn record(&self, payload: usize, meta: ChunkMeta) {
        self.lo.fetch_min(payload, Ordering::Relaxed);
        self.hi.fetch_max(payload + meta.size, Ordering::Relaxed);
        self.chunks
            .write()
            .expect("heap index poisoned")
            .insert(payload, meta);
    }

    pub fn forget(&self, payload: usize) {
        self.chunks
            .write()
            .expect("heap index poisoned")
            .remove(&payload);
    }

    /// The chunk spanning `addr`, if indexed. Returns the payload base along
    /// with the metadata so interior pointers resolve to the whole chunk.
    pub fn lookup(&self, addr: usize) -> Option<(usize, ChunkMeta)> {
        let chunks = self.chunks.read().expect("heap index poisoned");
        let (&start, &meta) = chunks.range(..=addr).next_back()?;
        if addr < start + meta.size {
            Some((start, meta))
        } else {
            None
        }
    }

    /// Whether `addr` falls inside the range the heap has ever spanned.
    /// Deliberately coarse: a yes here with no chunk in [`lookup`] means an
    /// unindexed chunk, which is the recoverable case.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.lo.load(Ordering::Relaxed) && addr < self.hi.load(Ordering::Relaxed)
    }

    /// Read the header below `payload` and index the chunk it describes.
    ///
    /// # Safety
    ///
    /// `payload` must point at the payload of a live chunk that was created
    /// with the [`layout_with_header`] discipline, with its header intact.
    pub unsafe fn adopt(&self, payload: *const ()) -> Result<ChunkMeta> {
        let payload = payload as usize;
        let header = payload - std::mem::size_of::<ChunkHeader>();
        let size = mem::usize_load(header as *const usize);
        let site = mem::usize_load((header + std::mem::size_of::<usize>()) as *const usize);
        // A zero-size or address-space-sized "chunk" is a missing header,
        // not a chunk.
        if size == 0 || size > isize::MAX as usize {
            cold(|| ());
            return Err(Error::UnindexedHeapObject { addr: payload });
        }
        let meta = ChunkMeta {
            size,
            site: if site == 0 { None } else { Some(site) },
        };
        self.record(payload, meta);
        Ok(meta)
    }
}

impl Default for HeapIndex {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT_SITE: Cell<usize> = const { Cell::new(0) };
}

/// Run `f` with `site` attributed to every allocation made on this thread.
pub fn with_alloc_site<R>(site: usize, f: impl FnOnce() -> R) -> R {
    let prev = CURRENT_SITE.replace(site);
    let out = f();
    CURRENT_SITE.set(prev);
    out
}

/// A [`GlobalAlloc`] wrapper that records every chunk in a [`HeapIndex`] and
/// writes a [`ChunkHeader`] below each payload.
pub struct TracingAlloc<A> {
    inner: A,
    index: &'static HeapIndex,
}

impl<A> TracingAlloc<A> {
    pub const fn new(inner: A, index: &'static HeapIndex) -> Self {
        Self { inner, index }
    }

    pub fn index(&self) -> &'static HeapIndex {
        self.index
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TracingAlloc<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let (total, header_size) = layout_with_header(layout);
        let base = self.inner.alloc(total);
        if base.is_null() {
            return base;
        }
        let site = CURRENT_SITE.get();
        let header = base.add(header_size - std::mem::size_of::<ChunkHeader>());
        (header as *mut ChunkHeader).write(ChunkHeader { size: layout.size(), site });
        let payload = base.add(header_size);
        self.index.record(
            payload as usize,
            ChunkMeta {
                size: layout.size(),
                site: if site == 0 { None } else { Some(site) },
            },
        );
        payload
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let (total, header_size) = layout_with_header(layout);
        self.index.forget(ptr as usize);
        self.inner.dealloc(ptr.sub(header_size), total);
    }
}

/// Allocation-site address -> type laid out by that site.
#[derive(Clone, Debug, Default)]
pub struct SiteTable {
    sites: AHashMap<usize, TypeId>,
}

impl SiteTable {
    pub fn new() -> Self {
        Self { sites: AHashMap::new() }
    }

    pub fn insert(&mut self, site: usize, ty: TypeId) {
        self.sites.insert(site, ty);
    }

    pub fn get(&self, site: usize) -> Option<TypeId> {
        self.sites.get(&site).copied()
    }
}

/// The heap's [`AllocBackend`]: chunk bounds from the index, type from the
/// site table.
pub struct HeapBackend {
    index: &'static HeapIndex,
    sites: SiteTable,
}

impl HeapBackend {
    pub fn new(index: &'static HeapIndex, sites: SiteTable) -> Self {
        Self { index, sites }
    }
}

impl AllocBackend for HeapBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Heap
    }

    fn contains(&self, addr: usize) -> bool {
        self.index.contains(addr)
    }

    fn resolve(&self, addr: usize) -> Result<AllocationRecord> {
        let (start, meta) = match self.index.lookup(addr) {
            Some(hit) => hit,
            None => {
                cold(|| ());
                return Err(Error::UnindexedHeapObject { addr });
            }
        };
        let record = AllocationRecord {
            start: start as *const (),
            size: meta.size,
            ty: meta.site.and_then(|site| self.sites.get(site)),
            site: meta.site,
        };
        if record.ty.is_none() {
            // Bounds are good even though no type could be attributed; hand
            // the partial record back inside the error.
            return Err(Error::UnrecognisedAllocSite { record });
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::System;

    #[test]
    fn header_sits_directly_below_the_payload() {
        let (total, header_size) = layout_with_header(Layout::from_size_align(24, 8).unwrap());
        assert_eq!(header_size, 16);
        assert_eq!(total.size(), 40);
        assert_eq!(total.align(), 8);

        // Over-aligned requests widen the gap but the header stays adjacent.
        let (total, header_size) = layout_with_header(Layout::from_size_align(64, 64).unwrap());
        assert_eq!(header_size, 64);
        assert_eq!(total.size(), 128);
        assert_eq!(total.align(), 64);
    }

    #[test]
    fn traced_chunks_resolve_from_interior_pointers() {
        static IDX: HeapIndex = HeapIndex::new();
        let alloc = TracingAlloc::new(System, &IDX);
        let layout = Layout::from_size_align(48, 8).unwrap();
        let p = unsafe { alloc.alloc(layout) };
        assert!(!p.is_null());
        let payload = p as usize;

        let (start, meta) = IDX.lookup(payload + 30).unwrap();
        assert_eq!(start, payload);
        assert_eq!(meta.size, 48);
        assert_eq!(meta.site, None);
        assert!(IDX.contains(payload + 47));
        assert!(IDX.lookup(payload + 48).is_none());

        unsafe { alloc.dealloc(p, layout) };
        assert!(IDX.lookup(payload).is_none());
    }

    #[test]
    fn alloc_site_is_attributed_per_thread() {
        static IDX: HeapIndex = HeapIndex::new();
        let alloc = TracingAlloc::new(System, &IDX);
        let layout = Layout::from_size_align(16, 8).unwrap();
        let p = with_alloc_site(0xbeef, || unsafe { alloc.alloc(layout) });
        let (_, meta) = IDX.lookup(p as usize).unwrap();
        assert_eq!(meta.site, Some(0xbeef));

        // The previous site is restored on the way out.
        let q = unsafe { alloc.alloc(layout) };
        let (_, meta) = IDX.lookup(q as usize).unwrap();
        assert_eq!(meta.site, None);

        unsafe { alloc.dealloc(p, layout) };
        unsafe { alloc.dealloc(q, layout) };
    }

    #[test]
    fn adopt_reads_the_header_back() {
        static IDX: HeapIndex = HeapIndex::new();
        static ADOPT_IDX: HeapIndex = HeapIndex::new();
        let alloc = TracingAlloc::new(System, &IDX);
        let layout = Layout::from_size_align(32, 8).unwrap();
        let p = with_alloc_site(0x1234, || unsafe { alloc.alloc(layout) });

        // A second index that never saw the allocation can still adopt it.
        let meta = unsafe { ADOPT_IDX.adopt(p as *const ()) }.unwrap();
        assert_eq!(meta, ChunkMeta { size: 32, site: Some(0x1234) });
        assert_eq!(ADOPT_IDX.lookup(p as usize + 31).unwrap().0, p as usize);

        unsafe { alloc.dealloc(p, layout) };
    }

    #[test]
    fn backend_distinguishes_missing_chunk_from_missing_type() {
        static IDX: HeapIndex = HeapIndex::new();
        let alloc = TracingAlloc::new(System, &IDX);
        let layout = Layout::from_size_align(24, 8).unwrap();
        let typed = with_alloc_site(0x10, || unsafe { alloc.alloc(layout) });
        let untyped = with_alloc_site(0x20, || unsafe { alloc.alloc(layout) });

        let mut table = crate::meta::TypeTable::new();
        let int = table.base("int", 4);
        let mut sites = SiteTable::new();
        sites.insert(0x10, int);
        let backend = HeapBackend::new(&IDX, sites);

        let record = backend.resolve(typed as usize + 4).unwrap();
        assert_eq!(record.start, typed as *const u8 as *const ());
        assert_eq!(record.size, 24);
        assert_eq!(record.ty, Some(int));
        assert_eq!(record.site, Some(0x10));

        match backend.resolve(untyped as usize) {
            Err(Error::UnrecognisedAllocSite { record }) => {
                assert_eq!(record.start, untyped as *const u8 as *const ());
                assert_eq!(record.size, 24);
                assert_eq!(record.ty, None);
                assert_eq!(record.site, Some(0x20));
            }
            other => panic!("expected UnrecognisedAllocSite, got {other:?}"),
        }

        unsafe { alloc.dealloc(typed, layout) };
        unsafe { alloc.dealloc(untyped, layout) };
    }

    #[test]
    fn gaps_between_chunks_are_unindexed_not_unknown() {
        static IDX: HeapIndex = HeapIndex::new();
        IDX.record(0x10000, ChunkMeta { size: 16, site: None });
        IDX.record(0x20000, ChunkMeta { size: 16, site: None });
        let backend = HeapBackend::new(&IDX, SiteTable::new());
        assert!(backend.contains(0x18000));
        assert!(matches!(
            backend.resolve(0x18000),
            Err(Error::UnindexedHeapObject { addr: 0x18000 })
        ));
    }
}
