//! The error taxonomy for queries.
//!
//! None of these terminate the process; every variant is returned to the
//! caller as a typed result. A few deserve comment:
//!
//! - [`Error::UnindexedHeapObject`] and [`Error::ObjectOfUnknownStorage`] are
//!   the two the registry will try to recover from, once, via the registered
//!   unindexed-address hook.
//! - [`Error::UnrecognisedAllocSite`] carries the partial
//!   [`AllocationRecord`](crate::alloc::AllocationRecord): the bounds are
//!   valid even though no type could be attributed.
//! - [`Error::SubobjectNotFound`] (offset in padding or past the extent) is
//!   deliberately distinct from [`Error::TypeMismatch`] (a subobject exists
//!   there, but it is not the type you asked about).

use thiserror::Error;

use crate::alloc::AllocationRecord;
use crate::meta::TypeId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("stack walk step failure")]
    StackWalkStepFailure,

    #[error("stack walk passed {addr:#x} without finding its frame")]
    StackWalkUnexpectedFrame { addr: usize },

    #[error("stack walk reached top of stack")]
    StackWalkReachedTop,

    #[error("heap chunk containing {addr:#x} has not been indexed")]
    UnindexedHeapObject { addr: usize },

    #[error("no type known for the allocation {record:?}")]
    UnrecognisedAllocSite { record: AllocationRecord },

    #[error("address {addr:#x} is in module {module:?} but matches no static object")]
    UnrecognisedStaticObject { addr: usize, module: String },

    #[error("object at {addr:#x} has unknown storage")]
    ObjectOfUnknownStorage { addr: usize },

    #[error("no subobject of type {ty:?} spans offset {offset}")]
    SubobjectNotFound { ty: TypeId, offset: usize },

    #[error("subobject at the requested offset is {found:?}, not {expected:?}")]
    TypeMismatch { expected: TypeId, found: TypeId },

    #[error("runtime is not installed and no initializer is registered")]
    NotInitialized,

    #[error("reading the address-space map failed: {0}")]
    Maps(#[from] std::io::Error),
}

impl Error {
    /// Whether the registry's one-shot lazy-indexing hook may fix this.
    pub(crate) fn unindexed_recoverable(&self) -> bool {
        matches!(
            self,
            Error::UnindexedHeapObject { .. } | Error::ObjectOfUnknownStorage { .. }
        )
    }
}
