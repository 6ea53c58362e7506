//! Error surface for collector operations.
//!
//! The collector never panics on allocation failure; the offending
//! operation reports one of these variants and leaves the registry in a
//! consistent state.

use thiserror::Error;

/// Failure reported by an allocation-facade operation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The underlying allocator returned null, even after a forced
    /// collection and one retry.
    #[error("underlying allocator out of memory")]
    OutOfMemory,

    /// `num * size` in a zeroed allocation would exceed the address width.
    #[error("allocation size overflows the address width")]
    SizeOverflow,

    /// The pointer passed to `reallocate` is non-null but not managed by
    /// this collector.
    #[error("pointer is not managed by this collector")]
    UnknownPointer,
}
