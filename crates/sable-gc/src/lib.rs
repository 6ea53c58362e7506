//! # Sable GC
//!
//! Conservative, thread-local, mark-and-sweep garbage collector.
//!
//! ## Design
//!
//! - **Conservative roots**: the thread's stack (and optional registered
//!   static ranges) is scanned word-by-word; any aligned word that
//!   bit-identically equals the start address of a managed allocation
//!   keeps it alive. Interior pointers do not.
//! - **Pointer registry**: a Robin-Hood open-addressing hash table keyed
//!   by allocation address holds size, flags, and destructor for every
//!   managed block; deletion is backward-shift, so no tombstones.
//! - **Two-color mark/sweep**: reachable entries get a transient mark
//!   bit; sweep frees the rest, running destructors before the memory
//!   goes back to the underlying allocator.
//! - **Thread-local**: one collector serves one thread. No locks, no
//!   safepoints; collection runs synchronously from allocation calls
//!   once the live count crosses a load-derived threshold.
//!
//! ## Usage
//!
//! ```no_run
//! use sable_gc::{flags, Collector};
//!
//! fn workload(gc: &mut Collector) {
//!     let buf = gc.allocate(256).unwrap();
//!     gc.set_flags(buf, flags::LEAF);
//!     // ... buf stays live while a stack word holds its address ...
//!     gc.run();
//! }
//!
//! let stack_hint = 0usize;
//! let mut gc = unsafe { Collector::new(&stack_hint as *const usize as *const u8) };
//! workload(&mut gc);
//! gc.stop();
//! ```
//!
//! The `stack_hint` contract matters: the hint must come from a frame
//! shallower than every frame that stores managed pointers, otherwise
//! those pointers fall outside the scanned window.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod allocator;
pub mod collector;
pub mod config;
pub mod error;
pub mod registry;

pub use allocator::{RawAlloc, SystemAlloc};
pub use collector::{Collector, Dtor, GcStats};
pub use config::GcConfig;
pub use error::AllocError;
pub use registry::flags;
