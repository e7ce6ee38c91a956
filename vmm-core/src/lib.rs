/*!
vmm-core is the memory-introspection engine at the heart of a live
memory analysis tool.

It treats a physical memory image behind an acquisition device as the
ground truth and reconstructs the virtual address spaces of the
processes observed in it. The engine owns the hard parts: a three-table
bounded page cache with LRU eviction, the scatter read/write pipeline
with speculative prefetching, a generationally refreshed process table
and a worker pool for parallel per-process enumeration.

The operating-system parsers, the per-architecture page-table walkers
(an x64 walker ships built in), the acquisition backend and the symbol
resolver are collaborators behind the [`map::OsPlugin`],
[`model::MemoryModel`] and [`mem::MemDevice`] traits.
*/

#[macro_use]
extern crate bitflags;

pub mod error;
#[doc(hidden)]
pub use error::*;

pub mod types;
#[doc(hidden)]
pub use types::*;

pub mod mem;
#[doc(hidden)]
pub use mem::*;

pub mod model;
#[doc(hidden)]
pub use model::*;

pub mod process;
#[doc(hidden)]
pub use process::*;

pub mod map;
#[doc(hidden)]
pub use map::*;

pub mod work;
#[doc(hidden)]
pub use work::*;

pub mod vmm;
#[doc(hidden)]
pub use vmm::*;

#[cfg(any(test, feature = "dummy_mem"))]
pub mod dummy;

#[cfg(test)]
mod tests;
