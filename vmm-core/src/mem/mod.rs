/*!
Memory access: the acquisition device contract, the scatter unit, the
page caches and both sides of the scatter pipeline.
*/

pub mod cache;
pub use cache::{CachePage, CacheTable, CacheTag, PageReserve};

pub mod device;
pub use device::MemDevice;

pub mod scatter;
pub use scatter::{MemScatter, ScatterBuf};

mod phys;
mod tlb;
mod virt;
