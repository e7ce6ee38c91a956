/*!
Contract of the acquisition backend providing raw physical memory access.
*/

use super::scatter::MemScatter;
use crate::types::Address;

/// The acquisition backend the engine reads and writes physical memory
/// through (a live DMA device, a memory dump, an emulator bridge, ...).
///
/// Implementations must tolerate concurrent scatter calls from multiple
/// threads; the engine shares a single device handle across its worker
/// pool and arbitrary caller threads.
///
/// Contract per unit:
/// - a unit that is already valid on entry, or whose address is invalid
///   ([`Address::INVALID`]), must be left untouched,
/// - a completed unit has its buffer filled (reads) or consumed (writes)
///   and `valid` set to `true`,
/// - a failed unit keeps `valid == false`; buffer contents are undefined.
pub trait MemDevice: Send + Sync {
    /// Reads a batch of scatter units in one round-trip.
    fn read_scatter(&self, mems: &mut [&mut MemScatter<'_>]);

    /// Writes a batch of scatter units in one round-trip.
    fn write_scatter(&self, mems: &mut [&mut MemScatter<'_>]);

    /// Highest physical address (exclusive) backed by the device.
    fn pa_max(&self) -> Address;
}
