/*!
Abstraction over an address on the introspected system.
*/

use std::fmt;
use std::ops;

/// A physical or virtual address on the introspected system.
///
/// Internally holds a `u64` and is also used when analyzing 32-bit targets.
/// This type will not handle overflow for 32-bit or 64-bit addresses.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Address(u64);

impl From<u32> for Address {
    fn from(item: u32) -> Self {
        Self(u64::from(item))
    }
}

impl From<u64> for Address {
    fn from(item: u64) -> Self {
        Self(item)
    }
}

impl From<usize> for Address {
    fn from(item: usize) -> Self {
        Self(item as u64)
    }
}

impl Address {
    /// An address with the value of zero.
    pub const NULL: Address = Address(0);

    /// An address with an invalid value.
    ///
    /// Matches the acquisition backend's invalid-address sentinel (`!0`).
    pub const INVALID: Address = Address(!0);

    #[inline]
    pub const fn null() -> Self {
        Address::NULL
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != !0
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Aligns the address down to the containing 4 KiB page.
    #[inline]
    pub const fn page_align(self) -> Address {
        Address(self.0 & !0xfff)
    }

    /// Byte offset of the address within its 4 KiB page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        (self.0 & 0xfff) as usize
    }

    /// The page number of the address (`addr >> 12`).
    #[inline]
    pub const fn page_number(self) -> u64 {
        self.0 >> 12
    }
}

impl Default for Address {
    fn default() -> Self {
        Address::NULL
    }
}

impl ops::Add<u64> for Address {
    type Output = Address;

    fn add(self, other: u64) -> Address {
        Address(self.0.wrapping_add(other))
    }
}

impl ops::Add<usize> for Address {
    type Output = Address;

    fn add(self, other: usize) -> Address {
        Address(self.0.wrapping_add(other as u64))
    }
}

impl ops::AddAssign<u64> for Address {
    fn add_assign(&mut self, other: u64) {
        self.0 = self.0.wrapping_add(other);
    }
}

impl ops::Sub for Address {
    type Output = u64;

    fn sub(self, other: Address) -> u64 {
        self.0.wrapping_sub(other.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::UpperHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
