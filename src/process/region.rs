//! Memory region records (component C's enumeration output).
//!
//! Regions are handed out as cheap, `Clone`-able values rather than through
//! a reference-counted handle: the record is small (two addresses, a base,
//! a short name, three bools) and nothing in this core mutates a `Region`
//! after the OS adapter produces it, so copy semantics satisfy "multiple
//! analyses may hold a region reference while the process is still alive"
//! without a handle table.

use crate::address::Address;
use bitflags::bitflags;

bitflags! {
    #[derive(Default)]
    pub struct Permissions: u8 {
        const READ    = 0b001;
        const WRITE   = 0b010;
        const EXECUTE = 0b100;
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Region {
    /// First byte of the region, inclusive.
    pub start: Address,
    /// One past the last byte of the region (exclusive).
    pub end: Address,
    /// Offset into the backing file/object this region was mapped from, 0
    /// for anonymous mappings.
    pub base: u64,
    /// Backing object name (path, `[heap]`, `[stack]`, empty for anonymous).
    pub name: String,
    pub permissions: Permissions,
}

impl Region {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.end
    }

    pub fn is_executable(&self) -> bool {
        self.permissions.contains(Permissions::EXECUTE)
    }

    pub fn is_writable(&self) -> bool {
        self.permissions.contains(Permissions::WRITE)
    }
}
