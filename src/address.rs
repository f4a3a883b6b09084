//! Core identifiers shared by every module: debuggee addresses and OS ids.
//!
//! Each is a newtype over a primitage wide enough for the host so that a
//! `Pid` is never accidentally handed to a function expecting a `Tid`, and
//! neither is ever confused with a plain `Address`, even though all three
//! are "just integers" underneath.

use std::fmt;

/// An address in the debuggee's address space.
///
/// Stored as `u64` unconditionally: a 32-bit target's addresses are simply
/// the low 32 bits of the same representation, so the walker and the
/// analyzer don't need to be generic over pointer width.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Address(pub u64);

impl Address {
    pub const fn new(value: u64) -> Address {
        Address(value)
    }

    pub fn checked_add(self, rhs: u64) -> Option<Address> {
        self.0.checked_add(rhs).map(Address)
    }

    /// Rounds down to the start of the machine word (8 bytes) containing
    /// this address.
    pub fn word_floor(self) -> Address {
        Address(self.0 & !7u64)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Address(value)
    }
}

impl std::ops::Add<u64> for Address {
    type Output = Address;
    fn add(self, rhs: u64) -> Address {
        Address(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Sub<Address> for Address {
    type Output = u64;
    fn sub(self, rhs: Address) -> u64 {
        self.0 - rhs.0
    }
}

macro_rules! os_id_newtype {
    ($name:ident) => {
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub libc::pid_t);

        impl $name {
            pub fn raw(self) -> libc::pid_t {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<libc::pid_t> for $name {
            fn from(value: libc::pid_t) -> Self {
                $name(value)
            }
        }
    };
}

// OS-assigned positive integers. A process's principal thread shares the
// numeric value of the pid (tid == pid for the thread group leader).
os_id_newtype!(Pid);
os_id_newtype!(Tid);

impl Pid {
    pub fn as_tid(self) -> Tid {
        Tid(self.0)
    }
}

impl Tid {
    pub fn as_pid(self) -> Pid {
        Pid(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_floor_rounds_down_to_eight_byte_boundary() {
        assert_eq!(Address::new(0x1003).word_floor(), Address::new(0x1000));
        assert_eq!(Address::new(0x1008).word_floor(), Address::new(0x1008));
        assert_eq!(Address::new(0x100f).word_floor(), Address::new(0x1008));
    }

    #[test]
    fn display_is_hex() {
        assert_eq!(format!("{}", Address::new(0x2a)), "0x2a");
    }

    #[test]
    fn pid_tid_share_numeric_value_but_not_type() {
        let pid = Pid(42);
        let tid = pid.as_tid();
        assert_eq!(tid.raw(), 42);
    }
}
