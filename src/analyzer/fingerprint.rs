//! Region fingerprint (component G): a content-addressed cache key, not a
//! security primitive. MD5 is used here purely because it is fast and
//! ubiquitous -- nothing in this crate treats it as collision-resistant.

use crate::address::Tid;
use crate::error::Result;
use crate::process::memory::WordIo;
use crate::process::region::Region;
use md5::{Digest, Md5};

/// Hashes the byte image of `region`, read word-at-a-time through the
/// memory view rather than as one contiguous buffer, so the same transfer
/// primitive backs both the fingerprint and the actual disassembly image.
pub fn fingerprint_region(io: &impl WordIo, tid: Tid, region: &Region) -> Result<[u8; 16]> {
    let mut hasher = Md5::new();
    let mut cursor = region.start.word_floor();
    while cursor < region.end {
        let word = io.read_word(tid, cursor)?;
        hasher.update(word.to_le_bytes());
        cursor = cursor + 8;
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeWords(RefCell<HashMap<u64, u64>>);

    impl WordIo for FakeWords {
        fn read_word(&self, _tid: Tid, address: crate::address::Address) -> Result<u64> {
            Ok(*self.0.borrow().get(&address.0).unwrap_or(&0))
        }
        fn write_word(&self, _tid: Tid, address: crate::address::Address, value: u64) -> Result<()> {
            self.0.borrow_mut().insert(address.0, value);
            Ok(())
        }
    }

    #[test]
    fn same_bytes_hash_identically_and_changed_bytes_do_not() {
        let mem = FakeWords(RefCell::new(HashMap::new()));
        mem.write_word(Tid(1), Address::new(0x1000), 0xdead_beef).unwrap();
        let region = Region {
            start: Address::new(0x1000),
            end: Address::new(0x1008),
            base: 0,
            name: String::new(),
            permissions: crate::process::region::Permissions::EXECUTE,
        };
        let first = fingerprint_region(&mem, Tid(1), &region).unwrap();
        let second = fingerprint_region(&mem, Tid(1), &region).unwrap();
        assert_eq!(first, second);

        mem.write_word(Tid(1), Address::new(0x1000), 0xcafe_babe).unwrap();
        let third = fingerprint_region(&mem, Tid(1), &region).unwrap();
        assert_ne!(first, third);
    }
}
