//! Memory view (component C): word-granular peek/poke plus the
//! byte-range stitching that sits one layer above the OS adapter's raw
//! transfers, and region enumeration.

use crate::address::{Address, Tid};
use crate::error::Result;
use crate::process::os_adapter::OsAdapter;
use crate::process::region::Region;

/// The word-granular transfer primitive this module stitches into
/// byte ranges. Implemented by `OsAdapter` against a real tracee and by a
/// fake in tests.
pub trait WordIo {
    fn read_word(&self, tid: Tid, address: Address) -> Result<u64>;
    fn write_word(&self, tid: Tid, address: Address, value: u64) -> Result<()>;
}

impl WordIo for OsAdapter {
    fn read_word(&self, tid: Tid, address: Address) -> Result<u64> {
        OsAdapter::read_word(self, tid, address)
    }
    fn write_word(&self, tid: Tid, address: Address, value: u64) -> Result<()> {
        OsAdapter::write_word(self, tid, address, value)
    }
}

/// Reads an arbitrary byte range by stitching whole words, rounding down to
/// the enclosing word at the start and reading one extra trailing word if
/// the range doesn't end on a boundary.
pub fn read_bytes(io: &impl WordIo, tid: Tid, address: Address, len: usize) -> Result<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let aligned_start = address.word_floor();
    let leading_slack = (address - aligned_start) as usize;
    let total = leading_slack + len;
    let word_count = (total + 7) / 8;

    let mut bytes = Vec::with_capacity(word_count * 8);
    let mut cursor = aligned_start;
    for _ in 0..word_count {
        bytes.extend_from_slice(&io.read_word(tid, cursor)?.to_le_bytes());
        cursor = cursor + 8;
    }
    Ok(bytes[leading_slack..leading_slack + len].to_vec())
}

/// Writes an arbitrary byte range. Boundary words that are only partially
/// covered by `data` are read first so the untouched bytes in that word are
/// preserved, then written back whole -- `write_word` always overwrites the
/// entire machine word.
pub fn write_bytes(io: &impl WordIo, tid: Tid, address: Address, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let aligned_start = address.word_floor();
    let leading_slack = (address - aligned_start) as usize;
    let total = leading_slack + data.len();
    let word_count = (total + 7) / 8;

    let mut buf = read_bytes(io, tid, aligned_start, word_count * 8)?;
    buf[leading_slack..leading_slack + data.len()].copy_from_slice(data);

    let mut cursor = aligned_start;
    for chunk in buf.chunks_exact(8) {
        let word = u64::from_le_bytes(chunk.try_into().expect("chunks_exact(8)"));
        io.write_word(tid, cursor, word)?;
        cursor = cursor + 8;
    }
    Ok(())
}

pub fn enumerate_regions(adapter: &OsAdapter, pid: crate::address::Pid) -> Result<Vec<Region>> {
    adapter.enumerate_regions(pid)
}
