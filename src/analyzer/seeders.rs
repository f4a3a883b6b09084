//! Heuristic function-entry seeders (component H). Each seeder inserts
//! zero or more candidate entries into the in-progress function map; later
//! walker/overlap passes may promote, extend, or discard them. Seeders run
//! in the fixed order `analyzer::mod` calls them in -- earlier seeds win on
//! a tie of entry address, since `insert_seed` never overwrites an
//! already-present entry.

use crate::address::Address;
use crate::analyzer::function::{Function, FunctionMap};
use crate::collaborators::{BinaryInfoProvider, Disassembler, MnemonicClass, SymbolKind, SymbolProvider};
use crate::config::SpecifiedFunctions;
use crate::process::region::Region;
use std::collections::VecDeque;

/// Everything a seeder needs: the region being analyzed, its byte image
/// (already read once by the caller), and the collaborators that may or
/// may not be wired up by the host.
pub struct SeedContext<'a> {
    pub region: &'a Region,
    pub specified: &'a SpecifiedFunctions,
    pub binary_info: Option<&'a dyn BinaryInfoProvider>,
    pub symbols: Option<&'a dyn SymbolProvider>,
    pub disassembler: &'a dyn Disassembler,
    pub memory: &'a [u8],
}

fn insert_seed(functions: &mut FunctionMap, worklist: &mut VecDeque<Address>, entry: Address) {
    if functions.contains_key(&entry) {
        return;
    }
    functions.insert(entry, Function::new(entry));
    worklist.push_back(entry);
}

/// 1. Specified: every user-curated address that falls inside the region.
pub fn seed_specified(ctx: &SeedContext, functions: &mut FunctionMap, worklist: &mut VecDeque<Address>) {
    for address in ctx.specified.in_range(ctx.region.start, ctx.region.end) {
        insert_seed(functions, worklist, address);
    }
}

/// 2. Entry point: the binary's recorded entry, if it lies in the region.
pub fn seed_entry_point(ctx: &SeedContext, functions: &mut FunctionMap, worklist: &mut VecDeque<Address>) {
    if let Some(entry) = ctx.binary_info.and_then(|info| info.entry_point()) {
        if ctx.region.contains(entry) {
            insert_seed(functions, worklist, entry);
        }
    }
}

/// 3. Main: the entry of the symbol recognized as program `main`.
pub fn seed_main(ctx: &SeedContext, functions: &mut FunctionMap, worklist: &mut VecDeque<Address>) {
    if let Some(main) = ctx.binary_info.and_then(|info| info.main_symbol()) {
        if ctx.region.contains(main) {
            insert_seed(functions, worklist, main);
        }
    }
}

/// 4. Symbols: every function-like symbol inside the region.
pub fn seed_symbols(ctx: &SeedContext, functions: &mut FunctionMap, worklist: &mut VecDeque<Address>) {
    if let Some(symbols) = ctx.symbols {
        for symbol in symbols.lookup_in(ctx.region) {
            if symbol.kind == SymbolKind::Function && ctx.region.contains(symbol.address) {
                insert_seed(functions, worklist, symbol.address);
            }
        }
    }
}

/// 5. Marked: targets of `call rel32` found by scanning raw bytes for the
/// opcode, independent of whether a seed has reached that address yet --
/// the closest x86 analogue of "a known call-to-here pattern".
pub fn seed_marked(ctx: &SeedContext, functions: &mut FunctionMap, worklist: &mut VecDeque<Address>) {
    const CALL_REL32: u8 = 0xe8;
    let bytes = ctx.memory;
    let mut i = 0usize;
    while i + 5 <= bytes.len() {
        if bytes[i] == CALL_REL32 {
            let rel = i32::from_le_bytes([bytes[i + 1], bytes[i + 2], bytes[i + 3], bytes[i + 4]]);
            let call_end = ctx.region.start + (i as u64 + 5);
            let target = Address::new((call_end.0 as i64 + rel as i64) as u64);
            if ctx.region.contains(target) {
                insert_seed(functions, worklist, target);
            }
        }
        i += 1;
    }
}

const PROLOGUE_X64: &[u8] = &[0x55, 0x48, 0x89, 0xe5]; // push rbp; mov rbp, rsp
const PROLOGUE_X86: &[u8] = &[0x55, 0x89, 0xe5]; // push ebp; mov ebp, esp

/// 6. Stack-frame: addresses whose first two decoded instructions are a
/// canonical frame setup, confirmed by the disassembler so a byte sequence
/// that only coincidentally matches the pattern (because it's the tail of
/// some other instruction) is rejected.
pub fn seed_stack_frame(ctx: &SeedContext, functions: &mut FunctionMap, worklist: &mut VecDeque<Address>) {
    let bytes = ctx.memory;
    for pattern in [PROLOGUE_X64, PROLOGUE_X86] {
        let mut offset = 0usize;
        while offset + pattern.len() <= bytes.len() {
            if &bytes[offset..offset + pattern.len()] == pattern {
                if let Some(entry) = confirm_prologue(ctx, bytes, offset, pattern.len()) {
                    insert_seed(functions, worklist, entry);
                }
            }
            offset += 1;
        }
    }
}

fn confirm_prologue(ctx: &SeedContext, bytes: &[u8], offset: usize, pattern_len: usize) -> Option<Address> {
    let entry = ctx.region.start + offset as u64;
    let first = ctx.disassembler.decode(&bytes[offset..], entry)?;
    if first.class != MnemonicClass::Normal || first.length >= pattern_len {
        return None;
    }
    let second_offset = offset + first.length;
    let second_addr = ctx.region.start + second_offset as u64;
    let second = ctx.disassembler.decode(&bytes[second_offset..], second_addr)?;
    if second.class != MnemonicClass::Normal || first.length + second.length != pattern_len {
        return None;
    }
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::DecodedInstruction;
    use std::collections::HashMap;

    fn region() -> Region {
        Region {
            start: Address::new(0x1000),
            end: Address::new(0x2000),
            base: 0,
            name: String::new(),
            permissions: crate::process::region::Permissions::EXECUTE,
        }
    }

    struct FixedDisassembler(HashMap<Address, DecodedInstruction>);

    impl Disassembler for FixedDisassembler {
        fn decode(&self, _bytes: &[u8], address: Address) -> Option<DecodedInstruction> {
            self.0.get(&address).cloned()
        }
    }

    fn normal(length: usize) -> DecodedInstruction {
        DecodedInstruction {
            class: MnemonicClass::Normal,
            length,
            direct_targets: Vec::new(),
        }
    }

    #[test]
    fn seed_specified_only_keeps_addresses_inside_the_region() {
        let region = region();
        let mut specified = SpecifiedFunctions::new();
        specified.insert(Address::new(0x1500));
        specified.insert(Address::new(0x5000));
        let disassembler = FixedDisassembler(HashMap::new());
        let ctx = SeedContext {
            region: &region,
            specified: &specified,
            binary_info: None,
            symbols: None,
            disassembler: &disassembler,
            memory: &[],
        };
        let mut functions = FunctionMap::new();
        let mut worklist = VecDeque::new();
        seed_specified(&ctx, &mut functions, &mut worklist);
        assert_eq!(functions.len(), 1);
        assert!(functions.contains_key(&Address::new(0x1500)));
    }

    #[test]
    fn seed_marked_finds_call_rel32_targets() {
        let region = region();
        // call +0 relative to the end of the 5-byte call instruction at
        // offset 0 lands at region.start + 5.
        let mut bytes = vec![0xe8, 0x00, 0x00, 0x00, 0x00];
        bytes.extend(std::iter::repeat(0x90).take(10));
        let specified = SpecifiedFunctions::new();
        let disassembler = FixedDisassembler(HashMap::new());
        let ctx = SeedContext {
            region: &region,
            specified: &specified,
            binary_info: None,
            symbols: None,
            disassembler: &disassembler,
            memory: &bytes,
        };
        let mut functions = FunctionMap::new();
        let mut worklist = VecDeque::new();
        seed_marked(&ctx, &mut functions, &mut worklist);
        assert!(functions.contains_key(&Address::new(0x1005)));
    }

    #[test]
    fn seed_stack_frame_requires_disassembler_confirmation() {
        let region = region();
        let mut bytes = vec![0x55, 0x48, 0x89, 0xe5];
        bytes.extend(std::iter::repeat(0x90).take(10));
        let specified = SpecifiedFunctions::new();
        let mut table = HashMap::new();
        table.insert(Address::new(0x1000), normal(1));
        table.insert(Address::new(0x1001), normal(3));
        let disassembler = FixedDisassembler(table);
        let ctx = SeedContext {
            region: &region,
            specified: &specified,
            binary_info: None,
            symbols: None,
            disassembler: &disassembler,
            memory: &bytes,
        };
        let mut functions = FunctionMap::new();
        let mut worklist = VecDeque::new();
        seed_stack_frame(&ctx, &mut functions, &mut worklist);
        assert!(functions.contains_key(&Address::new(0x1000)));
    }

    #[test]
    fn seed_stack_frame_rejects_pattern_without_matching_decode_lengths() {
        let region = region();
        let mut bytes = vec![0x55, 0x48, 0x89, 0xe5];
        bytes.extend(std::iter::repeat(0x90).take(10));
        let specified = SpecifiedFunctions::new();
        // Decoder disagrees with the byte pattern's instruction boundary.
        let mut table = HashMap::new();
        table.insert(Address::new(0x1000), normal(2));
        table.insert(Address::new(0x1002), normal(2));
        let disassembler = FixedDisassembler(table);
        let ctx = SeedContext {
            region: &region,
            specified: &specified,
            binary_info: None,
            symbols: None,
            disassembler: &disassembler,
            memory: &bytes,
        };
        let mut functions = FunctionMap::new();
        let mut worklist = VecDeque::new();
        seed_stack_frame(&ctx, &mut functions, &mut worklist);
        assert!(functions.is_empty());
    }
}
