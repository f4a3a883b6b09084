//! Function walker (component I): linear forward decode from each seed,
//! following direct branch/call targets, multi-pass over a worklist ordered
//! high-reference-first so popular targets win at overlap-resolution time.

use crate::address::Address;
use crate::analyzer::function::{Function, FunctionKind, FunctionMap};
use crate::collaborators::{Disassembler, MnemonicClass};
use crate::process::region::Region;
use std::collections::{HashMap, HashSet, VecDeque};

/// Walks every seed in `initial_seeds` (and anything newly discovered along
/// the way) against `image`, the byte contents of `region`. Seeds supplied
/// up front are always walked in the first high-reference sub-pass,
/// regardless of how many call sites point at them -- they come from the
/// heuristic seeders, not from a call site, so a reference-count gate would
/// only ever exclude them.
pub fn walk_region(
    region: &Region,
    image: &[u8],
    disassembler: &dyn Disassembler,
    initial_seeds: Vec<Address>,
    high_threshold: u32,
    low_threshold: u32,
) -> FunctionMap {
    let mut functions: FunctionMap = FunctionMap::new();
    let mut call_refs: HashMap<Address, u32> = HashMap::new();
    let mut worklist: VecDeque<Address> = VecDeque::new();
    let mut walked: HashSet<Address> = HashSet::new();

    for seed in initial_seeds {
        functions.entry(seed).or_insert_with(|| Function::new(seed));
        call_refs.entry(seed).or_insert(u32::MAX);
        worklist.push_back(seed);
    }

    loop {
        let pending: Vec<Address> = worklist
            .drain(..)
            .filter(|addr| !walked.contains(addr))
            .collect();
        if pending.is_empty() {
            break;
        }

        // An address with no `call_refs` entry at all didn't arrive via a
        // counted call site (it's an initial seed, or a back-branch target
        // promoted by `walk_one`) -- the threshold only orders call-counted
        // targets relative to each other, so an uncounted address is always
        // walked, grouped with the high pass.
        let mut high: Vec<Address> = pending
            .iter()
            .copied()
            .filter(|addr| call_refs.get(addr).map_or(true, |&count| count >= high_threshold))
            .collect();
        high.sort();
        let low: Vec<Address> = pending
            .into_iter()
            .filter(|addr| call_refs.get(addr).map_or(false, |&count| count < high_threshold && count >= low_threshold))
            .collect();

        for seed in high.drain(..).chain(low.into_iter()) {
            if !walked.insert(seed) {
                continue;
            }
            walk_one(region, image, disassembler, &mut functions, &mut worklist, &mut call_refs, seed);
        }
    }

    functions
}

fn offset_of(region: &Region, address: Address) -> Option<usize> {
    if address < region.start {
        None
    } else {
        Some((address - region.start) as usize)
    }
}

fn finish(functions: &mut FunctionMap, seed: Address, end: Address, kind: FunctionKind) {
    if let Some(f) = functions.get_mut(&seed) {
        f.end = end;
        f.kind = kind;
    }
}

fn seed_target(functions: &mut FunctionMap, worklist: &mut VecDeque<Address>, target: Address) {
    if !functions.contains_key(&target) {
        functions.insert(target, Function::new(target));
        worklist.push_back(target);
    }
}

fn walk_one(
    region: &Region,
    image: &[u8],
    disassembler: &dyn Disassembler,
    functions: &mut FunctionMap,
    worklist: &mut VecDeque<Address>,
    call_refs: &mut HashMap<Address, u32>,
    seed: Address,
) {
    let mut cursor = seed;
    let mut first_instruction = true;

    loop {
        let offset = match offset_of(region, cursor) {
            Some(offset) if offset < image.len() => offset,
            _ => {
                log::warn!("seed {} walked off the end of its region at {}, abandoning", seed, cursor);
                finish(functions, seed, cursor, FunctionKind::Standard);
                return;
            }
        };
        let decoded = match disassembler.decode(&image[offset..], cursor) {
            Some(d) if d.length > 0 => d,
            _ => {
                log::warn!("decode failed for seed {} at {}, abandoning", seed, cursor);
                finish(functions, seed, cursor, FunctionKind::Standard);
                return;
            }
        };
        log::trace!("{}: {:?} len={}", cursor, decoded.class, decoded.length);
        let next = cursor + decoded.length as u64;

        // Exactly one indirect jump as the function's sole instruction.
        if first_instruction && decoded.class == MnemonicClass::Jump && decoded.direct_targets.is_empty() {
            finish(functions, seed, next, FunctionKind::Thunk);
            return;
        }
        first_instruction = false;

        match decoded.class {
            MnemonicClass::Return | MnemonicClass::Trap => {
                finish(functions, seed, next, FunctionKind::Standard);
                return;
            }
            MnemonicClass::Invalid => {
                finish(functions, seed, cursor, FunctionKind::Standard);
                return;
            }
            MnemonicClass::Call => {
                for &target in &decoded.direct_targets {
                    if region.contains(target) {
                        *call_refs.entry(target).or_insert(0) += 1;
                        seed_target(functions, worklist, target);
                    }
                }
                cursor = next;
            }
            MnemonicClass::Jump if decoded.direct_targets.iter().any(|t| !region.contains(*t)) => {
                finish(functions, seed, next, FunctionKind::Standard);
                return;
            }
            MnemonicClass::Jump | MnemonicClass::CondJump => {
                // A branch to code preceding this seed is promoted to its
                // own function; a branch forward is treated as still part
                // of this one and is not re-seeded.
                for &target in &decoded.direct_targets {
                    if region.contains(target) && target < seed {
                        seed_target(functions, worklist, target);
                    }
                }
                cursor = next;
            }
            MnemonicClass::Normal => {
                cursor = next;
            }
        }
    }
}
