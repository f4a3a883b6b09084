//! Overlap resolver (component J): a post-walk pass over the function map
//! that eliminates double-counted bytes between adjacent functions while
//! keeping thunks that are wholly swallowed by their caller.

use crate::analyzer::function::{FunctionKind, FunctionMap};

/// Walks the map in ascending entry order. For each function `f1`, scans
/// every later function `f2` it still overlaps (`f1.end > f2.entry`): a
/// thunk fully contained inside `f1` is kept untouched and scanning
/// continues to the entry after it, since a contained thunk doesn't shrink
/// `f1`'s reach; anything else truncates `f1.end` to `f2.entry`, and since
/// entries are sorted by address that rules out any further overlap for
/// `f1`, so the scan stops there. This catches overlaps with functions
/// beyond the immediately next entry, not just adjacent pairs.
pub fn resolve_overlaps(functions: &mut FunctionMap) {
    let entries: Vec<_> = functions.keys().copied().collect();
    for (i, &prev) in entries.iter().enumerate() {
        for &next in &entries[i + 1..] {
            let prev_end = functions[&prev].end;
            if prev_end <= next {
                break;
            }
            let next_end = functions[&next].end;
            let next_kind = functions[&next].kind;
            let contained = next_end <= prev_end;
            if contained && next_kind == FunctionKind::Thunk {
                continue;
            }
            functions.get_mut(&prev).expect("prev key came from this map").end = next;
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::analyzer::function::Function;

    fn func(entry: u64, end: u64, kind: FunctionKind) -> Function {
        Function {
            entry: Address::new(entry),
            end: Address::new(end),
            kind,
            references_in: 0,
        }
    }

    #[test]
    fn contained_thunk_is_kept_and_caller_is_untouched() {
        let mut functions = FunctionMap::new();
        let f1 = func(0x1000, 0x1040, FunctionKind::Standard);
        let f2 = func(0x1020, 0x1030, FunctionKind::Thunk);
        functions.insert(f1.entry, f1);
        functions.insert(f2.entry, f2);

        resolve_overlaps(&mut functions);

        assert_eq!(functions[&Address::new(0x1000)].end, Address::new(0x1040));
        assert_eq!(functions[&Address::new(0x1020)].end, Address::new(0x1030));
    }

    #[test]
    fn overlapping_standard_function_truncates_the_earlier_one() {
        let mut functions = FunctionMap::new();
        let f1 = func(0x1000, 0x1040, FunctionKind::Standard);
        let f2 = func(0x1020, 0x1030, FunctionKind::Standard);
        functions.insert(f1.entry, f1);
        functions.insert(f2.entry, f2);

        resolve_overlaps(&mut functions);

        assert_eq!(functions[&Address::new(0x1000)].end, Address::new(0x1020));
        assert_eq!(functions[&Address::new(0x1020)].end, Address::new(0x1030));
    }

    #[test]
    fn non_overlapping_functions_are_untouched() {
        let mut functions = FunctionMap::new();
        let f1 = func(0x1000, 0x1010, FunctionKind::Standard);
        let f2 = func(0x1010, 0x1020, FunctionKind::Standard);
        functions.insert(f1.entry, f1);
        functions.insert(f2.entry, f2);

        resolve_overlaps(&mut functions);

        assert_eq!(functions[&Address::new(0x1000)].end, Address::new(0x1010));
        assert_eq!(functions[&Address::new(0x1010)].end, Address::new(0x1020));
    }

    #[test]
    fn caller_truncates_against_a_function_beyond_a_contained_thunk() {
        let mut functions = FunctionMap::new();
        let f1 = func(0x1000, 0x1040, FunctionKind::Standard);
        let f2 = func(0x1010, 0x1018, FunctionKind::Thunk);
        let f3 = func(0x1020, 0x1050, FunctionKind::Standard);
        functions.insert(f1.entry, f1);
        functions.insert(f2.entry, f2);
        functions.insert(f3.entry, f3);

        resolve_overlaps(&mut functions);

        assert_eq!(functions[&Address::new(0x1000)].end, Address::new(0x1020));
        assert_eq!(functions[&Address::new(0x1010)].end, Address::new(0x1018));
        assert_eq!(functions[&Address::new(0x1020)].end, Address::new(0x1050));
    }

    #[test]
    fn thunk_that_extends_past_its_caller_is_not_treated_as_contained() {
        let mut functions = FunctionMap::new();
        let f1 = func(0x1000, 0x1010, FunctionKind::Standard);
        let f2 = func(0x1008, 0x1020, FunctionKind::Thunk);
        functions.insert(f1.entry, f1);
        functions.insert(f2.entry, f2);

        resolve_overlaps(&mut functions);

        assert_eq!(functions[&Address::new(0x1000)].end, Address::new(0x1008));
    }
}
