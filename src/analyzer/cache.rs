//! Analysis cache (component K): memoizes a [`RegionAnalysis`] per region,
//! keyed by `region.start`, invalidated on an md5 mismatch or explicitly by
//! the host.

use crate::address::Address;
use crate::analyzer::function::RegionAnalysis;
use crate::process::region::Region;
use std::collections::HashMap;

#[derive(Default)]
pub struct AnalysisCache {
    entries: HashMap<Address, RegionAnalysis>,
}

impl AnalysisCache {
    pub fn new() -> AnalysisCache {
        AnalysisCache::default()
    }

    /// Returns the cached analysis for `region` only if its key is present,
    /// the stored md5 matches `current_md5`, and the stored analysis was
    /// not `fuzzy` -- a fuzzy analysis is never reused, per the design.
    pub fn fresh(&self, region: &Region, current_md5: &[u8; 16]) -> Option<&RegionAnalysis> {
        let cached = self.entries.get(&region.start)?;
        if &cached.md5 == current_md5 && !cached.fuzzy {
            Some(cached)
        } else {
            None
        }
    }

    pub fn insert(&mut self, analysis: RegionAnalysis) {
        self.entries.insert(analysis.region.start, analysis);
    }

    /// Returns whatever is stored for `region.start`, fuzzy or not -- used
    /// right after `insert` to hand back the analysis just computed, which
    /// `fresh` would otherwise refuse to return when it's fuzzy.
    pub fn get(&self, region: &Region) -> Option<&RegionAnalysis> {
        self.entries.get(&region.start)
    }

    pub fn invalidate(&mut self, region: &Region) {
        self.entries.remove(&region.start);
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    /// Drops every cached analysis whose region contains `address` -- the
    /// hook the host wires up behind a write to an executable region.
    pub fn invalidate_containing(&mut self, address: Address) {
        self.entries.retain(|_, analysis| !analysis.region.contains(address));
    }

    pub fn values(&self) -> impl Iterator<Item = &RegionAnalysis> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::function::FunctionMap;
    use crate::process::region::Permissions;

    fn region() -> Region {
        Region {
            start: Address::new(0x1000),
            end: Address::new(0x2000),
            base: 0,
            name: String::new(),
            permissions: Permissions::EXECUTE,
        }
    }

    fn analysis(region: Region, md5: [u8; 16], fuzzy: bool) -> RegionAnalysis {
        RegionAnalysis {
            region,
            md5,
            functions: FunctionMap::new(),
            fuzzy,
        }
    }

    #[test]
    fn miss_on_empty_cache() {
        let cache = AnalysisCache::new();
        assert!(cache.fresh(&region(), &[0u8; 16]).is_none());
    }

    #[test]
    fn hit_when_md5_matches_and_not_fuzzy() {
        let mut cache = AnalysisCache::new();
        cache.insert(analysis(region(), [1u8; 16], false));
        assert!(cache.fresh(&region(), &[1u8; 16]).is_some());
    }

    #[test]
    fn miss_when_md5_differs() {
        let mut cache = AnalysisCache::new();
        cache.insert(analysis(region(), [1u8; 16], false));
        assert!(cache.fresh(&region(), &[2u8; 16]).is_none());
    }

    #[test]
    fn miss_when_cached_entry_is_fuzzy() {
        let mut cache = AnalysisCache::new();
        cache.insert(analysis(region(), [1u8; 16], true));
        assert!(cache.fresh(&region(), &[1u8; 16]).is_none());
    }

    #[test]
    fn invalidate_removes_single_entry() {
        let mut cache = AnalysisCache::new();
        cache.insert(analysis(region(), [1u8; 16], false));
        cache.invalidate(&region());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_containing_only_drops_the_matching_region() {
        let mut cache = AnalysisCache::new();
        cache.insert(analysis(region(), [1u8; 16], false));
        let mut other = region();
        other.start = Address::new(0x5000);
        other.end = Address::new(0x6000);
        cache.insert(analysis(other, [2u8; 16], false));

        cache.invalidate_containing(Address::new(0x1500));

        assert_eq!(cache.len(), 1);
        assert!(cache.fresh(&region(), &[1u8; 16]).is_none());
    }

    #[test]
    fn invalidate_all_clears_every_entry() {
        let mut cache = AnalysisCache::new();
        cache.insert(analysis(region(), [1u8; 16], false));
        let mut other = region();
        other.start = Address::new(0x5000);
        other.end = Address::new(0x6000);
        cache.insert(analysis(other, [2u8; 16], false));
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
