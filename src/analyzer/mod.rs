//! The static analyzer: components G (fingerprint), H (seeders), I
//! (walker), J (overlap resolver) and K (cache), composed behind one
//! façade so a host only ever calls `analyze`/`functions`/`category`.

pub mod cache;
#[cfg(feature = "capstone-decoder")]
pub mod capstone_disassembler;
pub mod fingerprint;
pub mod function;
pub mod overlap;
pub mod seeders;
pub mod walker;

#[cfg(feature = "capstone-decoder")]
pub use capstone_disassembler::CapstoneDisassembler;

use crate::address::{Address, Tid};
use crate::collaborators::{BinaryInfoProvider, Disassembler, SymbolProvider};
use crate::config::{DebuggerConfig, SpecifiedFunctions};
use crate::error::Result;
use crate::process::memory;
use crate::process::memory::WordIo;
use crate::process::region::Region;

pub use cache::AnalysisCache;
pub use function::{category_of, AddressCategory, Function, FunctionKind, FunctionMap, RegionAnalysis};

use seeders::SeedContext;
use std::collections::VecDeque;

/// The static analyzer façade. Owns the analysis cache and the handles on
/// the collaborators the seeders need; everything else (the memory
/// transfer primitive, the tid to read through) is supplied per call so
/// this type carries no dependency on the process controller.
pub struct Analyzer<'a> {
    cache: AnalysisCache,
    disassembler: &'a dyn Disassembler,
    binary_info: Option<&'a dyn BinaryInfoProvider>,
    symbols: Option<&'a dyn SymbolProvider>,
    specified: SpecifiedFunctions,
    high_threshold: u32,
    low_threshold: u32,
}

impl<'a> Analyzer<'a> {
    pub fn new(config: &DebuggerConfig, disassembler: &'a dyn Disassembler) -> Analyzer<'a> {
        Analyzer {
            cache: AnalysisCache::new(),
            disassembler,
            binary_info: None,
            symbols: None,
            specified: SpecifiedFunctions::new(),
            high_threshold: config.high_reference_threshold,
            low_threshold: config.low_reference_threshold,
        }
    }

    pub fn set_binary_info(&mut self, provider: &'a dyn BinaryInfoProvider) {
        self.binary_info = Some(provider);
    }

    pub fn set_symbol_provider(&mut self, provider: &'a dyn SymbolProvider) {
        self.symbols = Some(provider);
    }

    pub fn specified_functions_mut(&mut self) -> &mut SpecifiedFunctions {
        &mut self.specified
    }

    /// Runs (or reuses from cache) the full analysis of `region`, reading
    /// its byte image through `io` at `tid`. `is_running` reflects whether
    /// the controller was in `AttachedRunning` at any point while the
    /// bytes behind the image were read; a `true` here forces the result
    /// to be marked `fuzzy` and never served from cache on a later call
    /// with unchanged bytes.
    pub fn analyze(
        &mut self,
        io: &impl WordIo,
        tid: Tid,
        region: &Region,
        is_running: bool,
    ) -> Result<&RegionAnalysis> {
        let md5 = fingerprint::fingerprint_region(io, tid, region)?;
        if self.cache.fresh(region, &md5).is_some() {
            log::debug!("analysis cache hit for region at {}", region.start);
        } else {
            log::debug!("analysis cache miss for region at {}, running full analysis", region.start);
            let image = memory::read_bytes(io, tid, region.start, region.len() as usize)?;
            let functions = self.run_passes(region, &image);
            self.cache.insert(RegionAnalysis {
                region: region.clone(),
                md5,
                functions,
                fuzzy: is_running,
            });
        }
        Ok(self
            .cache
            .get(region)
            .expect("just inserted or confirmed present"))
    }

    fn run_passes(&self, region: &Region, image: &[u8]) -> FunctionMap {
        let mut functions = FunctionMap::new();
        let mut worklist: VecDeque<Address> = VecDeque::new();
        let ctx = SeedContext {
            region,
            specified: &self.specified,
            binary_info: self.binary_info,
            symbols: self.symbols,
            disassembler: self.disassembler,
            memory: image,
        };

        seeders::seed_specified(&ctx, &mut functions, &mut worklist);
        seeders::seed_entry_point(&ctx, &mut functions, &mut worklist);
        seeders::seed_main(&ctx, &mut functions, &mut worklist);
        seeders::seed_symbols(&ctx, &mut functions, &mut worklist);
        seeders::seed_marked(&ctx, &mut functions, &mut worklist);
        seeders::seed_stack_frame(&ctx, &mut functions, &mut worklist);

        let seeds: Vec<Address> = worklist.into_iter().collect();
        log::debug!("{} seeds produced for region at {}", seeds.len(), region.start);
        let mut functions = walker::walk_region(
            region,
            image,
            self.disassembler,
            seeds,
            self.high_threshold,
            self.low_threshold,
        );
        overlap::resolve_overlaps(&mut functions);
        log::debug!("{} functions after overlap resolution", functions.len());
        functions
    }

    /// Runs (or reuses) the analysis and hands back its function map.
    pub fn functions(
        &mut self,
        io: &impl WordIo,
        tid: Tid,
        region: &Region,
        is_running: bool,
    ) -> Result<&FunctionMap> {
        Ok(&self.analyze(io, tid, region, is_running)?.functions)
    }

    /// Classifies `address` against whichever cached [`RegionAnalysis`]
    /// contains it. An address outside every analyzed region, or one that
    /// has never been analyzed, is `NotFunction`.
    pub fn category(&self, address: Address) -> AddressCategory {
        for analysis in self.cache.values() {
            if analysis.region.contains(address) {
                return category_of(&analysis.functions, address);
            }
        }
        AddressCategory::NotFunction
    }

    pub fn invalidate_analysis(&mut self, region: &Region) {
        self.cache.invalidate(region);
    }

    pub fn invalidate_all(&mut self) {
        self.cache.invalidate_all();
    }

    /// Drops any cached analysis of an executable region that contains
    /// `address` -- wired up by the host behind a successful
    /// `ProcessController::write_word`/`write_bytes` call.
    pub fn observe_write(&mut self, address: Address) {
        self.cache.invalidate_containing(address);
    }

    pub fn cached_region_count(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Tid;
    use crate::collaborators::{DecodedInstruction, MnemonicClass};
    use crate::process::region::Permissions;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeWords(RefCell<HashMap<u64, u64>>);

    impl FakeWords {
        fn new() -> FakeWords {
            FakeWords(RefCell::new(HashMap::new()))
        }
    }

    impl WordIo for FakeWords {
        fn read_word(&self, _tid: Tid, address: Address) -> Result<u64> {
            Ok(*self.0.borrow().get(&address.0).unwrap_or(&0))
        }
        fn write_word(&self, _tid: Tid, address: Address, value: u64) -> Result<()> {
            self.0.borrow_mut().insert(address.0, value);
            Ok(())
        }
    }

    struct RetDisassembler;

    impl Disassembler for RetDisassembler {
        fn decode(&self, bytes: &[u8], _address: Address) -> Option<DecodedInstruction> {
            if bytes.is_empty() {
                return None;
            }
            Some(DecodedInstruction {
                class: MnemonicClass::Return,
                length: 1,
                direct_targets: Vec::new(),
            })
        }
    }

    fn region() -> Region {
        Region {
            start: Address::new(0x1000),
            end: Address::new(0x1010),
            base: 0,
            name: String::new(),
            permissions: Permissions::EXECUTE,
        }
    }

    fn write_region_bytes(mem: &FakeWords, region: &Region) {
        let mut cursor = region.start.word_floor();
        while cursor < region.end {
            mem.write_word(Tid(1), cursor, u64::from_le_bytes([0xc3; 8])).unwrap();
            cursor = cursor + 8;
        }
    }

    #[test]
    fn analyze_finds_a_single_byte_function_at_every_specified_address() {
        let mem = FakeWords::new();
        let region = region();
        write_region_bytes(&mem, &region);

        let disassembler = RetDisassembler;
        let config = DebuggerConfig::default();
        let mut analyzer = Analyzer::new(&config, &disassembler);
        analyzer.specified_functions_mut().insert(Address::new(0x1004));

        let functions = analyzer.functions(&mem, Tid(1), &region, false).unwrap();
        assert!(functions.contains_key(&Address::new(0x1004)));
        assert_eq!(functions[&Address::new(0x1004)].end, Address::new(0x1005));
    }

    #[test]
    fn second_analyze_on_unchanged_memory_is_served_from_cache() {
        crate::test_support::init_logging();
        let mem = FakeWords::new();
        let region = region();
        write_region_bytes(&mem, &region);

        let disassembler = RetDisassembler;
        let config = DebuggerConfig::default();
        let mut analyzer = Analyzer::new(&config, &disassembler);
        analyzer.specified_functions_mut().insert(Address::new(0x1004));

        let first = analyzer.analyze(&mem, Tid(1), &region, false).unwrap().clone();
        let second = analyzer.analyze(&mem, Tid(1), &region, false).unwrap().clone();
        assert_eq!(first.functions, second.functions);
        assert_eq!(analyzer.cached_region_count(), 1);
    }

    #[test]
    fn fuzzy_analysis_is_never_served_from_cache() {
        let mem = FakeWords::new();
        let region = region();
        write_region_bytes(&mem, &region);

        let disassembler = RetDisassembler;
        let config = DebuggerConfig::default();
        let mut analyzer = Analyzer::new(&config, &disassembler);
        analyzer.specified_functions_mut().insert(Address::new(0x1004));

        let fuzzy = analyzer.analyze(&mem, Tid(1), &region, true).unwrap();
        assert!(fuzzy.fuzzy);

        // Unchanged bytes, but the prior result was fuzzy: must recompute,
        // not hit. This time the debuggee is stopped, so the result is
        // authoritative and gets cached for real.
        let settled = analyzer.analyze(&mem, Tid(1), &region, false).unwrap();
        assert!(!settled.fuzzy);

        // Now a third call with identical bytes is a genuine cache hit.
        let hit = analyzer.analyze(&mem, Tid(1), &region, false).unwrap();
        assert!(!hit.fuzzy);
        assert_eq!(analyzer.cached_region_count(), 1);
    }

    #[test]
    fn category_reports_not_function_outside_any_analyzed_region() {
        let disassembler = RetDisassembler;
        let config = DebuggerConfig::default();
        let analyzer = Analyzer::new(&config, &disassembler);
        assert_eq!(analyzer.category(Address::new(0x1234)), AddressCategory::NotFunction);
    }

    #[test]
    fn observe_write_drops_only_the_executable_region_containing_the_address() {
        let mem = FakeWords::new();
        let region = region();
        write_region_bytes(&mem, &region);

        let disassembler = RetDisassembler;
        let config = DebuggerConfig::default();
        let mut analyzer = Analyzer::new(&config, &disassembler);
        analyzer.analyze(&mem, Tid(1), &region, false).unwrap();
        assert_eq!(analyzer.cached_region_count(), 1);

        analyzer.observe_write(Address::new(0x1005));
        assert_eq!(analyzer.cached_region_count(), 0);
    }
}
