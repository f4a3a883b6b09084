//! Collaborator traits: the seams at which a real GUI host plugs in a
//! disassembler, a symbol table, a breakpoint store, and binary metadata.
//! Every trait here is object-safe and single-purpose so tests can supply a
//! tiny in-memory fake without dragging in a real decoder or symbol reader.

use crate::address::Address;
use crate::process::region::Region;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MnemonicClass {
    Normal,
    Call,
    Jump,
    CondJump,
    Return,
    Trap,
    Invalid,
}

#[derive(Clone, Debug)]
pub struct DecodedInstruction {
    pub class: MnemonicClass,
    pub length: usize,
    /// Targets of direct branches/calls; empty for indirect or non-branch
    /// instructions.
    pub direct_targets: Vec<Address>,
}

/// Decodes a single instruction at `address` from `bytes` (which starts at
/// `address` and may extend past the instruction's end). Returns `None` if
/// `bytes` is too short to contain a full instruction at this position.
pub trait Disassembler {
    fn decode(&self, bytes: &[u8], address: Address) -> Option<DecodedInstruction>;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SymbolKind {
    Function,
    Object,
    Other,
}

#[derive(Clone, Debug)]
pub struct SymbolInfo {
    pub name: String,
    pub address: Address,
    pub size: u64,
    pub kind: SymbolKind,
}

/// A source of symbol-table entries, scoped to a region so a large binary's
/// full table never has to be handed over at once.
pub trait SymbolProvider {
    fn lookup_in(&self, region: &Region) -> Vec<SymbolInfo>;
}

/// Transparent to the process controller: `detach`/`kill` call `clear_all`
/// before issuing their ptrace opcode, and otherwise never touch this.
pub trait BreakpointRegistry {
    fn clear_all(&mut self);
}

/// Static facts about the debuggee binary that the seeders consult.
pub trait BinaryInfoProvider {
    fn entry_point(&self) -> Option<Address>;
    fn main_symbol(&self) -> Option<Address>;
}
