//! The one concrete, always-available [`Disassembler`] implementation: a
//! thin wrapper over `capstone`, the x86/x86-64 decoding crate the rest of
//! this corpus reaches for when it needs to read raw instruction bytes
//! (see the native-FFI tracer in the sibling example pack). Everything
//! else about the disassembler -- a listing widget's preferred mnemonic
//! spelling, an IR, whatever a real GUI host wants -- stays behind the
//! [`Disassembler`] trait; the walker only ever sees this classification.

use crate::address::Address;
use crate::collaborators::{DecodedInstruction, Disassembler, MnemonicClass};
use crate::process::registers::Arch;
use capstone::prelude::*;

/// One indirect-jump-to-no-target instruction the thunk seeder path
/// recognizes without a call-site count: capstone reports it as `Jump`
/// with no direct targets, same as any other indirect jump.
pub struct CapstoneDisassembler {
    cs: Capstone,
}

impl CapstoneDisassembler {
    pub fn new(arch: Arch) -> capstone::CsResult<CapstoneDisassembler> {
        let mode = match arch {
            Arch::X64 => arch::x86::ArchMode::Mode64,
            Arch::X86 => arch::x86::ArchMode::Mode32,
        };
        let cs = Capstone::new().x86().mode(mode).detail(true).build()?;
        Ok(CapstoneDisassembler { cs })
    }

    fn classify(&self, insn: &capstone::Insn, detail: &InsnDetail) -> MnemonicClass {
        let group_names: Vec<_> = detail
            .groups()
            .iter()
            .filter_map(|g| self.cs.group_name(*g))
            .collect();
        let has = |name: &str| group_names.iter().any(|g| g == name);

        if has("int") || has("iret") || insn.mnemonic() == Some("ud2") {
            MnemonicClass::Trap
        } else if has("call") {
            MnemonicClass::Call
        } else if has("ret") {
            MnemonicClass::Return
        } else if has("jump") {
            if has("brajcc") || self.is_conditional_jump(insn.mnemonic().unwrap_or("")) {
                MnemonicClass::CondJump
            } else {
                MnemonicClass::Jump
            }
        } else {
            MnemonicClass::Normal
        }
    }

    fn is_conditional_jump(&self, mnemonic: &str) -> bool {
        mnemonic.starts_with('j') && mnemonic != "jmp"
    }

    fn direct_targets(&self, insn: &capstone::Insn, detail: &InsnDetail) -> Vec<Address> {
        let _ = insn;
        let arch_detail = detail.arch_detail();
        let mut targets = Vec::new();
        for op in arch_detail.operands() {
            // Only direct branches/calls carry an immediate operand at all;
            // an indirect call/jump addresses a register or memory
            // location, which this match never reaches.
            if let arch::ArchOperand::X86Operand(x86_operand) = op {
                if let arch::x86::X86OperandType::Imm(imm) = x86_operand.op_type {
                    targets.push(Address::new(imm as u64));
                }
            }
        }
        targets
    }
}

impl Disassembler for CapstoneDisassembler {
    fn decode(&self, bytes: &[u8], address: Address) -> Option<DecodedInstruction> {
        let insns = self.cs.disasm_count(bytes, address.0, 1).ok()?;
        let insn = insns.iter().next()?;
        let detail = self.cs.insn_detail(insn).ok()?;
        let class = self.classify(insn, &detail);
        let direct_targets = match class {
            MnemonicClass::Call | MnemonicClass::Jump | MnemonicClass::CondJump => {
                self.direct_targets(insn, &detail)
            }
            _ => Vec::new(),
        };
        Some(DecodedInstruction {
            class,
            length: insn.bytes().len(),
            direct_targets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disas() -> CapstoneDisassembler {
        CapstoneDisassembler::new(Arch::X64).expect("capstone x64 engine builds")
    }

    #[test]
    fn decodes_a_ret() {
        let d = disas();
        let decoded = d.decode(&[0xc3], Address::new(0x1000)).unwrap();
        assert_eq!(decoded.class, MnemonicClass::Return);
        assert_eq!(decoded.length, 1);
    }

    #[test]
    fn decodes_a_direct_call_with_its_target() {
        let d = disas();
        // call rel32 to the very next byte after the instruction.
        let bytes = [0xe8, 0x00, 0x00, 0x00, 0x00];
        let decoded = d.decode(&bytes, Address::new(0x1000)).unwrap();
        assert_eq!(decoded.class, MnemonicClass::Call);
        assert_eq!(decoded.length, 5);
        assert_eq!(decoded.direct_targets, vec![Address::new(0x1005)]);
    }

    #[test]
    fn decodes_an_indirect_jump_with_no_direct_targets() {
        let d = disas();
        // jmp rax
        let bytes = [0xff, 0xe0];
        let decoded = d.decode(&bytes, Address::new(0x1000)).unwrap();
        assert_eq!(decoded.class, MnemonicClass::Jump);
        assert!(decoded.direct_targets.is_empty());
    }

    #[test]
    fn empty_input_fails_to_decode() {
        let d = disas();
        assert!(d.decode(&[], Address::new(0x1000)).is_none());
    }

    #[test]
    fn canonical_prologue_decodes_as_two_normal_instructions() {
        let d = disas();
        let bytes = [0x55, 0x48, 0x89, 0xe5];
        let push = d.decode(&bytes[..], Address::new(0x1000)).unwrap();
        assert_eq!(push.class, MnemonicClass::Normal);
        assert_eq!(push.length, 1);
        let mov = d.decode(&bytes[1..], Address::new(0x1001)).unwrap();
        assert_eq!(mov.class, MnemonicClass::Normal);
        assert_eq!(mov.length, 3);
    }
}
