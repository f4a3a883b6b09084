//! Register view (component B): a fixed, per-architecture register layout
//! with atomic get/set through the OS adapter.
//!
//! A single architecture-tagged snapshot over the 32- and 64-bit GP
//! register layouts, plus segment bases, FP state, and debug registers.

use crate::address::Address;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Arch {
    X86,
    X64,
}

/// General-purpose registers, x86 layout (32-bit target).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GpRegsX86 {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
}

/// General-purpose registers, x86-64 layout (64-bit target).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GpRegsX64 {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub eflags: u64,
    pub cs: u64,
    pub ss: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
    /// May be 0 if the host cannot expose it.
    pub fs_base: u64,
    /// May be 0 if the host cannot expose it.
    pub gs_base: u64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FpRegs {
    pub st_space: [u32; 32],
    pub xmm_space: [u32; 64],
    pub mxcsr: u32,
}

impl Default for FpRegs {
    // `xmm_space` is wider than the array lengths the standard library
    // derives `Default` for, so this is spelled out rather than derived.
    fn default() -> FpRegs {
        FpRegs {
            st_space: [0; 32],
            xmm_space: [0; 64],
            mxcsr: 0,
        }
    }
}

/// Debug registers DR0-DR3 (watchpoint addresses), DR6 (status), DR7
/// (control). DR4/DR5 are aliases of DR6/DR7 on real hardware and are not
/// modeled separately.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DebugRegs {
    pub dr: [u64; 4],
    pub dr6: u64,
    pub dr7: u64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum GpRegsUnion {
    X86(GpRegsX86),
    X64(GpRegsX64),
}

/// A full register bank snapshot, copied by value. Never aliased: callers
/// get an owned copy from `get_state` and hand back an owned copy to
/// `set_state`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RegistersSnapshot {
    arch: Arch,
    gp: GpRegsUnion,
    pub fp: FpRegs,
    pub debug: DebugRegs,
}

impl RegistersSnapshot {
    pub fn zeroed(arch: Arch) -> RegistersSnapshot {
        let gp = match arch {
            Arch::X86 => GpRegsUnion::X86(GpRegsX86::default()),
            Arch::X64 => GpRegsUnion::X64(GpRegsX64::default()),
        };
        RegistersSnapshot {
            arch,
            gp,
            fp: FpRegs::default(),
            debug: DebugRegs::default(),
        }
    }

    pub fn from_x64(gp: GpRegsX64) -> RegistersSnapshot {
        RegistersSnapshot {
            arch: Arch::X64,
            gp: GpRegsUnion::X64(gp),
            fp: FpRegs::default(),
            debug: DebugRegs::default(),
        }
    }

    pub fn from_x86(gp: GpRegsX86) -> RegistersSnapshot {
        RegistersSnapshot {
            arch: Arch::X86,
            gp: GpRegsUnion::X86(gp),
            fp: FpRegs::default(),
            debug: DebugRegs::default(),
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn as_x64(&self) -> Option<&GpRegsX64> {
        match &self.gp {
            GpRegsUnion::X64(r) => Some(r),
            GpRegsUnion::X86(_) => None,
        }
    }

    pub fn as_x64_mut(&mut self) -> Option<&mut GpRegsX64> {
        match &mut self.gp {
            GpRegsUnion::X64(r) => Some(r),
            GpRegsUnion::X86(_) => None,
        }
    }

    pub fn as_x86(&self) -> Option<&GpRegsX86> {
        match &self.gp {
            GpRegsUnion::X86(r) => Some(r),
            GpRegsUnion::X64(_) => None,
        }
    }

    /// Instruction pointer, widened to `Address` regardless of arch.
    pub fn ip(&self) -> Address {
        match &self.gp {
            GpRegsUnion::X86(r) => Address::new(r.eip as u64),
            GpRegsUnion::X64(r) => Address::new(r.rip),
        }
    }

    pub fn set_ip(&mut self, ip: Address) {
        match &mut self.gp {
            GpRegsUnion::X86(r) => r.eip = ip.0 as u32,
            GpRegsUnion::X64(r) => r.rip = ip.0,
        }
    }

    pub fn stack_pointer(&self) -> Address {
        match &self.gp {
            GpRegsUnion::X86(r) => Address::new(r.esp as u64),
            GpRegsUnion::X64(r) => Address::new(r.rsp),
        }
    }

    /// `fs_base`/`gs_base`: 0 on hosts (or architectures) that don't expose
    /// them, per the data model.
    pub fn fs_base(&self) -> u64 {
        match &self.gp {
            GpRegsUnion::X64(r) => r.fs_base,
            GpRegsUnion::X86(_) => 0,
        }
    }

    pub fn gs_base(&self) -> u64 {
        match &self.gp {
            GpRegsUnion::X64(r) => r.gs_base,
            GpRegsUnion::X86(_) => 0,
        }
    }

    /// Equality that excludes segment bases, per the round-trip testable
    /// property: "segment bases may round-trip to 0 and are excluded from
    /// equality".
    pub fn eq_ignoring_segment_bases(&self, other: &RegistersSnapshot) -> bool {
        match (&self.gp, &other.gp) {
            (GpRegsUnion::X64(a), GpRegsUnion::X64(b)) => {
                let mut a = *a;
                let mut b = *b;
                a.fs_base = 0;
                b.fs_base = 0;
                a.gs_base = 0;
                b.gs_base = 0;
                a == b
            }
            (GpRegsUnion::X86(a), GpRegsUnion::X86(b)) => a == b,
            _ => false,
        }
    }
}

/// The capability a register bank exposes: an architecture tag plus atomic
/// get/set. Implemented by the process controller so that callers never
/// need to know whether the bank is backed by ptrace or (in tests) a fake.
pub trait RegisterBank {
    fn arch(&self) -> Arch;
    fn get_state(&self) -> crate::error::Result<RegistersSnapshot>;
    fn set_state(&mut self, regs: &RegistersSnapshot) -> crate::error::Result<()>;
}
