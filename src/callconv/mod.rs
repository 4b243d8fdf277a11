//! Calling conventions.
//!
//! Grounded on `src/Backend/ABI/CallConv.h`: an immutable record describing a
//! named ABI's register files, argument/return slots, stack alignment, and
//! struct-passing rules. The source keeps these in process-wide static storage
//! (§9 design note "Global state: call-conv table"); here that becomes a
//! lazily initialized, const-after-init registry (`once_cell::sync::Lazy`)
//! returning borrowed references, the same shape `raya-engine` uses for its
//! other process-wide tables.

use once_cell::sync::Lazy;

use crate::reg::{gpr, xmm, Reg};

/// Which named ABI a function was compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallConvKind {
    /// System-V-like C ABI (Linux/macOS x86-64).
    C,
    /// Microsoft x64 ABI.
    WindowsX64,
    /// Alias for whichever convention matches the host platform at build time.
    Host,
}

impl CallConvKind {
    /// Resolve `Host` to the concrete convention matching this build's target.
    pub const fn resolve(self) -> CallConvKind {
        match self {
            CallConvKind::Host => {
                if cfg!(target_os = "windows") {
                    CallConvKind::WindowsX64
                } else {
                    CallConvKind::C
                }
            }
            other => other,
        }
    }
}

/// How a struct argument of a given size is passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructArgPassingKind {
    ByValue,
    ByReference,
}

/// Classifier for struct arguments: which sizes fit in registers, whether
/// those registers are integer slots, and whether passing by reference
/// requires the caller to materialize a copy.
#[derive(Debug, Clone, Copy)]
pub struct StructArgPassingInfo {
    /// Bit `i` set means a struct of `i+1` bytes may be passed by value.
    pub pass_by_value_size_mask: u64,
    pub pass_by_value_in_int_slots: bool,
    pub pass_by_reference_needs_copy: bool,
}

/// Classifier for struct return values.
#[derive(Debug, Clone, Copy)]
pub struct StructReturnPassingInfo {
    pub pass_by_value_size_mask: u64,
}

/// A concrete ABI contract consumed by legalization, register allocation, and
/// final encoding.
#[derive(Debug, Clone)]
pub struct CallConv {
    pub name: &'static str,

    pub stack_pointer: Reg,
    pub frame_pointer: Reg,
    pub int_return: Reg,
    pub float_return: Reg,

    pub int_regs: Vec<Reg>,
    pub float_regs: Vec<Reg>,

    pub int_arg_regs: Vec<Reg>,
    pub float_arg_regs: Vec<Reg>,

    pub int_transient_regs: Vec<Reg>,
    pub int_persistent_regs: Vec<Reg>,

    pub float_transient_regs: Vec<Reg>,
    pub float_persistent_regs: Vec<Reg>,

    pub stack_alignment: u32,
    pub stack_param_alignment: u32,
    pub stack_param_slot_size: u32,
    pub stack_shadow_space: u32,
    pub arg_register_slot_count: u32,

    pub struct_arg_passing: StructArgPassingInfo,
    pub struct_return_passing: StructReturnPassingInfo,

    pub stack_red_zone: bool,
}

impl CallConv {
    pub fn num_arg_register_slots(&self) -> u32 {
        self.arg_register_slot_count
    }

    pub fn stack_slot_size(&self) -> u32 {
        self.stack_param_slot_size
    }

    pub fn can_pass_struct_arg_by_value(&self, size_in_bytes: u32) -> bool {
        size_in_bytes >= 1
            && size_in_bytes <= 64
            && (self.struct_arg_passing.pass_by_value_size_mask & (1 << (size_in_bytes - 1))) != 0
    }

    pub fn can_pass_struct_return_by_value(&self, size_in_bytes: u32) -> bool {
        size_in_bytes >= 1
            && size_in_bytes <= 64
            && (self.struct_return_passing.pass_by_value_size_mask & (1 << (size_in_bytes - 1))) != 0
    }

    pub fn classify_struct_arg_passing(&self, size_in_bytes: u32) -> StructArgPassingKind {
        if self.can_pass_struct_arg_by_value(size_in_bytes) {
            StructArgPassingKind::ByValue
        } else {
            StructArgPassingKind::ByReference
        }
    }

    pub fn classify_struct_return_passing(&self, size_in_bytes: u32) -> StructArgPassingKind {
        if self.can_pass_struct_return_by_value(size_in_bytes) {
            StructArgPassingKind::ByValue
        } else {
            StructArgPassingKind::ByReference
        }
    }

    pub fn is_int_arg_reg(&self, reg: Reg) -> bool {
        self.int_arg_regs.contains(&reg)
    }

    pub fn is_int_persistent_reg(&self, reg: Reg) -> bool {
        self.int_persistent_regs.contains(&reg)
    }

    pub fn is_float_persistent_reg(&self, reg: Reg) -> bool {
        self.float_persistent_regs.contains(&reg)
    }

    /// Pick up to two integer scratch registers not in `forbidden`, preferring
    /// transient registers first (they don't need saving around a call the
    /// legalizer didn't know about).
    pub fn try_pick_int_scratch_regs(&self, forbidden: &[Reg]) -> Option<(Reg, Option<Reg>)> {
        let candidates = self
            .int_transient_regs
            .iter()
            .chain(self.int_persistent_regs.iter())
            .filter(|r| !forbidden.contains(r));
        let mut picked = candidates.take(2);
        let first = *picked.next()?;
        let second = picked.next().copied();
        Some((first, second))
    }
}

fn sysv_c() -> CallConv {
    use gpr::*;
    CallConv {
        name: "C",
        stack_pointer: RSP,
        frame_pointer: RBP,
        int_return: RAX,
        float_return: xmm::XMM0,
        int_regs: vec![RAX, RCX, RDX, RBX, RSI, RDI, R8, R9, R10, R11, R12, R13, R14, R15],
        float_regs: vec![
            Reg::float(0),
            Reg::float(1),
            Reg::float(2),
            Reg::float(3),
            Reg::float(4),
            Reg::float(5),
            Reg::float(6),
            Reg::float(7),
        ],
        int_arg_regs: vec![RDI, RSI, RDX, RCX, R8, R9],
        float_arg_regs: (0..8).map(Reg::float).collect(),
        int_transient_regs: vec![RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11],
        int_persistent_regs: vec![RBX, R12, R13, R14, R15],
        float_transient_regs: (0..8).map(Reg::float).collect(),
        float_persistent_regs: vec![],
        stack_alignment: 16,
        stack_param_alignment: 8,
        stack_param_slot_size: 8,
        stack_shadow_space: 0,
        arg_register_slot_count: 6,
        struct_arg_passing: StructArgPassingInfo {
            pass_by_value_size_mask: (1u64 << 16) - 1,
            pass_by_value_in_int_slots: true,
            pass_by_reference_needs_copy: true,
        },
        struct_return_passing: StructReturnPassingInfo {
            pass_by_value_size_mask: (1u64 << 16) - 1,
        },
        stack_red_zone: true,
    }
}

fn windows_x64() -> CallConv {
    use gpr::*;
    CallConv {
        name: "WindowsX64",
        stack_pointer: RSP,
        frame_pointer: RBP,
        int_return: RAX,
        float_return: xmm::XMM0,
        int_regs: vec![RAX, RCX, RDX, RBX, RSI, RDI, R8, R9, R10, R11, R12, R13, R14, R15],
        float_regs: (0..16).map(Reg::float).collect(),
        int_arg_regs: vec![RCX, RDX, R8, R9],
        float_arg_regs: vec![Reg::float(0), Reg::float(1), Reg::float(2), Reg::float(3)],
        int_transient_regs: vec![RAX, RCX, RDX, R8, R9, R10, R11],
        int_persistent_regs: vec![RBX, RDI, RSI, R12, R13, R14, R15],
        float_transient_regs: vec![Reg::float(0), Reg::float(1), Reg::float(2), Reg::float(3), Reg::float(4), Reg::float(5)],
        float_persistent_regs: (6..16).map(Reg::float).collect(),
        stack_alignment: 16,
        stack_param_alignment: 8,
        stack_param_slot_size: 8,
        stack_shadow_space: 32,
        arg_register_slot_count: 4,
        struct_arg_passing: StructArgPassingInfo {
            pass_by_value_size_mask: 0b0000_0000_1011, // 1, 2, 4, 8 bytes only
            pass_by_value_in_int_slots: true,
            pass_by_reference_needs_copy: true,
        },
        struct_return_passing: StructReturnPassingInfo {
            pass_by_value_size_mask: 0b0000_0000_1011,
        },
        stack_red_zone: false,
    }
}

struct CallConvTable {
    c: CallConv,
    windows_x64: CallConv,
}

static TABLE: Lazy<CallConvTable> = Lazy::new(|| CallConvTable {
    c: sysv_c(),
    windows_x64: windows_x64(),
});

impl CallConv {
    /// Look up a predefined calling convention by kind. `Host` resolves to
    /// whichever convention matches the platform this crate was built for.
    pub fn get(kind: CallConvKind) -> &'static CallConv {
        match kind.resolve() {
            CallConvKind::C => &TABLE.c,
            CallConvKind::WindowsX64 => &TABLE.windows_x64,
            CallConvKind::Host => unreachable!("resolve() never returns Host"),
        }
    }

    pub fn host() -> &'static CallConv {
        CallConv::get(CallConvKind::Host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysv_arg_registers_in_order() {
        let cc = CallConv::get(CallConvKind::C);
        assert_eq!(cc.int_arg_regs, vec![gpr::RDI, gpr::RSI, gpr::RDX, gpr::RCX, gpr::R8, gpr::R9]);
        assert_eq!(cc.int_return, gpr::RAX);
        assert!(cc.stack_red_zone);
    }

    #[test]
    fn windows_has_shadow_space_and_no_red_zone() {
        let cc = CallConv::get(CallConvKind::WindowsX64);
        assert_eq!(cc.stack_shadow_space, 32);
        assert!(!cc.stack_red_zone);
        assert_eq!(cc.int_arg_regs.len(), 4);
    }

    #[test]
    fn host_resolves_to_a_concrete_convention() {
        let host = CallConv::host();
        assert!(host.name == "C" || host.name == "WindowsX64");
    }

    #[test]
    fn struct_passing_classification() {
        let cc = CallConv::get(CallConvKind::C);
        assert_eq!(cc.classify_struct_arg_passing(8), StructArgPassingKind::ByValue);
        assert_eq!(cc.classify_struct_arg_passing(64), StructArgPassingKind::ByValue);
        assert_eq!(cc.classify_struct_arg_passing(128), StructArgPassingKind::ByReference);
    }

    #[test]
    fn scratch_pick_avoids_forbidden() {
        let cc = CallConv::get(CallConvKind::C);
        let (a, b) = cc.try_pick_int_scratch_regs(&[gpr::RAX]).unwrap();
        assert_ne!(a, gpr::RAX);
        if let Some(b) = b {
            assert_ne!(b, gpr::RAX);
            assert_ne!(a, b);
        }
    }
}
