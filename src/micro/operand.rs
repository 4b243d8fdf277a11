//! The tagged operand union.
//!
//! Grounded on §9's design note "Tagged operand union": the source uses a
//! C-style union over register/immediate/width/condition-code per operand
//! slot. Here that becomes a tagged sum type; each micro-instruction carries a
//! small fixed-capacity (<=8) slice of these, positionally interpreted by
//! `MicroInstrKind`.

use crate::callconv::CallConvKind;
use crate::reg::{Cond, CondJump, Op, OpBits, Reg};

/// Index of an interned symbol name (see `crate::micro::symbol::SymbolTable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameRef(pub u32);

/// Opaque handle for a forward jump, produced by `jump_cond`/`jump_uncond` and
/// consumed by `patch_jump`. The encoder resolves it via a side map
/// `id -> (code_offset, width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JumpToken(pub u32);

#[derive(Debug, Clone, Copy)]
pub enum Operand {
    None,
    Reg(Reg),
    ImmU64(u64),
    ImmI32(i32),
    ImmU32(u32),
    Width(OpBits),
    Cond(Cond),
    CondJump(CondJump),
    OpKind(Op),
    CallConv(CallConvKind),
    Name(NameRef),
    Jump(JumpToken),
}

impl Operand {
    pub fn as_reg(&self) -> Reg {
        match self {
            Operand::Reg(r) => *r,
            other => panic!("expected Reg operand, found {other:?}"),
        }
    }

    pub fn as_width(&self) -> OpBits {
        match self {
            Operand::Width(w) => *w,
            other => panic!("expected Width operand, found {other:?}"),
        }
    }

    pub fn as_u64(&self) -> u64 {
        match self {
            Operand::ImmU64(v) => *v,
            Operand::ImmU32(v) => *v as u64,
            Operand::ImmI32(v) => *v as u64,
            other => panic!("expected immediate operand, found {other:?}"),
        }
    }

    pub fn as_op_kind(&self) -> Op {
        match self {
            Operand::OpKind(op) => *op,
            other => panic!("expected OpKind operand, found {other:?}"),
        }
    }

    pub fn as_cond(&self) -> Cond {
        match self {
            Operand::Cond(c) => *c,
            other => panic!("expected Cond operand, found {other:?}"),
        }
    }

    pub fn as_cond_jump(&self) -> CondJump {
        match self {
            Operand::CondJump(c) => *c,
            other => panic!("expected CondJump operand, found {other:?}"),
        }
    }

    pub fn as_call_conv(&self) -> CallConvKind {
        match self {
            Operand::CallConv(cc) => *cc,
            other => panic!("expected CallConv operand, found {other:?}"),
        }
    }

    pub fn as_name(&self) -> NameRef {
        match self {
            Operand::Name(n) => *n,
            other => panic!("expected Name operand, found {other:?}"),
        }
    }

    pub fn as_jump(&self) -> JumpToken {
        match self {
            Operand::Jump(j) => *j,
            other => panic!("expected Jump operand, found {other:?}"),
        }
    }

    pub fn is_reg(&self) -> bool {
        matches!(self, Operand::Reg(_))
    }
}

impl std::fmt::Debug for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::None => write!(f, "-"),
            Operand::Reg(r) => write!(f, "{r:?}"),
            Operand::ImmU64(v) => write!(f, "#{v:#x}"),
            Operand::ImmI32(v) => write!(f, "#{v}"),
            Operand::ImmU32(v) => write!(f, "#{v}"),
            Operand::Width(w) => write!(f, "{w:?}"),
            Operand::Cond(c) => write!(f, "{c:?}"),
            Operand::CondJump(c) => write!(f, "{c:?}"),
            Operand::OpKind(o) => write!(f, "{o:?}"),
            Operand::CallConv(cc) => write!(f, "{cc:?}"),
            Operand::Name(n) => write!(f, "sym#{}", n.0),
            Operand::Jump(j) => write!(f, "jump#{}", j.0),
        }
    }
}

/// Emission flag bitset, mirroring `EmitFlagsE` from `Encoder.h`.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EmitFlags(u8);

impl EmitFlags {
    pub const ZERO: EmitFlags = EmitFlags(0);
    pub const OVERFLOW: EmitFlags = EmitFlags(1 << 0);
    pub const LOCK: EmitFlags = EmitFlags(1 << 1);
    pub const B64: EmitFlags = EmitFlags(1 << 2);
    pub const CAN_ENCODE: EmitFlags = EmitFlags(1 << 3);

    pub const fn contains(self, other: EmitFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: EmitFlags) -> EmitFlags {
        EmitFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for EmitFlags {
    type Output = EmitFlags;
    fn bitor(self, rhs: EmitFlags) -> EmitFlags {
        self.union(rhs)
    }
}

impl std::fmt::Debug for EmitFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.contains(EmitFlags::OVERFLOW) {
            names.push("Overflow");
        }
        if self.contains(EmitFlags::LOCK) {
            names.push("Lock");
        }
        if self.contains(EmitFlags::B64) {
            names.push("B64");
        }
        if self.contains(EmitFlags::CAN_ENCODE) {
            names.push("CanEncode");
        }
        if names.is_empty() {
            write!(f, "Zero")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_flags_union_and_contains() {
        let flags = EmitFlags::LOCK | EmitFlags::B64;
        assert!(flags.contains(EmitFlags::LOCK));
        assert!(flags.contains(EmitFlags::B64));
        assert!(!flags.contains(EmitFlags::OVERFLOW));
    }

    #[test]
    fn emit_flags_zero_is_empty() {
        assert_eq!(format!("{:?}", EmitFlags::ZERO), "Zero");
    }
}
