//! `MicroInstrBuilder`: an append-only sequence of micro-instructions plus a
//! paged operand store.
//!
//! Grounded on `MicroInstructionBuilder.cpp`/`.h` and `MicroEncoder.cpp`: one
//! method per micro-op, each total (these never fail; conformance rewriting
//! happens later, in legalization). `encode_jump`-style methods record the
//! jump's `offsetStart` as the instruction index at the moment of emission,
//! matching the source's `jump.offsetStart = instructions_.size() * sizeof(MicroInstruction)`
//! bookkeeping, just instruction-indexed instead of byte-indexed since the
//! IR has no byte offsets yet.

use crate::callconv::CallConvKind;
use crate::micro::instr::{MicroInstr, MicroInstrKind};
use crate::micro::operand::{EmitFlags, JumpToken, NameRef, Operand};
use crate::micro::symbol::{SymbolKind, SymbolTable};
use crate::reg::{Cond, CondJump, Op, OpBits, Reg};

/// Where a forward jump's offsetStart currently points, and whether it has
/// since been patched to a concrete destination.
#[derive(Debug, Clone, Copy)]
pub struct JumpRecord {
    pub instr_index: u32,
    pub resolved: bool,
}

#[derive(Debug, Default)]
pub struct MicroInstrBuilder {
    instrs: Vec<MicroInstr>,
    operands: Vec<Operand>,
    jumps: Vec<JumpRecord>,
    pub symbols: SymbolTable,
}

impl MicroInstrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instructions(&self) -> &[MicroInstr] {
        &self.instrs
    }

    pub fn operand_store(&self) -> &[Operand] {
        &self.operands
    }

    pub fn jump_record(&self, token: JumpToken) -> JumpRecord {
        self.jumps[token.0 as usize]
    }

    /// Re-emits an already-shaped instruction verbatim. Used by passes that
    /// rebuild the instruction stream (legalization) rather than append to
    /// one under construction by a frontend.
    pub(crate) fn copy_through(
        &mut self,
        kind: MicroInstrKind,
        flags: EmitFlags,
        operands: &[Operand],
    ) -> crate::error::CodegenResult<()> {
        self.push(kind, flags, operands);
        Ok(())
    }

    /// Rewrites `PatchJump`/`PatchJumpTo` destination operands and jump
    /// records through `index_map` (old instruction index -> new instruction
    /// index). Called after a rebuilding pass that may have inserted
    /// instructions ahead of a branch target.
    pub(crate) fn remap_patch_targets(&mut self, index_map: &[u32]) {
        for instr in self.instrs.iter() {
            if matches!(
                instr.kind,
                MicroInstrKind::PatchJump | MicroInstrKind::PatchJumpTo
            ) {
                let start = instr.operand_start as usize;
                if let Operand::ImmU32(old_dest) = self.operands[start + 1] {
                    self.operands[start + 1] = Operand::ImmU32(index_map[old_dest as usize]);
                }
            }
        }
        for jump in self.jumps.iter_mut() {
            jump.instr_index = index_map[jump.instr_index as usize];
        }
    }

    fn push(&mut self, kind: MicroInstrKind, flags: EmitFlags, operands: &[Operand]) {
        debug_assert_eq!(
            operands.len(),
            kind.arity(),
            "operand count mismatch for {kind:?}"
        );
        let start = self.operands.len() as u32;
        self.operands.extend_from_slice(operands);
        self.instrs.push(MicroInstr {
            kind,
            flags,
            operand_start: start,
            operand_count: operands.len() as u8,
        });
    }

    pub fn nop(&mut self) {
        self.push(MicroInstrKind::Nop, EmitFlags::ZERO, &[]);
    }

    pub fn ret(&mut self) {
        self.push(MicroInstrKind::Ret, EmitFlags::ZERO, &[]);
    }

    pub fn push_reg(&mut self, reg: Reg) {
        self.push(MicroInstrKind::Push, EmitFlags::ZERO, &[Operand::Reg(reg)]);
    }

    pub fn pop_reg(&mut self, reg: Reg) {
        self.push(MicroInstrKind::Pop, EmitFlags::ZERO, &[Operand::Reg(reg)]);
    }

    pub fn call_local(&mut self, name: &str, call_conv: CallConvKind) {
        let name_ref = self.symbols.intern(name);
        self.symbols.get_or_add_symbol(name, SymbolKind::Function);
        self.push(
            MicroInstrKind::CallLocal,
            EmitFlags::ZERO,
            &[Operand::Name(name_ref), Operand::CallConv(call_conv)],
        );
    }

    pub fn call_extern(&mut self, name: &str, call_conv: CallConvKind) {
        let name_ref = self.symbols.intern(name);
        self.symbols.get_or_add_symbol(name, SymbolKind::Extern);
        self.push(
            MicroInstrKind::CallExtern,
            EmitFlags::ZERO,
            &[Operand::Name(name_ref), Operand::CallConv(call_conv)],
        );
    }

    pub fn call_reg(&mut self, target: Reg, call_conv: CallConvKind) {
        self.push(
            MicroInstrKind::CallReg,
            EmitFlags::ZERO,
            &[Operand::Reg(target), Operand::CallConv(call_conv)],
        );
    }

    /// Emits a conditional (or, with `CondJump::Unconditional`, unconditional)
    /// branch to a not-yet-known destination and returns a token identifying
    /// it for later patching.
    pub fn jump_cond(&mut self, cond: CondJump) -> JumpToken {
        let token = JumpToken(self.jumps.len() as u32);
        let instr_index = self.instrs.len() as u32;
        self.jumps.push(JumpRecord {
            instr_index,
            resolved: false,
        });
        self.push(
            MicroInstrKind::JumpCond,
            EmitFlags::ZERO,
            &[Operand::CondJump(cond), Operand::Jump(token)],
        );
        token
    }

    pub fn jump(&mut self) -> JumpToken {
        self.jump_cond(CondJump::Unconditional)
    }

    /// Patches `token` to branch to the instruction stream's current tail
    /// (the next instruction emitted after this call).
    pub fn patch_jump(&mut self, token: JumpToken) {
        self.jumps[token.0 as usize].resolved = true;
        self.push(
            MicroInstrKind::PatchJump,
            EmitFlags::ZERO,
            &[Operand::Jump(token), Operand::ImmU32(self.instrs.len() as u32)],
        );
    }

    /// Patches `token` to branch to an explicit, already-known instruction
    /// index (used for backward branches, e.g. loop headers).
    pub fn patch_jump_to(&mut self, token: JumpToken, destination_instr: u32) {
        self.jumps[token.0 as usize].resolved = true;
        self.push(
            MicroInstrKind::PatchJumpTo,
            EmitFlags::ZERO,
            &[Operand::Jump(token), Operand::ImmU32(destination_instr)],
        );
    }

    pub fn jump_reg(&mut self, target: Reg) {
        self.push(MicroInstrKind::JumpReg, EmitFlags::ZERO, &[Operand::Reg(target)]);
    }

    pub fn load_reg_reg(&mut self, dst: Reg, src: Reg, width: OpBits) {
        self.push(
            MicroInstrKind::LoadRegReg,
            EmitFlags::ZERO,
            &[Operand::Reg(dst), Operand::Reg(src), Operand::Width(width)],
        );
    }

    pub fn load_reg_imm(&mut self, dst: Reg, width: OpBits, value: u64) {
        let flags = if width == OpBits::B64 {
            EmitFlags::B64
        } else {
            EmitFlags::ZERO
        };
        self.push(
            MicroInstrKind::LoadRegImm,
            flags,
            &[Operand::Reg(dst), Operand::Width(width), Operand::ImmU64(value)],
        );
    }

    pub fn load_reg_mem(&mut self, dst: Reg, base: Reg, offset: i32, width: OpBits) {
        self.push(
            MicroInstrKind::LoadRegMem,
            EmitFlags::ZERO,
            &[
                Operand::Reg(dst),
                Operand::Reg(base),
                Operand::ImmI32(offset),
                Operand::Width(width),
            ],
        );
    }

    pub fn load_sign_ext_reg_reg(&mut self, dst: Reg, src: Reg, dst_width: OpBits, src_width: OpBits) {
        self.push(
            MicroInstrKind::LoadSignExtRegReg,
            EmitFlags::ZERO,
            &[
                Operand::Reg(dst),
                Operand::Reg(src),
                Operand::Width(dst_width),
                Operand::Width(src_width),
            ],
        );
    }

    pub fn load_sign_ext_reg_mem(
        &mut self,
        dst: Reg,
        base: Reg,
        offset: i32,
        dst_width: OpBits,
        src_width: OpBits,
    ) {
        self.push(
            MicroInstrKind::LoadSignExtRegMem,
            EmitFlags::ZERO,
            &[
                Operand::Reg(dst),
                Operand::Reg(base),
                Operand::ImmI32(offset),
                Operand::Width(dst_width),
                Operand::Width(src_width),
            ],
        );
    }

    pub fn load_zero_ext_reg_reg(&mut self, dst: Reg, src: Reg, dst_width: OpBits, src_width: OpBits) {
        self.push(
            MicroInstrKind::LoadZeroExtRegReg,
            EmitFlags::ZERO,
            &[
                Operand::Reg(dst),
                Operand::Reg(src),
                Operand::Width(dst_width),
                Operand::Width(src_width),
            ],
        );
    }

    pub fn load_zero_ext_reg_mem(
        &mut self,
        dst: Reg,
        base: Reg,
        offset: i32,
        dst_width: OpBits,
        src_width: OpBits,
    ) {
        self.push(
            MicroInstrKind::LoadZeroExtRegMem,
            EmitFlags::ZERO,
            &[
                Operand::Reg(dst),
                Operand::Reg(base),
                Operand::ImmI32(offset),
                Operand::Width(dst_width),
                Operand::Width(src_width),
            ],
        );
    }

    pub fn load_addr_reg_mem(&mut self, dst: Reg, base: Reg, offset: i32, width: OpBits) {
        self.push(
            MicroInstrKind::LoadAddrRegMem,
            EmitFlags::ZERO,
            &[
                Operand::Reg(dst),
                Operand::Reg(base),
                Operand::ImmI32(offset),
                Operand::Width(width),
            ],
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn load_amc_reg_mem(
        &mut self,
        dst: Reg,
        base: Reg,
        index: Reg,
        scale: u32,
        offset: i32,
        width: OpBits,
    ) {
        self.push(
            MicroInstrKind::LoadAmcRegMem,
            EmitFlags::ZERO,
            &[
                Operand::Reg(dst),
                Operand::Reg(base),
                Operand::Reg(index),
                Operand::ImmU32(scale),
                Operand::ImmI32(offset),
                Operand::Width(width),
            ],
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn load_amc_mem_reg(
        &mut self,
        base: Reg,
        index: Reg,
        scale: u32,
        offset: i32,
        src: Reg,
        width: OpBits,
    ) {
        self.push(
            MicroInstrKind::LoadAmcMemReg,
            EmitFlags::ZERO,
            &[
                Operand::Reg(base),
                Operand::Reg(index),
                Operand::ImmU32(scale),
                Operand::ImmI32(offset),
                Operand::Reg(src),
                Operand::Width(width),
            ],
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn load_amc_mem_imm(
        &mut self,
        base: Reg,
        index: Reg,
        scale: u32,
        offset: i32,
        value: u64,
        width: OpBits,
    ) {
        self.push(
            MicroInstrKind::LoadAmcMemImm,
            EmitFlags::ZERO,
            &[
                Operand::Reg(base),
                Operand::Reg(index),
                Operand::ImmU32(scale),
                Operand::ImmI32(offset),
                Operand::ImmU64(value),
                Operand::Width(width),
            ],
        );
    }

    pub fn load_addr_amc_reg_mem(&mut self, dst: Reg, base: Reg, index: Reg, scale: u32, offset: i32) {
        self.push(
            MicroInstrKind::LoadAddrAmcRegMem,
            EmitFlags::ZERO,
            &[
                Operand::Reg(dst),
                Operand::Reg(base),
                Operand::Reg(index),
                Operand::ImmU32(scale),
                Operand::ImmI32(offset),
            ],
        );
    }

    pub fn load_mem_reg(&mut self, base: Reg, offset: i32, src: Reg, width: OpBits) {
        self.push(
            MicroInstrKind::LoadMemReg,
            EmitFlags::ZERO,
            &[
                Operand::Reg(base),
                Operand::ImmI32(offset),
                Operand::Reg(src),
                Operand::Width(width),
            ],
        );
    }

    pub fn load_mem_imm(&mut self, base: Reg, offset: i32, value: u64, width: OpBits) {
        self.push(
            MicroInstrKind::LoadMemImm,
            EmitFlags::ZERO,
            &[
                Operand::Reg(base),
                Operand::ImmI32(offset),
                Operand::ImmU64(value),
                Operand::Width(width),
            ],
        );
    }

    pub fn cmp_reg_reg(&mut self, lhs: Reg, rhs: Reg, width: OpBits) {
        self.push(
            MicroInstrKind::CmpRegReg,
            EmitFlags::ZERO,
            &[Operand::Reg(lhs), Operand::Reg(rhs), Operand::Width(width)],
        );
    }

    pub fn cmp_mem_reg(&mut self, base: Reg, offset: i32, rhs: Reg, width: OpBits) {
        self.push(
            MicroInstrKind::CmpMemReg,
            EmitFlags::ZERO,
            &[
                Operand::Reg(base),
                Operand::ImmI32(offset),
                Operand::Reg(rhs),
                Operand::Width(width),
            ],
        );
    }

    pub fn cmp_mem_imm(&mut self, base: Reg, offset: i32, value: u64, width: OpBits) {
        self.push(
            MicroInstrKind::CmpMemImm,
            EmitFlags::ZERO,
            &[
                Operand::Reg(base),
                Operand::ImmI32(offset),
                Operand::ImmU64(value),
                Operand::Width(width),
            ],
        );
    }

    pub fn cmp_reg_imm(&mut self, lhs: Reg, value: u64, width: OpBits) {
        self.push(
            MicroInstrKind::CmpRegImm,
            EmitFlags::ZERO,
            &[Operand::Reg(lhs), Operand::ImmU64(value), Operand::Width(width)],
        );
    }

    pub fn set_cond_reg(&mut self, dst: Reg, cond: Cond) {
        self.push(
            MicroInstrKind::SetCondReg,
            EmitFlags::ZERO,
            &[Operand::Reg(dst), Operand::Cond(cond)],
        );
    }

    pub fn load_cond_reg_reg(&mut self, dst: Reg, src: Reg, cond: Cond, width: OpBits) {
        self.push(
            MicroInstrKind::LoadCondRegReg,
            EmitFlags::ZERO,
            &[Operand::Reg(dst), Operand::Reg(src), Operand::Cond(cond), Operand::Width(width)],
        );
    }

    pub fn clear_reg(&mut self, dst: Reg, width: OpBits) {
        self.push(
            MicroInstrKind::ClearReg,
            EmitFlags::ZERO,
            &[Operand::Reg(dst), Operand::Width(width)],
        );
    }

    pub fn op_unary_reg(&mut self, op: Op, dst: Reg, width: OpBits) {
        self.push(
            MicroInstrKind::OpUnaryReg,
            EmitFlags::ZERO,
            &[Operand::OpKind(op), Operand::Reg(dst), Operand::Width(width)],
        );
    }

    pub fn op_unary_mem(&mut self, op: Op, base: Reg, offset: i32, width: OpBits) {
        self.push(
            MicroInstrKind::OpUnaryMem,
            EmitFlags::ZERO,
            &[
                Operand::OpKind(op),
                Operand::Reg(base),
                Operand::ImmI32(offset),
                Operand::Width(width),
            ],
        );
    }

    pub fn op_binary_reg_reg(&mut self, op: Op, dst: Reg, rhs: Reg, width: OpBits) {
        self.push(
            MicroInstrKind::OpBinaryRegReg,
            EmitFlags::ZERO,
            &[Operand::OpKind(op), Operand::Reg(dst), Operand::Reg(rhs), Operand::Width(width)],
        );
    }

    pub fn op_binary_reg_mem(&mut self, op: Op, dst: Reg, base: Reg, offset: i32, width: OpBits) {
        self.push(
            MicroInstrKind::OpBinaryRegMem,
            EmitFlags::ZERO,
            &[
                Operand::OpKind(op),
                Operand::Reg(dst),
                Operand::Reg(base),
                Operand::ImmI32(offset),
                Operand::Width(width),
            ],
        );
    }

    pub fn op_binary_mem_reg(&mut self, op: Op, base: Reg, offset: i32, rhs: Reg, width: OpBits) {
        self.push(
            MicroInstrKind::OpBinaryMemReg,
            EmitFlags::ZERO,
            &[
                Operand::OpKind(op),
                Operand::Reg(base),
                Operand::ImmI32(offset),
                Operand::Reg(rhs),
                Operand::Width(width),
            ],
        );
    }

    pub fn op_binary_reg_imm(&mut self, op: Op, dst: Reg, value: u64, width: OpBits) {
        let flags = if op.needs_overflow_flag() {
            EmitFlags::OVERFLOW
        } else {
            EmitFlags::ZERO
        };
        self.push(
            MicroInstrKind::OpBinaryRegImm,
            flags,
            &[Operand::OpKind(op), Operand::Reg(dst), Operand::ImmU64(value), Operand::Width(width)],
        );
    }

    pub fn op_binary_mem_imm(&mut self, op: Op, base: Reg, offset: i32, value: u64, width: OpBits) {
        self.push(
            MicroInstrKind::OpBinaryMemImm,
            EmitFlags::ZERO,
            &[
                Operand::OpKind(op),
                Operand::Reg(base),
                Operand::ImmI32(offset),
                Operand::ImmU64(value),
                Operand::Width(width),
            ],
        );
    }

    pub fn op_ternary_reg_reg_reg(&mut self, op: Op, dst: Reg, lhs: Reg, rhs: Reg, width: OpBits) {
        self.push(
            MicroInstrKind::OpTernaryRegRegReg,
            EmitFlags::ZERO,
            &[
                Operand::OpKind(op),
                Operand::Reg(dst),
                Operand::Reg(lhs),
                Operand::Reg(rhs),
                Operand::Width(width),
            ],
        );
    }

    /// Like `op_ternary_reg_reg_reg`, but marks the instruction for a `lock`
    /// prefix: the only current use is `Op::CompareExchange` against memory,
    /// where atomicity across threads is the entire point of the instruction.
    pub fn op_ternary_reg_reg_reg_locked(&mut self, op: Op, dst: Reg, lhs: Reg, rhs: Reg, width: OpBits) {
        self.push(
            MicroInstrKind::OpTernaryRegRegReg,
            EmitFlags::LOCK,
            &[
                Operand::OpKind(op),
                Operand::Reg(dst),
                Operand::Reg(lhs),
                Operand::Reg(rhs),
                Operand::Width(width),
            ],
        );
    }

    pub fn load_symbol_reloc_address(&mut self, dst: Reg, name: &str, kind: SymbolKind) -> NameRef {
        let name_ref = self.symbols.intern(name);
        self.symbols.get_or_add_symbol(name, kind);
        self.push(
            MicroInstrKind::LoadSymbolRelocAddress,
            EmitFlags::ZERO,
            &[Operand::Reg(dst), Operand::Name(name_ref)],
        );
        name_ref
    }

    pub fn load_sym_reloc_value(&mut self, dst: Reg, name: &str, kind: SymbolKind, width: OpBits) -> NameRef {
        let name_ref = self.symbols.intern(name);
        self.symbols.get_or_add_symbol(name, kind);
        self.push(
            MicroInstrKind::LoadSymRelocValue,
            EmitFlags::ZERO,
            &[Operand::Reg(dst), Operand::Name(name_ref), Operand::Width(width)],
        );
        name_ref
    }
}

impl Op {
    /// Whether this op's register-immediate form needs the overflow flag
    /// tracked (used by `ClampImmediate`/conformance rewriting later).
    pub const fn needs_overflow_flag(self) -> bool {
        matches!(self, Op::Add | Op::Sub | Op::MultiplySigned | Op::MultiplyUnsigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::gpr;

    #[test]
    fn forward_jump_records_then_resolves() {
        let mut b = MicroInstrBuilder::new();
        let token = b.jump_cond(CondJump::Zero);
        b.nop();
        b.patch_jump(token);
        assert!(b.jump_record(token).resolved);
    }

    #[test]
    fn call_local_interns_symbol() {
        let mut b = MicroInstrBuilder::new();
        b.call_local("foo", CallConvKind::C);
        assert_eq!(b.symbols.symbols().len(), 1);
        assert_eq!(b.symbols.name(b.symbols.symbols()[0].name), "foo");
    }

    #[test]
    fn instruction_operand_spans_are_correct() {
        let mut b = MicroInstrBuilder::new();
        b.load_reg_imm(gpr::RAX, OpBits::B64, 42);
        b.load_reg_reg(gpr::RCX, gpr::RAX, OpBits::B32);
        let store = b.operand_store();
        let instrs = b.instructions();
        assert_eq!(instrs[0].operands(store)[0].as_reg(), gpr::RAX);
        assert_eq!(instrs[1].operands(store)[1].as_reg(), gpr::RAX);
    }

    #[test]
    fn b64_immediate_load_sets_b64_flag() {
        let mut b = MicroInstrBuilder::new();
        b.load_reg_imm(gpr::RAX, OpBits::B64, u64::MAX);
        assert!(b.instructions()[0].flags.contains(EmitFlags::B64));
    }
}
