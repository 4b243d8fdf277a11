//! Legalization: rewrites operand shapes the encoder cannot emit directly
//! into equivalent shapes it can, without ever removing or reordering an
//! instruction.
//!
//! Grounded on the source's conformance-issue-driven legalizer (queried per
//! instruction before encoding) and on `MicroEncoder.cpp`'s handling of
//! 64-bit immediates, which x86-64 cannot encode directly into most
//! instruction forms.

use crate::error::{CodegenError, CodegenResult, ControlFlow};
use crate::micro::{MicroInstr, MicroInstrBuilder, MicroInstrKind, Operand};
use crate::pass::PassContext;
use crate::reg::{OpBits, Reg};

/// A conformance problem the target encoder cannot emit as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConformanceIssue {
    /// An immediate operand doesn't fit the instruction's encodable range
    /// (e.g. a 64-bit value where only imm32 is encodable) and must be
    /// materialized into a scratch register first.
    ClampImmediate,
    /// `OpBits::Zero` (unset width) must default to 32 bits before encoding.
    NormalizeOpBits,
    /// A 64-bit immediate store to memory has no direct x86-64 form; split
    /// into load-immediate-to-scratch then store-scratch-to-memory.
    SplitLoadMemImm64,
    /// Same as `SplitLoadMemImm64` but for address-mode-compute memory
    /// operands (base + index*scale + offset).
    SplitLoadAmcMemImm64,
    /// Floating-point registers have no immediate-load form; materialize the
    /// bit pattern in an integer scratch register and move it across.
    RewriteLoadFloatRegImm,
}

/// Diagnoses conformance issues for a given instruction shape. The x86-64
/// encoder implements this; legalization is deliberately decoupled from any
/// one target so a future second backend could supply its own rules.
pub trait ConformanceOracle {
    fn query(&self, kind: MicroInstrKind, operands: &[Operand]) -> Option<ConformanceIssue>;
}

/// A conformance oracle capturing the rules this crate's sole target (x86-64)
/// needs. Kept separate from `encoder::x64` so the legalizer can be unit
/// tested without constructing a full encoder.
#[derive(Debug, Default)]
pub struct X64ConformanceOracle;

const IMM32_MIN: i64 = i32::MIN as i64;
const IMM32_MAX: i64 = i32::MAX as i64;

impl ConformanceOracle for X64ConformanceOracle {
    fn query(&self, kind: MicroInstrKind, operands: &[Operand]) -> Option<ConformanceIssue> {
        use MicroInstrKind::*;

        let width_operand = operands.iter().rev().find_map(|op| match op {
            Operand::Width(w) => Some(*w),
            _ => None,
        });
        if width_operand == Some(OpBits::Zero) {
            return Some(ConformanceIssue::NormalizeOpBits);
        }

        match kind {
            LoadMemImm => {
                let value = operands[2].as_u64();
                let width = operands[3].as_width();
                if width == OpBits::B64 && !fits_imm32(value) {
                    return Some(ConformanceIssue::SplitLoadMemImm64);
                }
            }
            LoadAmcMemImm => {
                let value = operands[4].as_u64();
                let width = operands[5].as_width();
                if width == OpBits::B64 && !fits_imm32(value) {
                    return Some(ConformanceIssue::SplitLoadAmcMemImm64);
                }
            }
            OpBinaryRegImm | OpBinaryMemImm | CmpRegImm | CmpMemImm => {
                let value = match kind {
                    OpBinaryRegImm | OpBinaryMemImm => operands[operands.len() - 2].as_u64(),
                    CmpRegImm => operands[1].as_u64(),
                    _ => operands[2].as_u64(),
                };
                if !fits_imm32(value) {
                    return Some(ConformanceIssue::ClampImmediate);
                }
            }
            LoadRegImm => {
                let dst = operands[0].as_reg();
                if dst.is_float() {
                    return Some(ConformanceIssue::RewriteLoadFloatRegImm);
                }
            }
            _ => {}
        }
        None
    }
}

fn fits_imm32(value: u64) -> bool {
    let signed = value as i64;
    (IMM32_MIN..=IMM32_MAX).contains(&signed)
}

/// Integer scratch register the legalizer borrows to split an unencodable
/// immediate. R11 is transient in every calling convention this crate knows
/// about and is never used as an argument register, so it's always free at
/// any point the allocator has already assigned real values elsewhere.
const SCRATCH: Reg = crate::reg::gpr::R11;

pub struct LegalizePass {
    oracle: X64ConformanceOracle,
}

impl LegalizePass {
    pub fn new() -> Self {
        Self {
            oracle: X64ConformanceOracle,
        }
    }

    /// Rebuilds `builder` in place: walks the existing instruction stream in
    /// order, copying each instruction through (possibly preceded by scratch
    /// setup instructions) into a fresh builder, then swaps it in. Jump
    /// destinations recorded as instruction indices are remapped to account
    /// for any instructions inserted ahead of them.
    pub fn run(&self, builder: &mut MicroInstrBuilder, _ctx: &PassContext) -> CodegenResult<ControlFlow> {
        let old_instrs: Vec<MicroInstr> = builder.instructions().to_vec();
        let old_operands = builder.operand_store().to_vec();

        let mut rebuilt = MicroInstrBuilder::new();
        rebuilt.symbols = std::mem::take(&mut builder.symbols);

        // old instruction index -> new instruction index where it starts.
        let mut index_map = vec![0u32; old_instrs.len() + 1];

        for (i, instr) in old_instrs.iter().enumerate() {
            index_map[i] = rebuilt.instructions().len() as u32;
            let ops = instr.operands(&old_operands);
            let issue = self.oracle.query(instr.kind, ops);
            self.emit_legalized(&mut rebuilt, instr.kind, instr.flags, ops, issue)?;
        }
        index_map[old_instrs.len()] = rebuilt.instructions().len() as u32;

        rebuilt.remap_patch_targets(&index_map);

        *builder = rebuilt;
        Ok(ControlFlow::Continue)
    }

    fn emit_legalized(
        &self,
        out: &mut MicroInstrBuilder,
        kind: MicroInstrKind,
        flags: crate::micro::EmitFlags,
        ops: &[Operand],
        issue: Option<ConformanceIssue>,
    ) -> CodegenResult<()> {
        match issue {
            None => out.copy_through(kind, flags, ops),
            Some(ConformanceIssue::NormalizeOpBits) => {
                let normalized: Vec<Operand> = ops
                    .iter()
                    .map(|op| match op {
                        Operand::Width(OpBits::Zero) => Operand::Width(OpBits::B32),
                        other => *other,
                    })
                    .collect();
                out.copy_through(kind, flags, &normalized);
                Ok(())
            }
            Some(ConformanceIssue::ClampImmediate) => {
                // Materialize the oversized immediate in the scratch register,
                // then rewrite the instruction to use it instead.
                let value = ops
                    .iter()
                    .find_map(|op| match op {
                        Operand::ImmU64(v) => Some(*v),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        CodegenError::LegalizationFailed("ClampImmediate without immediate operand".into())
                    })?;
                out.load_reg_imm(SCRATCH, OpBits::B64, value);
                let rewritten: Vec<Operand> = ops
                    .iter()
                    .map(|op| match op {
                        Operand::ImmU64(_) => Operand::Reg(SCRATCH),
                        other => *other,
                    })
                    .collect();
                let reg_kind = match kind {
                    MicroInstrKind::OpBinaryRegImm => MicroInstrKind::OpBinaryRegReg,
                    MicroInstrKind::OpBinaryMemImm => MicroInstrKind::OpBinaryMemReg,
                    MicroInstrKind::CmpRegImm => MicroInstrKind::CmpRegReg,
                    MicroInstrKind::CmpMemImm => MicroInstrKind::CmpMemReg,
                    other => other,
                };
                out.copy_through(reg_kind, flags, &rewritten);
                Ok(())
            }
            Some(ConformanceIssue::SplitLoadMemImm64) => {
                let base = ops[0].as_reg();
                let offset = ops[1].as_u64() as i32;
                let value = ops[2].as_u64();
                out.load_reg_imm(SCRATCH, OpBits::B64, value);
                out.load_mem_reg(base, offset, SCRATCH, OpBits::B64);
                Ok(())
            }
            Some(ConformanceIssue::SplitLoadAmcMemImm64) => {
                let base = ops[0].as_reg();
                let index = ops[1].as_reg();
                let scale = ops[2].as_u64() as u32;
                let offset = ops[3].as_u64() as i32;
                let value = ops[4].as_u64();
                out.load_reg_imm(SCRATCH, OpBits::B64, value);
                out.load_amc_mem_reg(base, index, scale, offset, SCRATCH, OpBits::B64);
                Ok(())
            }
            Some(ConformanceIssue::RewriteLoadFloatRegImm) => {
                let dst = ops[0].as_reg();
                let width = ops[1].as_width();
                let value = ops[2].as_u64();
                let int_scratch = Reg::int(SCRATCH.index());
                out.load_reg_imm(int_scratch, OpBits::B64, value);
                // movq/movd xmm, gpr: a cross-class register move, left to the
                // encoder to pick the right opcode based on destination class.
                out.load_reg_reg(dst, int_scratch, width);
                Ok(())
            }
        }
    }
}

impl Default for LegalizePass {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callconv::CallConvKind;
    use crate::reg::gpr;

    #[test]
    fn normalizes_zero_width_to_32_bits() {
        let mut b = MicroInstrBuilder::new();
        b.load_reg_reg(gpr::RAX, gpr::RCX, OpBits::Zero);
        let ctx = PassContext::new(CallConvKind::C);
        LegalizePass::new().run(&mut b, &ctx).unwrap();
        let store = b.operand_store();
        let width = b.instructions()[0].operands(store)[2].as_width();
        assert_eq!(width, OpBits::B32);
    }

    #[test]
    fn clamps_oversized_register_immediate() {
        let mut b = MicroInstrBuilder::new();
        b.op_binary_reg_imm(crate::reg::Op::Add, gpr::RAX, u64::MAX, OpBits::B64);
        let ctx = PassContext::new(CallConvKind::C);
        LegalizePass::new().run(&mut b, &ctx).unwrap();
        // Expect: load-immediate-to-scratch, then a reg-reg op.
        assert_eq!(b.instructions().len(), 2);
        assert_eq!(b.instructions()[1].kind, MicroInstrKind::OpBinaryRegReg);
    }

    #[test]
    fn splits_64_bit_memory_immediate_store() {
        let mut b = MicroInstrBuilder::new();
        b.load_mem_imm(gpr::RBP, -8, u64::MAX, OpBits::B64);
        let ctx = PassContext::new(CallConvKind::C);
        LegalizePass::new().run(&mut b, &ctx).unwrap();
        assert_eq!(b.instructions().len(), 2);
        assert_eq!(b.instructions()[0].kind, MicroInstrKind::LoadRegImm);
        assert_eq!(b.instructions()[1].kind, MicroInstrKind::LoadMemReg);
    }

    #[test]
    fn preserves_program_order_for_untouched_instructions() {
        let mut b = MicroInstrBuilder::new();
        b.nop();
        b.ret();
        let ctx = PassContext::new(CallConvKind::C);
        LegalizePass::new().run(&mut b, &ctx).unwrap();
        assert_eq!(b.instructions().len(), 2);
        assert_eq!(b.instructions()[0].kind, MicroInstrKind::Nop);
        assert_eq!(b.instructions()[1].kind, MicroInstrKind::Ret);
    }

    #[test]
    fn jump_patch_targets_remap_after_insertion() {
        let mut b = MicroInstrBuilder::new();
        let token = b.jump_cond(crate::reg::CondJump::Zero);
        b.op_binary_reg_imm(crate::reg::Op::Add, gpr::RAX, u64::MAX, OpBits::B64); // expands to 2 instrs
        b.patch_jump(token);
        let ctx = PassContext::new(CallConvKind::C);
        LegalizePass::new().run(&mut b, &ctx).unwrap();
        let store = b.operand_store();
        let patch = b
            .instructions()
            .iter()
            .find(|i| i.kind == MicroInstrKind::PatchJump)
            .unwrap();
        let dest = patch.operands(store)[1].as_u64() as u32;
        assert_eq!(dest, b.instructions().len() as u32 - 1);
    }
}
